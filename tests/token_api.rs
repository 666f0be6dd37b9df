//! Management API for Composer tokens.

mod common;

use common::{spawn, TestServer, ADMIN_KEY, OWNER};
use serde_json::{json, Value};

async fn post_token(srv: &TestServer, owner: &str, body: Value) -> reqwest::Response {
    srv.client
        .post(srv.url(&format!("/api/v1/owners/{}/tokens", owner)))
        .header("x-admin-key", ADMIN_KEY)
        .json(&body)
        .send()
        .await
        .unwrap()
}

async fn revoke(srv: &TestServer, owner: &str, body: Value) -> reqwest::Response {
    srv.client
        .post(srv.url(&format!("/api/v1/owners/{}/tokens/revoke", owner)))
        .header("x-admin-key", ADMIN_KEY)
        .json(&body)
        .send()
        .await
        .unwrap()
}

mod auth_tests {
    use super::*;

    #[tokio::test]
    async fn test_admin_key_required() {
        let srv = spawn().await;
        let url = srv.url(&format!("/api/v1/owners/{}/tokens", OWNER));

        let resp = srv.client.get(&url).send().await.unwrap();
        assert_eq!(resp.status(), 401);

        let resp = srv
            .client
            .get(&url)
            .header("x-admin-key", "wrong")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        let resp = srv.client.get(&url).bearer_auth(ADMIN_KEY).send().await.unwrap();
        assert_eq!(resp.status(), 200);
    }
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_returns_secret_once_and_lists_without_it() {
        let srv = spawn().await;
        let resp = post_token(&srv, OWNER, json!({ "name": "laptop" })).await;
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();

        let secret = body["token"].as_str().unwrap();
        assert!(secret.starts_with("wu_tk_"));
        assert_eq!(secret.len(), 38);
        assert_eq!(body["prefix"].as_str().unwrap(), &secret[..10]);

        let tokens = body["tokens"].as_array().unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0]["name"], "laptop");
        assert!(tokens[0].get("token_hash").is_none());
        assert!(!tokens[0].to_string().contains(&secret[6..]));
    }

    #[tokio::test]
    async fn test_empty_body_uses_default_name() {
        let srv = spawn().await;
        let resp = srv
            .client
            .post(srv.url(&format!("/api/v1/owners/{}/tokens", OWNER)))
            .header("x-admin-key", ADMIN_KEY)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["tokens"][0]["name"], "Default");
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected() {
        let srv = spawn().await;
        let resp = post_token(&srv, OWNER, json!({ "name": 5 })).await;
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "invalid_json");

        let list: Value = srv
            .client
            .get(srv.url(&format!("/api/v1/owners/{}/tokens", OWNER)))
            .header("x-admin-key", ADMIN_KEY)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list["tokens"], json!([]));
    }

    #[tokio::test]
    async fn test_quota_of_ten_active_tokens() {
        let srv = spawn().await;
        let mut secrets = Vec::new();
        for i in 0..10 {
            let resp = post_token(&srv, OWNER, json!({ "name": format!("t{}", i) })).await;
            assert_eq!(resp.status(), 201);
            let body: Value = resp.json().await.unwrap();
            secrets.push(body["token"].as_str().unwrap().to_string());
        }

        let resp = post_token(&srv, OWNER, json!({})).await;
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "quota_exceeded");

        for (i, secret) in secrets.iter().enumerate() {
            let resp = srv
                .client
                .get(srv.url("/packages.json"))
                .header("x-forwarded-for", format!("203.0.113.{}", i + 1))
                .bearer_auth(secret)
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 200);
        }
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent_and_scoped_to_owner() {
        let srv = spawn().await;
        let body: Value = post_token(&srv, OWNER, json!({})).await.json().await.unwrap();
        let id = body["tokens"][0]["id"].as_i64().unwrap();

        let resp = revoke(&srv, "someone-else", json!({ "token_id": id })).await;
        assert_eq!(resp.status(), 400);
        let err: Value = resp.json().await.unwrap();
        assert_eq!(err["error"]["code"], "invalid_token_id");

        for _ in 0..2 {
            let resp = revoke(&srv, OWNER, json!({ "token_id": id.to_string() })).await;
            assert_eq!(resp.status(), 200);
            let body: Value = resp.json().await.unwrap();
            assert_eq!(body["tokens"], json!([]));
        }

        let all: Value = srv
            .client
            .get(srv.url(&format!("/api/v1/owners/{}/tokens?include_revoked=true", OWNER)))
            .header("x-admin-key", ADMIN_KEY)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(all["tokens"].as_array().unwrap().len(), 1);
        assert!(!all["tokens"][0]["revoked_at"].is_null());
    }

    #[tokio::test]
    async fn test_revoke_requires_token_id() {
        let srv = spawn().await;
        let resp = revoke(&srv, OWNER, json!({ "token_id": "abc" })).await;
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "invalid_token_id");
    }
}
