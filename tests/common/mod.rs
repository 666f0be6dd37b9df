//! Shared harness: the real router over in-process stores, bound to an
//! ephemeral port.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use update_server::cache::TieredCache;
use update_server::config::Config;
use update_server::entitlements::{ArtifactFile, LinkSigner, StaticEntitlements};
use update_server::models::package::ProductType;
use update_server::store::memory::MemoryStore;
use update_server::{api, AppState};

pub const ADMIN_KEY: &str = "test-admin-key";
pub const OWNER: &str = "owner-1";

pub struct TestServer {
    pub base: String,
    pub client: reqwest::Client,
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
    pub entitlements: Arc<StaticEntitlements>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Create a token for `owner` through the management API.
    pub async fn create_token(&self, owner: &str) -> String {
        let resp = self
            .client
            .post(self.url(&format!("/api/v1/owners/{}/tokens", owner)))
            .header("x-admin-key", ADMIN_KEY)
            .json(&serde_json::json!({ "name": "ci" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: serde_json::Value = resp.json().await.unwrap();
        body["token"].as_str().unwrap().to_string()
    }
}

pub fn test_config() -> Config {
    Config {
        admin_key: ADMIN_KEY.into(),
        download_base_url: "https://store.example.com/".into(),
        download_signing_key: "signing-key".into(),
        ..Config::default()
    }
}

pub async fn spawn() -> TestServer {
    spawn_with(test_config()).await
}

pub async fn spawn_with(config: Config) -> TestServer {
    let store = Arc::new(MemoryStore::new());
    let signer = LinkSigner::new(&config.download_base_url, &config.download_signing_key).unwrap();
    let entitlements = Arc::new(StaticEntitlements::new(signer));
    seed_catalog(&entitlements).await;

    let state = Arc::new(AppState::new(
        config,
        TieredCache::local_only(),
        store.clone(),
        store.clone(),
        entitlements.clone(),
    ));
    let app = api::build_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    TestServer {
        base: format!("http://{}", addr),
        client,
        state,
        store,
        entitlements,
    }
}

fn file(id: &str, name: &str) -> ArtifactFile {
    ArtifactFile {
        file_id: id.into(),
        name: name.into(),
        enabled: true,
        archive_path: None,
    }
}

/// One plugin with three versions and one theme, both owned by `OWNER`.
async fn seed_catalog(e: &StaticEntitlements) {
    e.add_product(10, "Domain Seller", "domain_seller", ProductType::Plugin, Some("5.3"))
        .await;
    e.add_product(20, "Starter Theme", "starter-theme", ProductType::Theme, None)
        .await;
    e.add_file(10, file("f-120", "domain-seller-1.2.0.zip")).await;
    e.add_file(10, file("f-1100", "domain-seller-1.10.0.zip")).await;
    e.add_file(10, file("f-120b", "domain-seller-1.2.0-beta.zip")).await;
    e.add_file(10, file("f-none", "domain-seller.zip")).await;
    e.add_file(20, file("t-200", "Starter Theme - 2.0.0")).await;
    e.grant(OWNER, 10, "wc_order_1", "owner@example.com").await;
    e.grant(OWNER, 20, "wc_order_2", "owner@example.com").await;
}
