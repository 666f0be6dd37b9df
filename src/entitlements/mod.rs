//! Ownership and download-permission lookups.
//!
//! The storefront owns products, files and purchase grants. The feed only
//! asks three questions of it: what does this owner hold, which files does
//! a product ship, and where may the owner fetch one of them.

use std::path::PathBuf;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use url::Url;

use crate::models::package::ProductType;

pub mod memory;
pub mod postgres;

pub use memory::StaticEntitlements;
pub use postgres::PgEntitlements;

type HmacSha256 = Hmac<Sha256>;

/// Purchase grant that scopes a download link to one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadGrant {
    pub order_key: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnedProduct {
    pub product_id: i64,
    pub name: String,
    pub sku: String,
    pub product_type: ProductType,
    pub requires_wp: Option<String>,
    pub tested_up_to: Option<String>,
    pub grant: DownloadGrant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactFile {
    pub file_id: String,
    pub name: String,
    pub enabled: bool,
    /// Local path of the uploaded archive, when the server can read it.
    pub archive_path: Option<PathBuf>,
}

#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// One entry per distinct product the owner may download.
    async fn owned_products(&self, owner_id: &str) -> anyhow::Result<Vec<OwnedProduct>>;

    async fn owned_product_by_sku(
        &self,
        owner_id: &str,
        sku: &str,
    ) -> anyhow::Result<Option<OwnedProduct>>;

    /// Downloadable files in upload order.
    async fn product_files(&self, product_id: i64) -> anyhow::Result<Vec<ArtifactFile>>;

    /// Permission-scoped link for one file of an owned product.
    fn download_url(&self, product: &OwnedProduct, file_id: &str) -> String;
}

/// Signs storefront download links. The signature covers
/// `product_id|order_key|file_id` so a link cannot be replayed against
/// another order or file.
#[derive(Clone)]
pub struct LinkSigner {
    base: Url,
    key: Vec<u8>,
}

impl LinkSigner {
    pub fn new(base_url: &str, key: &str) -> anyhow::Result<Self> {
        Ok(Self {
            base: Url::parse(base_url)?,
            key: key.as_bytes().to_vec(),
        })
    }

    pub fn signature(&self, product_id: i64, order_key: &str, file_id: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC can take key of any size");
        mac.update(format!("{}|{}|{}", product_id, order_key, file_id).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn url(&self, product: &OwnedProduct, file_id: &str) -> String {
        let sig = self.signature(product.product_id, &product.grant.order_key, file_id);
        let mut url = self.base.clone();
        url.query_pairs_mut()
            .append_pair("download_file", &product.product_id.to_string())
            .append_pair("order", &product.grant.order_key)
            .append_pair("email", &product.grant.email)
            .append_pair("key", file_id)
            .append_pair("sig", &sig);
        url.into()
    }
}
