use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ArtifactFile, DownloadGrant, EntitlementStore, LinkSigner, OwnedProduct};
use crate::models::package::ProductType;

#[derive(Debug, Clone)]
struct CatalogProduct {
    id: i64,
    name: String,
    sku: String,
    product_type: ProductType,
    requires_wp: Option<String>,
    tested_up_to: Option<String>,
}

/// In-process catalog for tests and local development. Mutations go
/// through `&self` so a shared instance can be edited while the server
/// runs (e.g. to simulate a new upload).
pub struct StaticEntitlements {
    signer: LinkSigner,
    products: RwLock<Vec<CatalogProduct>>,
    files: RwLock<HashMap<i64, Vec<ArtifactFile>>>,
    grants: RwLock<Vec<(String, i64, DownloadGrant)>>,
}

impl StaticEntitlements {
    pub fn new(signer: LinkSigner) -> Self {
        Self {
            signer,
            products: RwLock::new(Vec::new()),
            files: RwLock::new(HashMap::new()),
            grants: RwLock::new(Vec::new()),
        }
    }

    pub async fn add_product(
        &self,
        id: i64,
        name: &str,
        sku: &str,
        product_type: ProductType,
        requires_wp: Option<&str>,
    ) {
        self.products.write().await.push(CatalogProduct {
            id,
            name: name.to_string(),
            sku: sku.to_string(),
            product_type,
            requires_wp: requires_wp.map(String::from),
            tested_up_to: None,
        });
    }

    /// Append a file. Order of calls is upload order.
    pub async fn add_file(&self, product_id: i64, file: ArtifactFile) {
        self.files
            .write()
            .await
            .entry(product_id)
            .or_default()
            .push(file);
    }

    pub async fn grant(&self, owner_id: &str, product_id: i64, order_key: &str, email: &str) {
        self.grants.write().await.push((
            owner_id.to_string(),
            product_id,
            DownloadGrant {
                order_key: order_key.to_string(),
                email: email.to_string(),
            },
        ));
    }

    fn owned(product: &CatalogProduct, grant: &DownloadGrant) -> OwnedProduct {
        OwnedProduct {
            product_id: product.id,
            name: product.name.clone(),
            sku: product.sku.clone(),
            product_type: product.product_type,
            requires_wp: product.requires_wp.clone(),
            tested_up_to: product.tested_up_to.clone(),
            grant: grant.clone(),
        }
    }
}

#[async_trait]
impl EntitlementStore for StaticEntitlements {
    async fn owned_products(&self, owner_id: &str) -> anyhow::Result<Vec<OwnedProduct>> {
        let products = self.products.read().await;
        let grants = self.grants.read().await;

        // First grant wins per product, products in id order.
        let mut seen: HashMap<i64, &DownloadGrant> = HashMap::new();
        for (owner, product_id, grant) in grants.iter() {
            if owner == owner_id {
                seen.entry(*product_id).or_insert(grant);
            }
        }

        let mut out: Vec<OwnedProduct> = products
            .iter()
            .filter_map(|p| seen.get(&p.id).map(|g| Self::owned(p, g)))
            .collect();
        out.sort_by_key(|p| p.product_id);
        Ok(out)
    }

    async fn owned_product_by_sku(
        &self,
        owner_id: &str,
        sku: &str,
    ) -> anyhow::Result<Option<OwnedProduct>> {
        Ok(self
            .owned_products(owner_id)
            .await?
            .into_iter()
            .find(|p| p.sku == sku))
    }

    async fn product_files(&self, product_id: i64) -> anyhow::Result<Vec<ArtifactFile>> {
        Ok(self
            .files
            .read()
            .await
            .get(&product_id)
            .cloned()
            .unwrap_or_default())
    }

    fn download_url(&self, product: &OwnedProduct, file_id: &str) -> String {
        self.signer.url(product, file_id)
    }
}
