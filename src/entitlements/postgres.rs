use std::path::PathBuf;

use async_trait::async_trait;

use super::{ArtifactFile, DownloadGrant, EntitlementStore, LinkSigner, OwnedProduct};
use crate::models::package::ProductType;
use crate::store::postgres::{OwnedProductRow, PgStore, ProductFileRow};

/// Entitlements read from the catalog tables.
#[derive(Clone)]
pub struct PgEntitlements {
    db: PgStore,
    signer: LinkSigner,
}

impl PgEntitlements {
    pub fn new(db: PgStore, signer: LinkSigner) -> Self {
        Self { db, signer }
    }
}

impl From<OwnedProductRow> for OwnedProduct {
    fn from(row: OwnedProductRow) -> Self {
        let product_type =
            ProductType::classify(row.tags.iter().map(String::as_str), row.software_type.as_deref());
        Self {
            product_id: row.id,
            name: row.name,
            sku: row.sku,
            product_type,
            requires_wp: row.requires_wp.filter(|s| !s.trim().is_empty()),
            tested_up_to: row.tested_up_to.filter(|s| !s.trim().is_empty()),
            grant: DownloadGrant {
                order_key: row.order_key,
                email: row.user_email,
            },
        }
    }
}

impl From<ProductFileRow> for ArtifactFile {
    fn from(row: ProductFileRow) -> Self {
        // Only plain filesystem paths are readable here; remote URLs fall
        // back to filename parsing.
        let archive_path = (!row.file_path.is_empty() && !row.file_path.contains("://"))
            .then(|| PathBuf::from(&row.file_path));
        Self {
            file_id: row.file_id,
            name: row.name,
            enabled: row.enabled,
            archive_path,
        }
    }
}

#[async_trait]
impl EntitlementStore for PgEntitlements {
    async fn owned_products(&self, owner_id: &str) -> anyhow::Result<Vec<OwnedProduct>> {
        let rows = self.db.list_owned_products(owner_id).await?;
        Ok(rows.into_iter().map(OwnedProduct::from).collect())
    }

    async fn owned_product_by_sku(
        &self,
        owner_id: &str,
        sku: &str,
    ) -> anyhow::Result<Option<OwnedProduct>> {
        let row = self.db.get_owned_product_by_sku(owner_id, sku).await?;
        Ok(row.map(OwnedProduct::from))
    }

    async fn product_files(&self, product_id: i64) -> anyhow::Result<Vec<ArtifactFile>> {
        let rows = self.db.list_product_files(product_id).await?;
        Ok(rows.into_iter().map(ArtifactFile::from).collect())
    }

    fn download_url(&self, product: &OwnedProduct, file_id: &str) -> String {
        self.signer.url(product, file_id)
    }
}
