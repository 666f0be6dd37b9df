//! Composer repository feed.
//!
//! `packages.json` lists, per owned product, every enabled file whose
//! version can be determined, newest first. Versions come from the
//! archive's own header when the file is readable locally, otherwise from
//! the file name. Files with neither are left out.

use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;

use crate::archive;
use crate::cache::TieredCache;
use crate::config::Config;
use crate::entitlements::{ArtifactFile, EntitlementStore, OwnedProduct};
use crate::models::package::{Dist, Manifest, PackageVersion, ProductVersion};
use crate::version::{self, Version};

const PHP_REQUIREMENT: &str = ">=7.4";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("not found")]
    NotFound,

    #[error("entitlement lookup failed: {0}")]
    Entitlements(#[from] anyhow::Error),
}

pub struct PackageFeed {
    entitlements: Arc<dyn EntitlementStore>,
    cache: TieredCache,
    vendor_prefix: String,
    core_package: String,
    cache_ttl_secs: u64,
}

impl PackageFeed {
    pub fn new(entitlements: Arc<dyn EntitlementStore>, cache: TieredCache, config: &Config) -> Self {
        Self {
            entitlements,
            cache,
            vendor_prefix: config.vendor_prefix.clone(),
            core_package: config.core_package.clone(),
            cache_ttl_secs: config.version_cache_ttl_secs,
        }
    }

    /// `vendor/slug`, where the slug is the lowercased SKU with
    /// underscores turned into hyphens. `None` for a blank SKU.
    pub fn package_name(&self, sku: &str) -> Option<String> {
        let sku = sku.trim();
        if sku.is_empty() {
            return None;
        }
        Some(format!("{}/{}", self.vendor_prefix, sku.replace('_', "-").to_lowercase()))
    }

    pub async fn build_feed(&self, owner_id: &str) -> Result<Manifest, FeedError> {
        let products = self.entitlements.owned_products(owner_id).await?;
        let mut manifest = Manifest::default();

        for product in &products {
            let Some(name) = self.package_name(&product.sku) else {
                tracing::debug!(product_id = product.product_id, "skipping product without sku");
                continue;
            };

            let versions = self.product_versions(product.product_id).await?;
            let mut entries = IndexMap::with_capacity(versions.len());
            for v in &versions {
                entries.insert(v.version.clone(), self.entry(&name, product, v));
            }
            manifest.packages.insert(name, entries);
        }

        tracing::debug!(owner = %owner_id, packages = manifest.packages.len(), "built package feed");
        Ok(manifest)
    }

    fn entry(&self, name: &str, product: &OwnedProduct, v: &ProductVersion) -> PackageVersion {
        let mut require = IndexMap::new();
        require.insert("php".to_string(), PHP_REQUIREMENT.to_string());
        if let Some(wp) = &product.requires_wp {
            require.insert(self.core_package.clone(), format!(">={}", wp));
        }

        PackageVersion {
            name: name.to_string(),
            version: v.version.clone(),
            kind: product.product_type.composer_type().to_string(),
            dist: Dist {
                url: self.entitlements.download_url(product, &v.file_id),
                kind: "zip".to_string(),
            },
            require,
        }
    }

    /// Versions of one product, newest first. Cached per product.
    pub async fn product_versions(&self, product_id: i64) -> Result<Vec<ProductVersion>, FeedError> {
        let key = cache_key(product_id);
        if let Some(cached) = self.cache.get::<Vec<ProductVersion>>(&key).await {
            return Ok(cached);
        }

        let files = self.entitlements.product_files(product_id).await?;
        let versions = resolve_versions(product_id, files).await;

        if let Err(e) = self.cache.set(&key, &versions, self.cache_ttl_secs).await {
            tracing::warn!(product_id, "failed to cache product versions: {}", e);
        }
        Ok(versions)
    }

    /// Drop the cached version list after the product's files change.
    pub async fn invalidate(&self, product_id: i64) -> Result<(), FeedError> {
        self.cache.invalidate(&cache_key(product_id)).await?;
        tracing::info!(product_id, "product version cache invalidated");
        Ok(())
    }

    pub async fn latest_version(
        &self,
        product_id: i64,
        include_prerelease: bool,
    ) -> Result<Option<ProductVersion>, FeedError> {
        let versions = self.product_versions(product_id).await?;
        Ok(pick_latest(versions, include_prerelease))
    }

    /// Download link for `version` (or `latest`) of a product the owner
    /// holds. Unknown SKU, unowned product and unknown version are all
    /// `NotFound`.
    pub async fn download_url_for(
        &self,
        owner_id: &str,
        sku: &str,
        requested: &str,
        include_prerelease: bool,
    ) -> Result<String, FeedError> {
        let product = self
            .entitlements
            .owned_product_by_sku(owner_id, sku)
            .await?
            .ok_or(FeedError::NotFound)?;

        let chosen = if requested.eq_ignore_ascii_case("latest") {
            self.latest_version(product.product_id, include_prerelease)
                .await?
        } else {
            let wanted = Version::parse(requested).ok_or(FeedError::NotFound)?;
            self.product_versions(product.product_id)
                .await?
                .into_iter()
                .find(|v| Version::parse(&v.version).as_ref() == Some(&wanted))
        };

        let chosen = chosen.ok_or(FeedError::NotFound)?;
        Ok(self.entitlements.download_url(&product, &chosen.file_id))
    }
}

fn cache_key(product_id: i64) -> String {
    format!("versions:{}", product_id)
}

fn pick_latest(versions: Vec<ProductVersion>, include_prerelease: bool) -> Option<ProductVersion> {
    versions.into_iter().find(|v| {
        include_prerelease || Version::parse(&v.version).map_or(false, |p| !p.is_prerelease())
    })
}

/// Read archive headers off the async runtime, fall back to the file
/// name, and sort newest first.
async fn resolve_versions(product_id: i64, files: Vec<ArtifactFile>) -> Vec<ProductVersion> {
    let files: Vec<ArtifactFile> = files.into_iter().filter(|f| f.enabled).collect();
    let paths: Vec<Option<PathBuf>> = files.iter().map(|f| f.archive_path.clone()).collect();

    let from_archives = if paths.iter().any(Option::is_some) {
        tokio::task::spawn_blocking(move || {
            paths
                .iter()
                .map(|p| p.as_deref().and_then(archive::version_from_path))
                .collect::<Vec<_>>()
        })
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(product_id, "archive inspection task failed: {}", e);
            Vec::new()
        })
    } else {
        Vec::new()
    };

    let mut resolved: Vec<(Version, ProductVersion)> = Vec::with_capacity(files.len());
    for (i, file) in files.into_iter().enumerate() {
        let raw = from_archives
            .get(i)
            .cloned()
            .flatten()
            .or_else(|| version::from_filename(&file.name));

        let Some(parsed) = raw.as_deref().and_then(Version::parse) else {
            tracing::debug!(product_id, file = %file.name, "no version for file, excluded from feed");
            continue;
        };

        resolved.push((
            parsed.clone(),
            ProductVersion {
                product_id,
                version: parsed.as_str().to_string(),
                file_id: file.file_id,
                file_name: file.name,
            },
        ));
    }

    version::sort_descending(&mut resolved, |(v, _)| v);
    resolved.into_iter().map(|(_, pv)| pv).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlements::{LinkSigner, StaticEntitlements};
    use crate::models::package::ProductType;
    use std::io::Write;

    fn file(id: &str, name: &str) -> ArtifactFile {
        ArtifactFile {
            file_id: id.into(),
            name: name.into(),
            enabled: true,
            archive_path: None,
        }
    }

    async fn fixture() -> (PackageFeed, Arc<StaticEntitlements>) {
        let signer = LinkSigner::new("https://store.example.com/", "k").unwrap();
        let ents = Arc::new(StaticEntitlements::new(signer));
        ents.add_product(1, "Domain Seller", "domain_seller", ProductType::Plugin, Some("5.3"))
            .await;
        ents.add_product(2, "Starter", "Starter_Theme", ProductType::Theme, None)
            .await;
        ents.add_product(3, "Nameless", "  ", ProductType::Plugin, None).await;
        ents.add_product(4, "Not owned", "other", ProductType::Plugin, None).await;

        ents.add_file(1, file("a", "domain-seller-1.2.0.zip")).await;
        ents.add_file(1, file("b", "domain-seller-1.10.0.zip")).await;
        ents.add_file(1, file("c", "domain-seller-1.2.0-beta.zip")).await;
        ents.add_file(1, file("d", "domain-seller.zip")).await;
        ents.add_file(1, ArtifactFile { enabled: false, ..file("e", "domain-seller-9.0.0.zip") })
            .await;
        ents.add_file(2, file("t", "Starter Theme - 2.0.0-rc1")).await;
        ents.add_file(3, file("n", "nameless-1.0.0.zip")).await;

        for pid in [1, 2, 3] {
            ents.grant("owner-1", pid, "wc_order_1", "o@example.com").await;
        }

        let feed = PackageFeed::new(ents.clone(), TieredCache::local_only(), &Config::default());
        (feed, ents)
    }

    #[test]
    fn test_package_name() {
        let feed = PackageFeed::new(
            Arc::new(StaticEntitlements::new(LinkSigner::new("https://s/", "k").unwrap())),
            TieredCache::local_only(),
            &Config::default(),
        );
        assert_eq!(
            feed.package_name("Domain_Seller").as_deref(),
            Some("ultimate-multisite/domain-seller")
        );
        assert_eq!(feed.package_name(""), None);
    }

    #[tokio::test]
    async fn test_feed_orders_versions_descending() {
        let (feed, _) = fixture().await;
        let manifest = feed.build_feed("owner-1").await.unwrap();

        let plugin = &manifest.packages["ultimate-multisite/domain-seller"];
        let order: Vec<&str> = plugin.keys().map(String::as_str).collect();
        assert_eq!(order, vec!["1.10.0", "1.2.0", "1.2.0-beta"]);

        let entry = &plugin["1.10.0"];
        assert_eq!(entry.kind, "wordpress-plugin");
        assert_eq!(entry.dist.kind, "zip");
        assert!(entry.dist.url.contains("key=b"));
        assert_eq!(entry.require["php"], ">=7.4");
        assert_eq!(entry.require["wordpress/core"], ">=5.3");
    }

    #[tokio::test]
    async fn test_feed_covers_only_owned_named_products() {
        let (feed, _) = fixture().await;
        let manifest = feed.build_feed("owner-1").await.unwrap();
        let names: Vec<&str> = manifest.packages.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            vec!["ultimate-multisite/domain-seller", "ultimate-multisite/starter-theme"]
        );

        let theme = &manifest.packages["ultimate-multisite/starter-theme"]["2.0.0-rc1"];
        assert_eq!(theme.kind, "wordpress-theme");
        assert!(!theme.require.contains_key("wordpress/core"));

        assert!(feed.build_feed("nobody").await.unwrap().packages.is_empty());
    }

    #[tokio::test]
    async fn test_manifest_serializes_in_order() {
        let (feed, _) = fixture().await;
        let manifest = feed.build_feed("owner-1").await.unwrap();
        let json = serde_json::to_string(&manifest).unwrap();
        let newest = json.find("\"1.10.0\"").unwrap();
        let older = json.find("\"1.2.0\"").unwrap();
        assert!(newest < older);
        assert!(json.contains(r#""dist":{"url":"#));
    }

    #[tokio::test]
    async fn test_versions_are_cached_until_invalidated() {
        let (feed, ents) = fixture().await;
        assert_eq!(feed.product_versions(2).await.unwrap().len(), 1);

        ents.add_file(2, file("t2", "Starter Theme - 2.1.0")).await;
        assert_eq!(feed.product_versions(2).await.unwrap().len(), 1);

        feed.invalidate(2).await.unwrap();
        let versions = feed.product_versions(2).await.unwrap();
        assert_eq!(versions[0].version, "2.1.0");
        assert_eq!(versions.len(), 2);
    }

    #[tokio::test]
    async fn test_latest_skips_prereleases_unless_asked() {
        let (feed, ents) = fixture().await;
        ents.add_file(1, file("f", "domain-seller-2.0.0-rc.1.zip")).await;

        let stable = feed.latest_version(1, false).await.unwrap().unwrap();
        assert_eq!(stable.version, "1.10.0");
        let any = feed.latest_version(1, true).await.unwrap().unwrap();
        assert_eq!(any.version, "2.0.0-rc.1");

        // only a pre-release available
        assert!(feed.latest_version(2, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_download_url_lookup() {
        let (feed, _) = fixture().await;
        let url = feed.download_url_for("owner-1", "domain_seller", "1.2", false).await.unwrap();
        assert!(url.contains("key=a"));
        let latest = feed
            .download_url_for("owner-1", "domain_seller", "latest", false)
            .await
            .unwrap();
        assert!(latest.contains("key=b"));

        for (owner, sku, v) in [
            ("owner-1", "domain_seller", "3.0.0"),
            ("owner-1", "domain_seller", "junk"),
            ("owner-1", "other", "latest"),
            ("owner-2", "domain_seller", "latest"),
        ] {
            assert!(matches!(
                feed.download_url_for(owner, sku, v, false).await,
                Err(FeedError::NotFound)
            ));
        }
    }

    #[tokio::test]
    async fn test_archive_header_beats_file_name() {
        use zip::write::SimpleFileOptions;

        let path = std::env::temp_dir().join(format!("feed-{}.zip", uuid::Uuid::new_v4()));
        {
            let mut zip = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
            zip.start_file("addon/addon.php", SimpleFileOptions::default()).unwrap();
            zip.write_all(b"<?php\n/*\n * Plugin Name: Addon\n * Version: 3.1.4\n */\n")
                .unwrap();
            zip.finish().unwrap();
        }

        let files = vec![
            ArtifactFile {
                archive_path: Some(path.clone()),
                ..file("z", "addon-1.0.0.zip")
            },
            ArtifactFile {
                archive_path: Some(PathBuf::from("/nonexistent/addon.zip")),
                ..file("y", "addon-0.9.0.zip")
            },
        ];
        let versions = resolve_versions(9, files).await;
        std::fs::remove_file(&path).ok();

        let got: Vec<&str> = versions.iter().map(|v| v.version.as_str()).collect();
        assert_eq!(got, vec!["3.1.4", "0.9.0"]);
    }
}
