use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductType {
    Plugin,
    Theme,
}

impl ProductType {
    /// Composer package type.
    pub fn composer_type(&self) -> &'static str {
        match self {
            ProductType::Plugin => "wordpress-plugin",
            ProductType::Theme => "wordpress-theme",
        }
    }

    /// Themes are tagged `theme`/`themes` or carry a `theme` software type.
    pub fn classify<'a>(tags: impl IntoIterator<Item = &'a str>, software_type: Option<&str>) -> Self {
        let tagged = tags
            .into_iter()
            .any(|t| t.eq_ignore_ascii_case("theme") || t.eq_ignore_ascii_case("themes"));
        if tagged || software_type == Some("theme") {
            ProductType::Theme
        } else {
            ProductType::Plugin
        }
    }
}

/// One downloadable version of a product, derived per request (and cached)
/// from the product's file list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductVersion {
    pub product_id: i64,
    pub version: String,
    pub file_id: String,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dist {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageVersion {
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub dist: Dist,
    pub require: IndexMap<String, String>,
}

/// Composer `packages.json`: package name -> version -> entry. Insertion
/// order is preserved so versions serialize newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub packages: IndexMap<String, IndexMap<String, PackageVersion>>,
}
