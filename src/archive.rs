//! Version metadata embedded in uploaded plugin/theme archives.
//!
//! A plugin zip carries a PHP file with a `Plugin Name:` header block, a
//! theme zip carries `style.css` with `Theme Name:`. Both declare
//! `Version:`. Only the archive root and the first directory level are
//! searched, matching how packages are laid out (`slug/slug.php`).

use std::io::{Read, Seek};
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use zip::ZipArchive;

use crate::version::Version;

/// Header blocks live at the top of the file.
const HEADER_SCAN_BYTES: u64 = 8 * 1024;

static VERSION_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)^[ \t/*#@]*Version:\s*(\S+)").expect("valid header regex")
});

static PLUGIN_NAME_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)^[ \t/*#@]*Plugin Name:").expect("valid header regex")
});

static THEME_NAME_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)^[ \t/*#@]*Theme Name:").expect("valid header regex")
});

/// Read the declared version from an archive on disk. Any I/O or format
/// problem yields `None`; callers fall back to the file name.
pub fn version_from_path(path: &Path) -> Option<String> {
    let file = std::fs::File::open(path).ok()?;
    match version_from_reader(file) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(path = %path.display(), "archive metadata unreadable: {}", e);
            None
        }
    }
}

pub fn version_from_reader<R: Read + Seek>(reader: R) -> anyhow::Result<Option<String>> {
    let mut archive = ZipArchive::new(reader)?;

    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        if !entry.is_file() {
            continue;
        }

        let name = entry.name().to_string();
        let depth = name.matches('/').count();
        if depth > 1 {
            continue;
        }

        let file_name = name.rsplit('/').next().unwrap_or(&name);
        let is_theme = file_name.eq_ignore_ascii_case("style.css");
        let is_plugin = file_name.to_ascii_lowercase().ends_with(".php");
        if !is_theme && !is_plugin {
            continue;
        }

        let mut head = Vec::new();
        entry.take(HEADER_SCAN_BYTES).read_to_end(&mut head)?;
        let text = String::from_utf8_lossy(&head);

        let marker = if is_theme { &*THEME_NAME_HEADER } else { &*PLUGIN_NAME_HEADER };
        if !marker.is_match(&text) {
            continue;
        }

        if let Some(version) = VERSION_HEADER
            .captures(&text)
            .and_then(|c| c.get(1))
            .and_then(|m| Version::parse(m.as_str()))
        {
            return Ok(Some(version.as_str().to_string()));
        }
    }

    Ok(None)
}
