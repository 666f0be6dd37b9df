//! Release version parsing and ordering.
//!
//! Versions look like `major.minor[.patch][-prerelease]`. Precedence:
//!
//! 1. `major`, `minor`, `patch` compared numerically (missing patch is 0).
//! 2. A release outranks every pre-release of the same numeric triple.
//! 3. Pre-release identifiers are compared dot-by-dot: numeric identifiers
//!    numerically, alphanumeric ones by ASCII order, numeric below
//!    alphanumeric. When all shared identifiers tie, the shorter list is lower.
//!
//! Anything that does not parse is not a version; callers drop it rather
//! than inventing a placeholder.

use std::cmp::Ordering;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

/// Core shape shared by every pattern below.
const VERSION_BODY: &str = r"\d+\.\d+(?:\.\d+)?(?:-[0-9A-Za-z]+(?:\.[0-9A-Za-z]+)*)?";

static FULL_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"^v?({VERSION_BODY})$")).expect("valid version regex")
});

/// `plugin-name-1.2.3.zip`, `plugin-name-v1.2.3.zip`
static ZIP_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)-v?({VERSION_BODY})\.zip$")).expect("valid zip suffix regex")
});

/// `Plugin Name - 1.2.3`
static DASHED_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i) - ({VERSION_BODY})$")).expect("valid dashed suffix regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
enum Identifier {
    Numeric(u64),
    Alpha(String),
}

impl Ord for Identifier {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Identifier::Numeric(a), Identifier::Numeric(b)) => a.cmp(b),
            (Identifier::Numeric(_), Identifier::Alpha(_)) => Ordering::Less,
            (Identifier::Alpha(_), Identifier::Numeric(_)) => Ordering::Greater,
            (Identifier::Alpha(a), Identifier::Alpha(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Identifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A parsed release version. Keeps the original text for display.
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    major: u64,
    minor: u64,
    patch: u64,
    pre: Vec<Identifier>,
}

impl Version {
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let caps = FULL_VERSION.captures(input)?;
        let body = caps.get(1)?.as_str();

        let (numbers, pre) = match body.split_once('-') {
            Some((n, p)) => (n, Some(p)),
            None => (body, None),
        };

        let mut parts = numbers.split('.').map(|p| p.parse::<u64>().ok());
        let major = parts.next()??;
        let minor = parts.next()??;
        let patch = parts.next().unwrap_or(Some(0))?;

        let pre = match pre {
            Some(p) => p
                .split('.')
                .map(|s| match s.parse::<u64>() {
                    Ok(n) if !s.starts_with('0') || s == "0" => Identifier::Numeric(n),
                    _ => Identifier::Alpha(s.to_string()),
                })
                .collect(),
            None => Vec::new(),
        };

        Some(Self {
            raw: input.to_string(),
            major,
            minor,
            patch,
            pre,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_prerelease(&self) -> bool {
        !self.pre.is_empty()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (self.pre.is_empty(), other.pre.is_empty()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => self.pre.cmp(&other.pre),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Equality follows precedence, so "1.2" == "1.2.0".
impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

/// Pull a version out of a download's file name.
pub fn from_filename(filename: &str) -> Option<String> {
    ZIP_SUFFIX
        .captures(filename)
        .or_else(|| DASHED_SUFFIX.captures(filename))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Sort newest first. Stable: equal versions keep their input order.
pub fn sort_descending<T>(items: &mut [T], key: impl Fn(&T) -> &Version) {
    items.sort_by(|a, b| key(b).cmp(key(a)));
}
