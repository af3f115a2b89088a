//! URL rewrite table.
//!
//! Maps resolved physical locations to a faster local equivalent before
//! transfer, e.g. `gsiftp://se.example.org/data/` to `file:///mnt/data/`
//! or to a `link:` URL when the file can be linked into place instead of
//! copied.

use url::Url;

#[derive(Debug, Clone)]
struct MapEntry {
    template: String,
    replacement: String,
}

/// Ordered prefix-rewrite table for resolved locations.
#[derive(Debug, Clone, Default)]
pub struct UrlMap {
    entries: Vec<MapEntry>,
}

impl UrlMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rewrite rule. URLs starting with `template` have that prefix
    /// replaced by `replacement`.
    pub fn add(&mut self, template: &Url, replacement: &Url) {
        self.entries.push(MapEntry {
            template: template.as_str().to_owned(),
            replacement: replacement.as_str().to_owned(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rewrite `url` if a template matches. The longest matching template
    /// wins so more specific rules can shadow general ones.
    pub fn map(&self, url: &Url) -> Option<Url> {
        let s = url.as_str();
        let best = self
            .entries
            .iter()
            .filter(|e| s.starts_with(&e.template))
            .max_by_key(|e| e.template.len())?;
        let rewritten = format!("{}{}", best.replacement, &s[best.template.len()..]);
        match Url::parse(&rewritten) {
            Ok(mapped) => Some(mapped),
            Err(err) => {
                tracing::warn!(url = %url, rewritten = %rewritten, error = %err, "URL mapping produced an unparsable URL");
                None
            }
        }
    }

    /// True if `url` would be rewritten by this map.
    pub fn matches(&self, url: &Url) -> bool {
        let s = url.as_str();
        self.entries.iter().any(|e| s.starts_with(&e.template))
    }
}
