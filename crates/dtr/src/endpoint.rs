//! Endpoint abstraction.
//!
//! A DTR endpoint is polymorphic over a small capability set: whether it is
//! an index (catalog) service with multiple physical replicas, whether it
//! needs an explicit staging step before a transport URL is usable, whether
//! it is local, and so on. The scheduler only ever talks to endpoints
//! through this trait; the real protocol clients live behind the stage
//! workers.

use std::fmt;

use url::Url;

use crate::urlmap::UrlMap;

/// Expected access latency of the current replica, known after querying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessLatency {
    #[default]
    Small,
    /// Long-latency storage such as tape; the scheduler prefers another
    /// replica when one exists.
    Large,
}

pub trait Endpoint: fmt::Debug + Send {
    /// Logical URL of the endpoint as submitted.
    fn url(&self) -> &Url;

    /// Physical location currently selected for transfer.
    fn current_location(&self) -> &Url;

    /// True for catalog-backed endpoints with possibly several replicas.
    fn is_index(&self) -> bool {
        false
    }

    /// True if a prepare/pin step is needed before a transport URL exists.
    fn is_stageable(&self) -> bool {
        false
    }

    /// True if users cannot modify the data behind this endpoint.
    fn read_only(&self) -> bool {
        true
    }

    /// True for endpoints on the local filesystem.
    fn is_local(&self) -> bool {
        self.url().scheme() == "file"
    }

    fn access_latency(&self) -> AccessLatency {
        AccessLatency::Small
    }

    /// Order candidate replicas by preference. Locations matching
    /// `preferred_pattern` sort first, then locations the URL map would
    /// rewrite to a local path.
    fn sort_locations(&mut self, _preferred_pattern: &str, _map: &UrlMap) {}

    /// Advance to the next replica. Returns false when exhausted.
    fn next_location(&mut self) -> bool {
        false
    }

    /// True when no further replica remains after the current one.
    fn last_location(&self) -> bool {
        true
    }

    /// Forget resolved replicas, e.g. before a full retry.
    fn clear_locations(&mut self) {}

    /// Record a resolved replica. Returns false for non-index endpoints.
    fn add_location(&mut self, _url: Url) -> bool {
        false
    }

    /// Transport URLs obtained from staging, empty before staging.
    fn transfer_locations(&self) -> Vec<Url> {
        Vec::new()
    }

    /// URL option lookup, e.g. `overwrite=yes`.
    fn option(&self, key: &str) -> Option<String> {
        self.url()
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }
}

/// Endpoint with a single physical location and no catalog behind it.
#[derive(Debug, Clone)]
pub struct PlainEndpoint {
    url: Url,
    stageable: bool,
    read_only: bool,
    latency: AccessLatency,
    transfer_locations: Vec<Url>,
}

impl PlainEndpoint {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            stageable: false,
            read_only: true,
            latency: AccessLatency::Small,
            transfer_locations: Vec::new(),
        }
    }

    pub fn stageable(mut self) -> Self {
        self.stageable = true;
        self
    }

    pub fn writable(mut self) -> Self {
        self.read_only = false;
        self
    }

    pub fn with_latency(mut self, latency: AccessLatency) -> Self {
        self.latency = latency;
        self
    }

    /// Record transport URLs, normally done by the staging step.
    pub fn set_transfer_locations(&mut self, turls: Vec<Url>) {
        self.transfer_locations = turls;
    }
}

impl Endpoint for PlainEndpoint {
    fn url(&self) -> &Url {
        &self.url
    }

    fn current_location(&self) -> &Url {
        &self.url
    }

    fn is_stageable(&self) -> bool {
        self.stageable
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn access_latency(&self) -> AccessLatency {
        self.latency
    }

    fn transfer_locations(&self) -> Vec<Url> {
        self.transfer_locations.clone()
    }
}

/// One resolved replica of an index endpoint.
#[derive(Debug, Clone)]
pub struct Replica {
    pub url: Url,
    pub latency: AccessLatency,
}

impl Replica {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            latency: AccessLatency::Small,
        }
    }

    pub fn with_latency(mut self, latency: AccessLatency) -> Self {
        self.latency = latency;
        self
    }
}

/// Catalog-backed endpoint whose physical replicas are resolved at runtime.
#[derive(Debug, Clone)]
pub struct IndexEndpoint {
    url: Url,
    replicas: Vec<Replica>,
    cursor: usize,
    stageable: bool,
}

impl IndexEndpoint {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            replicas: Vec::new(),
            cursor: 0,
            stageable: false,
        }
    }

    pub fn with_replicas(mut self, replicas: Vec<Replica>) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn stageable(mut self) -> Self {
        self.stageable = true;
        self
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }
}

impl Endpoint for IndexEndpoint {
    fn url(&self) -> &Url {
        &self.url
    }

    fn current_location(&self) -> &Url {
        self.replicas
            .get(self.cursor)
            .map(|r| &r.url)
            .unwrap_or(&self.url)
    }

    fn is_index(&self) -> bool {
        true
    }

    fn is_stageable(&self) -> bool {
        self.stageable
    }

    fn is_local(&self) -> bool {
        self.current_location().scheme() == "file"
    }

    fn access_latency(&self) -> AccessLatency {
        self.replicas
            .get(self.cursor)
            .map(|r| r.latency)
            .unwrap_or_default()
    }

    fn sort_locations(&mut self, preferred_pattern: &str, map: &UrlMap) {
        let pattern_rank = |r: &Replica| {
            let host_match =
                !preferred_pattern.is_empty() && r.url.as_str().contains(preferred_pattern);
            // preferred hosts first, then mapped (local) replicas
            (!host_match, !map.matches(&r.url))
        };
        self.replicas.sort_by_key(pattern_rank);
        self.cursor = 0;
    }

    fn next_location(&mut self) -> bool {
        if self.cursor + 1 < self.replicas.len() {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    fn last_location(&self) -> bool {
        self.cursor + 1 >= self.replicas.len()
    }

    fn clear_locations(&mut self) {
        self.replicas.clear();
        self.cursor = 0;
    }

    fn add_location(&mut self, url: Url) -> bool {
        self.replicas.push(Replica::new(url));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn plain_endpoint_capabilities() {
        let ep = PlainEndpoint::new(url("gsiftp://se.example.org/data/f"));
        assert!(!ep.is_index());
        assert!(!ep.is_stageable());
        assert!(ep.read_only());
        assert!(!ep.is_local());
        assert!(ep.last_location());
        assert!(ep.transfer_locations().is_empty());

        let local = PlainEndpoint::new(url("file:///tmp/f")).stageable().writable();
        assert!(local.is_local());
        assert!(local.is_stageable());
        assert!(!local.read_only());
    }

    #[test]
    fn overwrite_option_from_query() {
        let ep = PlainEndpoint::new(url("gsiftp://se.example.org/f?overwrite=yes"));
        assert_eq!(ep.option("overwrite").as_deref(), Some("yes"));
        assert_eq!(ep.option("missing"), None);
    }

    #[test]
    fn index_endpoint_replica_iteration() {
        let mut ep = IndexEndpoint::new(url("lfc://catalog.example.org/lfn/f")).with_replicas(vec![
            Replica::new(url("gsiftp://a.example.org/f")),
            Replica::new(url("gsiftp://b.example.org/f")),
            Replica::new(url("gsiftp://c.example.org/f")),
        ]);
        assert!(ep.is_index());
        assert_eq!(ep.current_location().as_str(), "gsiftp://a.example.org/f");
        assert!(!ep.last_location());
        assert!(ep.next_location());
        assert!(ep.next_location());
        assert!(ep.last_location());
        assert!(!ep.next_location());
        assert_eq!(ep.current_location().as_str(), "gsiftp://c.example.org/f");
    }

    #[test]
    fn sort_locations_prefers_pattern_then_mapped() {
        let mut map = UrlMap::new();
        map.add(&url("gsiftp://b.example.org/"), &url("file:///mnt/b/"));
        let mut ep = IndexEndpoint::new(url("lfc://catalog.example.org/lfn/f")).with_replicas(vec![
            Replica::new(url("gsiftp://a.example.org/f")),
            Replica::new(url("gsiftp://b.example.org/f")),
            Replica::new(url("gsiftp://preferred.example.org/f")),
        ]);
        ep.sort_locations("preferred.example.org", &map);
        assert_eq!(
            ep.current_location().as_str(),
            "gsiftp://preferred.example.org/f"
        );
        assert!(ep.next_location());
        assert_eq!(ep.current_location().as_str(), "gsiftp://b.example.org/f");
    }

    #[test]
    fn cleared_index_falls_back_to_logical_url() {
        let mut ep = IndexEndpoint::new(url("lfc://catalog.example.org/lfn/f"))
            .with_replicas(vec![Replica::new(url("gsiftp://a.example.org/f"))]);
        ep.clear_locations();
        assert_eq!(
            ep.current_location().as_str(),
            "lfc://catalog.example.org/lfn/f"
        );
        assert!(ep.add_location(url("gsiftp://a.example.org/f")));
        assert_eq!(ep.current_location().as_str(), "gsiftp://a.example.org/f");
    }
}
