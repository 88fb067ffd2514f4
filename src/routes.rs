//! Routing entries and host/path matching
//! Keeps an ordered table of entries; a lookup returns at most one entry

use anyhow::{bail, Result};
use parking_lot::RwLock;
use url::Url;

/// A single routing rule: a domain plus the action to take for it.
///
/// Entries are immutable once added. `domain` is either an exact host or a
/// `*.example.com` wildcard that also matches the bare parent domain.
#[derive(Debug, Clone, Default)]
pub struct RoutingEntry {
    pub domain: String,
    /// Upstream base URL. When absent the entry must redirect.
    pub target: Option<Url>,
    /// Path prefix that selects this entry among same-domain entries and is
    /// stripped before forwarding.
    pub path: Option<String>,
    /// Expected Base64 `user:password` for HTTP Basic auth.
    pub authorization: Option<String>,
    pub redirect_to_https: bool,
    pub redirect_to_url: Option<String>,
    pub redirect_to_domain: Option<String>,
    pub cors: bool,
    /// Pipe-separated `key: value` pairs injected into the upstream request.
    pub headers: Option<String>,
    /// If true the upstream sees the incoming `Host`; otherwise the target's.
    pub preserve_host: bool,
}

impl RoutingEntry {
    /// An entry that can never produce a response is rejected at insertion.
    fn has_action(&self) -> bool {
        self.target.is_some()
            || self.redirect_to_url.is_some()
            || self.redirect_to_domain.is_some()
            || self.redirect_to_https
    }
}

/// Ordered collection of routing entries.
///
/// Insertion order is part of the tie-break policy, so this is a list and not
/// a per-domain map. Writes are rare; every dispatch takes the read lock.
pub struct RouteTable {
    entries: RwLock<Vec<RoutingEntry>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Append an entry, preserving insertion order.
    pub fn add(&self, entry: RoutingEntry) -> Result<()> {
        if !entry.has_action() {
            bail!(
                "routing entry for {} has no target and no redirect",
                entry.domain
            );
        }
        self.entries.write().push(entry);
        Ok(())
    }

    /// Find the entry for a request, or `None` when nothing matches.
    ///
    /// The host is lowercased and stripped of any `:port` before comparison.
    /// Matching runs in two stages: a domain filter (exact or wildcard), then
    /// path disambiguation when several entries share the domain. A lone
    /// domain match wins regardless of path.
    pub fn find(&self, host: &str, path: &str) -> Option<RoutingEntry> {
        let host = normalize_host(host);
        let entries = self.entries.read();

        let eligible: Vec<&RoutingEntry> = entries
            .iter()
            .filter(|e| domain_matches(&e.domain, &host))
            .collect();

        match eligible.len() {
            0 => None,
            1 => Some(eligible[0].clone()),
            _ => {
                if let Some(entry) = eligible
                    .iter()
                    .find(|e| e.path.as_deref().is_some_and(|p| path_matches(path, p)))
                {
                    return Some((*entry).clone());
                }
                eligible
                    .iter()
                    .find(|e| e.path.is_none())
                    .map(|e| (*e).clone())
            }
        }
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_host(host: &str) -> String {
    host.split(':').next().unwrap_or(host).to_ascii_lowercase()
}

/// The host with its first dot-separated label removed.
fn parent(host: &str) -> Option<&str> {
    host.split_once('.').map(|(_, rest)| rest)
}

fn domain_matches(domain: &str, host: &str) -> bool {
    if let Some(root) = domain.strip_prefix("*.") {
        root == host || parent(host) == Some(root)
    } else {
        domain == host
    }
}

fn path_matches(request_path: &str, prefix: &str) -> bool {
    request_path == prefix
        || request_path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}
