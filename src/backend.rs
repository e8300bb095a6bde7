//! Backend registrations as seen by the load balancer

use crate::registry::KeyValue;
use tracing::warn;

/// One upstream instance: `name` comes from the registry key, `address` is
/// the registered value, passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BackendEntry {
    pub name: String,
    pub address: String,
}

impl BackendEntry {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

/// Full set of backends read at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendSet {
    entries: Vec<BackendEntry>,
}

impl BackendSet {
    pub fn new(entries: Vec<BackendEntry>) -> Self {
        Self { entries }
    }

    /// Build the set from raw registry entries under `prefix`
    pub fn from_kvs(prefix: &str, kvs: &[KeyValue]) -> Self {
        let entries = kvs
            .iter()
            .filter_map(|kv| match backend_name(prefix, &kv.key) {
                Some(name) => Some(BackendEntry::new(name, kv.value.clone())),
                None => {
                    warn!(key = %kv.key, "Ignoring registry key without a backend name");
                    None
                }
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BackendEntry] {
        &self.entries
    }

    /// Entries ordered by name, independent of registry enumeration order
    pub fn sorted(&self) -> Vec<&BackendEntry> {
        let mut sorted: Vec<&BackendEntry> = self.entries.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.address.cmp(&b.address)));
        sorted
    }
}

impl FromIterator<BackendEntry> for BackendSet {
    fn from_iter<I: IntoIterator<Item = BackendEntry>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Final path segment of the key below `prefix`
pub fn backend_name<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let suffix = key.strip_prefix(prefix).unwrap_or(key);
    suffix
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
}
