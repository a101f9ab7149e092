//! Workspace keys and the registry of running engines.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::NotFoundError;
use crate::rpc::RpcClient;
use crate::supervisor::{HandshakeResult, ProcessHandle};

const PATH_SEPARATORS: [char; 2] = ['/', '\\'];

/// Canonical lookup key for a workspace root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceKey(String);

impl WorkspaceKey {
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for WorkspaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl AsRef<str> for WorkspaceKey {
    fn as_ref(&self) -> &str { &self.0 }
}

/// Strip trailing path separators, then case-fold.
pub fn normalize(raw: &str) -> WorkspaceKey {
    WorkspaceKey(raw.trim_end_matches(PATH_SEPARATORS).to_lowercase())
}

/// A running engine bound to one workspace.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    workspace: WorkspaceKey,
    port: u16,
    process: ProcessHandle,
}

impl EngineHandle {
    pub fn new(workspace: WorkspaceKey, launched: HandshakeResult) -> Self {
        Self { workspace, port: launched.port, process: launched.process }
    }

    pub fn workspace(&self) -> &WorkspaceKey { &self.workspace }

    pub fn port(&self) -> u16 { self.port }

    pub fn process(&self) -> &ProcessHandle { &self.process }

    /// RPC client targeting this engine's listener.
    pub fn client(&self) -> RpcClient { RpcClient::for_port(self.port) }
}

/// Maps workspace keys to engine handles for the lifetime of the process.
///
/// Construct one at startup and pass it around; there is no global instance.
/// Writes are last-write-wins. Nothing ties a `get` to later use of the handle,
/// so a concurrent `put` may replace it in between.
#[derive(Debug)]
pub struct WorkspaceRegistry<H = EngineHandle> {
    entries: RwLock<HashMap<WorkspaceKey, H>>,
}

impl<H> Default for WorkspaceRegistry<H> {
    fn default() -> Self { Self { entries: RwLock::new(HashMap::new()) } }
}

impl<H: Clone> WorkspaceRegistry<H> {
    pub fn new() -> Self { Self::default() }

    pub fn put(&self, key: WorkspaceKey, handle: H) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(key, handle);
    }

    pub fn get(&self, key: &WorkspaceKey) -> Result<H, NotFoundError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned().ok_or_else(|| NotFoundError(key.clone()))
    }

    /// Explicit teardown of one entry. Returns the removed handle, if any.
    pub fn remove(&self, key: &WorkspaceKey) -> Option<H> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(key)
    }

    pub fn contains(&self, key: &WorkspaceKey) -> bool {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn keys(&self) -> Vec<WorkspaceKey> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<WorkspaceKey> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{distributions::Alphanumeric, Rng};

    #[test]
    fn test_normalize_strips_separators_and_case() {
        assert_eq!(normalize("/Users/Me/Notes/"), normalize("/users/me/notes"));
        assert_eq!(normalize("C:\\Vault\\\\"), normalize("c:\\vault"));
        assert_eq!(normalize("/home/a///").as_str(), "/home/a");
        assert_eq!(normalize("file:///Work/KB/").as_str(), "file:///work/kb");
        assert_eq!(normalize("/").as_str(), "");
        assert_eq!(normalize("").as_str(), "");
    }

    #[test]
    fn test_normalize_keeps_inner_separators() {
        assert_eq!(normalize("/a//b/").as_str(), "/a//b");
        assert_ne!(normalize("/a/b"), normalize("/a/c"));
    }

    #[test]
    fn test_fuzz_normalize_equivalence_and_idempotence() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let len: usize = rng.gen_range(0..64);
            let base: String = (0..len).map(|_| rng.sample(Alphanumeric) as char).collect();
            let trailing: String = (0..rng.gen_range(0..4)).map(|_| if rng.gen_bool(0.5) { '/' } else { '\\' }).collect();
            let noisy = format!("{}{}", base.to_uppercase(), trailing);
            assert_eq!(normalize(&noisy), normalize(&base));
            let once = normalize(&noisy);
            assert_eq!(normalize(once.as_str()), once);
        }
    }

    #[test]
    fn test_registry_get_missing_is_not_found() {
        let registry: WorkspaceRegistry<u32> = WorkspaceRegistry::new();
        let key = normalize("/never/put");
        assert_eq!(registry.get(&key), Err(NotFoundError(key.clone())));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_last_write_wins() {
        let registry: WorkspaceRegistry<&'static str> = WorkspaceRegistry::new();
        let key = normalize("/kb");
        registry.put(key.clone(), "h1");
        registry.put(key.clone(), "h2");
        assert_eq!(registry.get(&key), Ok("h2"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_lookup_through_equivalent_raw_ids() {
        let registry: WorkspaceRegistry<u16> = WorkspaceRegistry::new();
        registry.put(normalize("/Work/Notes/"), 41234);
        assert_eq!(registry.get(&normalize("/work/notes")), Ok(41234));
        assert!(registry.contains(&normalize("/WORK/NOTES\\")));
    }

    #[test]
    fn test_registry_remove_and_keys() {
        let registry: WorkspaceRegistry<u8> = WorkspaceRegistry::new();
        registry.put(normalize("/b"), 2);
        registry.put(normalize("/a"), 1);
        assert_eq!(registry.keys(), vec![normalize("/a"), normalize("/b")]);
        assert_eq!(registry.remove(&normalize("/a")), Some(1));
        assert_eq!(registry.remove(&normalize("/a")), None);
        assert!(registry.get(&normalize("/a")).is_err());
    }
}
