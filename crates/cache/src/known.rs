use kiln_core::Key;

/// Overrides how a [`DeltaFifo`](crate::DeltaFifo) decides which keys exist
/// locally. Consulted on `delete` (is this key worth reporting?) and on
/// `replace` (which keys vanished from the snapshot?).
pub trait KnownObjects<K>: Send + Sync {
    fn list_keys(&self) -> Vec<Key>;
    fn contains_key(&self, key: &str) -> bool;
    /// Last known state for a tombstone, when one can be produced.
    fn get_by_key(&self, key: &str) -> Option<K>;
}

/// Lists nothing and claims every key exists.
///
/// Every observed remote deletion is queued, and relists never synthesize
/// deletions. For consumers that keep no local cache and act purely on
/// delete notifications; they must tolerate duplicate deletes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysKnown;

impl<K> KnownObjects<K> for AlwaysKnown {
    fn list_keys(&self) -> Vec<Key> {
        Vec::new()
    }

    fn contains_key(&self, _key: &str) -> bool {
        true
    }

    fn get_by_key(&self, _key: &str) -> Option<K> {
        None
    }
}
