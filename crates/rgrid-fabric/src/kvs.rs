//! Key-value-store bootstrap seam.
//!
//! The KVS-mediated wireup driver only needs put / barrier / get from an
//! external process manager, so that is the whole trait. [`MemKvs`] is an
//! in-process implementation for tests and single-node bring-up.

use std::collections::HashMap;
use std::sync::{Arc, Barrier, Mutex};

use crate::error::{FabricError, Result};

/// Minimal process-manager key-value store.
///
/// `put` makes a value visible to every participant after the next
/// `barrier`; `get` reads a value published before that barrier.
pub trait KeyValueStore {
    fn put(&mut self, key: &str, value: &str) -> Result<()>;
    fn barrier(&mut self) -> Result<()>;
    fn get(&mut self, key: &str) -> Result<String>;
}

/// Shared-memory KVS for in-process participants (one per thread).
pub struct MemKvs {
    map: Arc<Mutex<HashMap<String, String>>>,
    barrier: Arc<Barrier>,
}

impl MemKvs {
    /// Create one handle per participant, all sharing a store and a
    /// barrier.
    pub fn group(n: usize) -> Vec<MemKvs> {
        let map = Arc::new(Mutex::new(HashMap::new()));
        let barrier = Arc::new(Barrier::new(n));
        (0..n)
            .map(|_| MemKvs {
                map: Arc::clone(&map),
                barrier: Arc::clone(&barrier),
            })
            .collect()
    }
}

impl KeyValueStore for MemKvs {
    fn put(&mut self, key: &str, value: &str) -> Result<()> {
        self.map
            .lock()
            .map_err(|_| FabricError::Protocol("kvs lock poisoned".into()))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn barrier(&mut self) -> Result<()> {
        self.barrier.wait();
        Ok(())
    }

    fn get(&mut self, key: &str) -> Result<String> {
        self.map
            .lock()
            .map_err(|_| FabricError::Protocol("kvs lock poisoned".into()))?
            .get(key)
            .cloned()
            .ok_or_else(|| FabricError::Protocol(format!("kvs key '{key}' not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_mem_kvs_visibility() {
        let mut group = MemKvs::group(2);
        let mut b = group.pop().unwrap();
        let mut a = group.pop().unwrap();
        let t = thread::spawn(move || {
            a.put("k0", "v0").unwrap();
            a.barrier().unwrap();
            a.get("k1").unwrap()
        });
        b.put("k1", "v1").unwrap();
        b.barrier().unwrap();
        assert_eq!(b.get("k0").unwrap(), "v0");
        assert_eq!(t.join().unwrap(), "v1");
    }

    #[test]
    fn test_missing_key() {
        let mut group = MemKvs::group(1);
        assert!(group[0].get("nope").is_err());
    }
}
