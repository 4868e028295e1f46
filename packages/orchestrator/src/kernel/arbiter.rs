//! Resource arbiter: claim-time mutual exclusion over opaque key strings.
//!
//! The arbiter keeps a counting set of keys currently held by in-flight
//! tasks in this process. The claim path excludes candidates whose keys
//! intersect the held set, and the store-side filter excludes keys held by
//! running rows elsewhere, so two running tasks never share a key.

use std::collections::HashMap;
use std::sync::Mutex;

/// How a key may be held. Keys are exclusive today; the enum is the seam for
/// a future reader-shared mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyMode {
    #[default]
    Exclusive,
}

#[derive(Default)]
pub struct ResourceArbiter {
    held: Mutex<HashMap<String, u32>>,
}

/// RAII-free grant: the worker releases explicitly at finalize so the keys
/// survive across the handler's await points without lifetime gymnastics.
#[derive(Debug, Clone)]
pub struct ResourceGrant {
    keys: Vec<String>,
}

impl ResourceGrant {
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl ResourceArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently held by this process.
    pub fn held_keys(&self) -> Vec<String> {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.keys().cloned().collect()
    }

    /// Whether any of `keys` is currently held.
    pub fn is_contended(&self, keys: &[String]) -> bool {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        keys.iter().any(|key| held.contains_key(key))
    }

    /// Atomically acquire every key or none of them.
    pub fn try_acquire(&self, keys: &[String]) -> Option<ResourceGrant> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if keys.iter().any(|key| held.contains_key(key)) {
            return None;
        }
        for key in keys {
            *held.entry(key.clone()).or_insert(0) += 1;
        }
        Some(ResourceGrant {
            keys: keys.to_vec(),
        })
    }

    /// Release a grant taken at claim time.
    pub fn release(&self, grant: ResourceGrant) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        for key in grant.keys {
            if let Some(count) = held.get_mut(&key) {
                *count -= 1;
                if *count == 0 {
                    held.remove(&key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn acquire_is_all_or_nothing() {
        let arbiter = ResourceArbiter::new();
        let grant = arbiter.try_acquire(&keys(&["room:r1:canvas"])).unwrap();

        // Overlapping set is refused entirely, including the free key.
        assert!(arbiter
            .try_acquire(&keys(&["room:r1:canvas", "room:r2:canvas"]))
            .is_none());
        assert!(!arbiter.is_contended(&keys(&["room:r2:canvas"])));

        arbiter.release(grant);
        assert!(arbiter
            .try_acquire(&keys(&["room:r1:canvas", "room:r2:canvas"]))
            .is_some());
    }

    #[test]
    fn release_frees_keys() {
        let arbiter = ResourceArbiter::new();
        let grant = arbiter.try_acquire(&keys(&["widget:w1"])).unwrap();
        assert!(arbiter.is_contended(&keys(&["widget:w1"])));

        arbiter.release(grant);
        assert!(!arbiter.is_contended(&keys(&["widget:w1"])));
        assert!(arbiter.held_keys().is_empty());
    }

    #[test]
    fn empty_key_set_always_acquires() {
        let arbiter = ResourceArbiter::new();
        assert!(arbiter.try_acquire(&[]).is_some());
    }
}
