// SPDX-License-Identifier: MIT

//! Task result cache keyed by a content fingerprint
//!
//! The fingerprint covers the agent identity and model together with the
//! fully rendered task input, so a hit means the same agent would have been
//! asked exactly the same thing.
//!
//! Each entry carries the expiry its writer asked for. Reads drop the entry
//! they find expired and every write sweeps all expired entries, so keys
//! that are never read again do not accumulate.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry {
    output: String,
    /// `None` when the TTL is too large to represent
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Default)]
pub struct ResultCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fingerprint(role: &str, model: &str, task_input: &str) -> String {
        let mut hasher = Sha256::new();
        for part in [role, model, task_input] {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Cached output that has not expired yet.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        match entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => Some(entry.output.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store an output for `ttl`, sweeping out expired entries.
    pub fn put(&self, key: String, output: String, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        let swept = before - entries.len();
        if swept > 0 {
            log::debug!("Swept {} expired cache entries", swept);
        }
        entries.insert(
            key,
            Entry {
                output,
                expires_at: now.checked_add(ttl),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
