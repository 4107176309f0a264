//! Client-side caching: a slot-sharded key/value store keyed by
//! the low 24 bits of a CRC64-Jones hash of the command's key, invalidated
//! wholesale per slot on a server `invalidate` push.

use crate::value::RedisValue;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Number of distinct slots a key can hash into; invalidation pushes name a
/// slot rather than an individual key, so every key sharing a slot is
/// dropped together.
pub const SLOT_COUNT: usize = 1 << 24;
const SLOT_MASK: u64 = (SLOT_COUNT as u64) - 1;

/// The reflected Jones polynomial used by Redis client-side caching
/// (`CRC-64/XZ`'s sibling, reflected variant), verified below against the
/// standard check value for `"123456789"`.
const POLY: u64 = 0xad93d23594c935a9;

fn build_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u64;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 1 == 1 {
                (crc >> 1) ^ POLY
            } else {
                crc >> 1
            };
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC64-Jones over `data`: reflected input/output, xor-in
/// `0xFFFFFFFFFFFFFFFF`, xor-out `0`.
pub fn crc64_jones(data: &[u8]) -> u64 {
    thread_local! {
        static TABLE: [u64; 256] = build_table();
    }
    TABLE.with(|table| {
        let mut crc = !0u64;
        for &byte in data {
            let idx = ((crc ^ byte as u64) & 0xff) as usize;
            crc = table[idx] ^ (crc >> 8);
        }
        !crc
    })
}

/// Derives the 24-bit cache slot for a key.
pub fn slot_for_key(key: &[u8]) -> u32 {
    (crc64_jones(key) & SLOT_MASK) as u32
}

struct Entry {
    value: RedisValue,
}

/// A bucket of cached entries that all share one invalidation slot. Using
/// one table per slot (rather than one global map) means an `invalidate`
/// push only needs to clear a single bucket without disturbing
/// unrelated keys that happen to hash elsewhere.
#[derive(Default)]
struct Bucket {
    entries: HashMap<Vec<u8>, Entry>,
}

/// The client-side cache: one bucket per touched slot, created on first
/// write. `SLOT_COUNT` bounds the slot namespace but buckets are allocated
/// lazily — a freshly-built cache holds nothing.
pub struct ClientCache {
    buckets: RwLock<HashMap<u32, Bucket>>,
}

impl ClientCache {
    pub fn new() -> Self {
        ClientCache {
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn put(&self, key: &[u8], value: RedisValue) {
        let slot = slot_for_key(key);
        self.buckets
            .write()
            .entry(slot)
            .or_default()
            .entries
            .insert(key.to_vec(), Entry { value });
    }

    pub fn get(&self, key: &[u8]) -> Option<RedisValue> {
        let slot = slot_for_key(key);
        self.buckets
            .read()
            .get(&slot)
            .and_then(|b| b.entries.get(key))
            .map(|e| e.value.clone())
    }

    /// Drops every entry in the given slot, as directed by an `invalidate`
    /// push. `None` means a flush-all notification.
    pub fn invalidate(&self, slot: Option<u32>) {
        match slot {
            Some(s) => {
                if let Some(bucket) = self.buckets.write().get_mut(&s) {
                    bucket.entries.clear();
                }
            }
            None => {
                self.buckets.write().clear();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.read().values().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ClientCache {
    fn default() -> Self {
        ClientCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueKind;

    #[test]
    fn crc64_jones_matches_check_value() {
        assert_eq!(crc64_jones(b"123456789"), 0xe9c6d914c4b8d9ca);
    }

    #[test]
    fn put_and_get_roundtrip() {
        let cache = ClientCache::new();
        cache.put(b"foo", RedisValue::new(ValueKind::SimpleString("bar".into())));
        assert_eq!(cache.get(b"foo").unwrap().to_string().unwrap(), "bar");
        assert!(cache.get(b"missing").is_none());
    }

    #[test]
    fn invalidate_drops_only_its_slot() {
        let cache = ClientCache::new();
        cache.put(b"foo", RedisValue::new(ValueKind::SimpleString("bar".into())));
        let slot = slot_for_key(b"foo");
        let other_slot = if slot == 0 { 1 } else { 0 };
        cache.invalidate(Some(other_slot));
        assert!(cache.get(b"foo").is_some());
        cache.invalidate(Some(slot));
        assert!(cache.get(b"foo").is_none());
    }

    #[test]
    fn invalidate_none_flushes_everything() {
        let cache = ClientCache::new();
        cache.put(b"a", RedisValue::new(ValueKind::SimpleString("1".into())));
        cache.put(b"b", RedisValue::new(ValueKind::SimpleString("2".into())));
        cache.invalidate(None);
        assert!(cache.is_empty());
    }
}
