use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

type Key = (String, u64);

#[derive(Debug, Clone)]
struct Entry {
    signature: String,
    inserted: Instant,
}

/// Bounded TTL cache mapping `(model_group, hash(thinking_text))` to the
/// upstream signature. Purely a repair mechanism for clients that lose
/// signatures in transit; a miss is never an error. Admission favors recent
/// texts: insertion always wins, the oldest entry is evicted.
pub struct SignatureCache {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    map: HashMap<Key, Entry>,
    order: VecDeque<Key>,
}

impl SignatureCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn get(&self, group: &str, text_hash: u64) -> Option<String> {
        let key = (group.to_string(), text_hash);
        let mut inner = self.inner.lock().expect("signature cache lock poisoned");
        let entry = inner.map.get(&key)?;
        if entry.inserted.elapsed() > self.ttl {
            inner.map.remove(&key);
            return None;
        }
        Some(entry.signature.clone())
    }

    pub fn insert(&self, group: &str, text_hash: u64, signature: impl Into<String>) {
        let key = (group.to_string(), text_hash);
        let mut inner = self.inner.lock().expect("signature cache lock poisoned");
        if inner.map.contains_key(&key) {
            if let Some(entry) = inner.map.get_mut(&key) {
                entry.signature = signature.into();
                entry.inserted = Instant::now();
            }
            // Refresh recency too, or the eviction walk would still treat
            // this entry as the oldest.
            inner.order.retain(|existing| existing != &key);
            inner.order.push_back(key);
            return;
        }
        while inner.map.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.map.remove(&oldest);
                }
                None => break,
            }
        }
        inner.map.insert(
            key.clone(),
            Entry {
                signature: signature.into(),
                inserted: Instant::now(),
            },
        );
        inner.order.push_back(key);
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("signature cache lock poisoned")
            .map
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stable 64-bit content hash of a thinking text.
pub fn hash_text(text: &str) -> u64 {
    let digest = blake3::hash(text.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}
