//! Per-area key-value state
//!
//! [`KvStoreDb`] holds one area's map and implements the merge algorithm,
//! the TTL countdown queue and the dump/diff operations the sync protocol
//! is built from. It is pure state; sockets and timers live in the KvStore
//! task.

use crate::config::{TTL_INFINITY, TTL_THRESHOLD_MS};
use crate::protocol::{HashDump, KeyDumpParams, Publication, Value};
use crate::utils::Counters;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};
use tracing::debug;

/// Outcome of comparing two values for the same key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueCmp {
    /// First argument wins
    First,
    /// Second argument wins
    Second,
    /// Indistinguishable
    Tied,
    /// Bodies are absent and hashes differ; cannot be ordered
    Unknown,
}

/// Compare two values for the same key
///
/// Order of comparison: version, originator id, value bytes, ttl version.
/// When bodies are missing on either side, equality can still be proven
/// through matching hashes; otherwise the result is [`ValueCmp::Unknown`]
/// and the caller must fetch the full body.
pub fn compare_values(v1: &Value, v2: &Value) -> ValueCmp {
    if v1.version != v2.version {
        return if v1.version > v2.version {
            ValueCmp::First
        } else {
            ValueCmp::Second
        };
    }
    if v1.originator_id != v2.originator_id {
        return if v1.originator_id > v2.originator_id {
            ValueCmp::First
        } else {
            ValueCmp::Second
        };
    }
    match (&v1.value, &v2.value) {
        (Some(a), Some(b)) => {
            if a != b {
                return if a > b { ValueCmp::First } else { ValueCmp::Second };
            }
        }
        _ => {
            // at least one body missing; matching hashes prove equality,
            // anything else is undecidable from here
            match (v1.hash, v2.hash) {
                (Some(h1), Some(h2)) if h1 == h2 => {}
                _ => return ValueCmp::Unknown,
            }
        }
    }
    if v1.ttl_version != v2.ttl_version {
        return if v1.ttl_version > v2.ttl_version {
            ValueCmp::First
        } else {
            ValueCmp::Second
        };
    }
    ValueCmp::Tied
}

/// Key/originator filters applied before merging
#[derive(Debug, Clone, Default)]
pub struct KvStoreFilters {
    /// Accepted key prefixes; empty accepts every key
    pub key_prefixes: Vec<String>,
    /// Accepted originators; empty accepts every originator
    pub originator_ids: Vec<String>,
}

impl KvStoreFilters {
    /// Does (key, value) pass the filters?
    pub fn key_match(&self, key: &str, value: &Value) -> bool {
        let prefix_ok = self.key_prefixes.is_empty()
            || self.key_prefixes.iter().any(|p| key.starts_with(p.as_str()));
        let originator_ok = self.originator_ids.is_empty()
            || self.originator_ids.contains(&value.originator_id);
        prefix_ok && originator_ok
    }

    /// True when no filtering is configured at all
    pub fn is_empty(&self) -> bool {
        self.key_prefixes.is_empty() && self.originator_ids.is_empty()
    }
}

impl From<&KeyDumpParams> for KvStoreFilters {
    fn from(params: &KeyDumpParams) -> Self {
        Self {
            key_prefixes: params.prefixes.clone(),
            originator_ids: params.originator_ids.clone(),
        }
    }
}

/// Result of merging a publication into the local map
#[derive(Debug, Default)]
pub struct MergeResult {
    /// Keys whose stored value advanced, with the value to flood
    /// (body stripped for pure TTL refreshes)
    pub key_vals: HashMap<String, Value>,
    /// Keys we could not order (hash-only mismatch) and need bodies for
    pub unknown_keys: Vec<String>,
}

impl MergeResult {
    /// Did the merge change or learn anything?
    pub fn is_empty(&self) -> bool {
        self.key_vals.is_empty() && self.unknown_keys.is_empty()
    }
}

/// Merge `update` into `store` point-wise
///
/// Every accepted entry lands in the returned delta; receivers re-apply
/// the same comparison, so over-flooding is safe while under-flooding is
/// not. TTL-only refreshes enter the delta with the body stripped.
pub fn merge_key_values(
    store: &mut HashMap<String, Value>,
    update: &HashMap<String, Value>,
    filters: Option<&KvStoreFilters>,
) -> MergeResult {
    let mut result = MergeResult::default();
    for (key, value) in update {
        if let Some(f) = filters {
            if !f.key_match(key, value) {
                continue;
            }
        }
        let mine = match store.get_mut(key) {
            None => {
                // a body-less value cannot seed a fresh key; ask for it
                if value.value.is_none() {
                    result.unknown_keys.push(key.clone());
                    continue;
                }
                // nor can one that is about to expire anyway
                if value.ttl != TTL_INFINITY && value.ttl < TTL_THRESHOLD_MS {
                    continue;
                }
                store.insert(key.clone(), value.clone());
                result.key_vals.insert(key.clone(), value.clone());
                continue;
            }
            Some(mine) => mine,
        };

        let mut update_all = false;
        let mut update_ttl = false;
        if value.version > mine.version {
            update_all = true;
        } else if value.version == mine.version {
            if value.originator_id > mine.originator_id {
                update_all = true;
            } else if value.originator_id == mine.originator_id {
                match (&value.value, &mine.value) {
                    (Some(theirs), Some(ours)) if theirs != ours => {
                        if theirs > ours {
                            update_all = true;
                        }
                    }
                    (Some(_), Some(_)) => {
                        if value.ttl_version > mine.ttl_version {
                            update_ttl = true;
                        }
                    }
                    _ => {
                        // body missing on a side; matching hashes prove the
                        // bodies equal (TTL-refresh path), anything else is
                        // undecidable from here
                        match (value.hash, mine.hash) {
                            (Some(h1), Some(h2)) if h1 == h2 => {
                                if value.ttl_version > mine.ttl_version {
                                    update_ttl = true;
                                }
                            }
                            _ => {
                                result.unknown_keys.push(key.clone());
                                continue;
                            }
                        }
                    }
                }
            }
        }

        if update_all {
            if value.value.is_none() {
                // a winner we cannot store; fetch the body via sync
                result.unknown_keys.push(key.clone());
                continue;
            }
            *mine = value.clone();
            result.key_vals.insert(key.clone(), value.clone());
        } else if update_ttl {
            mine.ttl = value.ttl;
            mine.ttl_version = value.ttl_version;
            // refresh floods onward with the body stripped
            result.key_vals.insert(key.clone(), mine.hash_only());
        }
    }
    result
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TtlEntry {
    expires_at: Instant,
    key: String,
    version: u64,
    ttl_version: i64,
    originator_id: String,
}

impl Ord for TtlEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.expires_at
            .cmp(&other.expires_at)
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for TtlEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// One area's key-value database
pub struct KvStoreDb {
    area: String,
    store: HashMap<String, Value>,
    // min-heap on expiry; entries are lazily invalidated by version checks
    ttl_heap: BinaryHeap<Reverse<TtlEntry>>,
    expires_at: HashMap<String, Instant>,
    filters: Option<KvStoreFilters>,
    ttl_decrement: Duration,
    counters: Counters,
}

impl KvStoreDb {
    /// Create an empty database for `area`
    pub fn new(
        area: impl Into<String>,
        filters: Option<KvStoreFilters>,
        ttl_decrement: Duration,
        counters: Counters,
    ) -> Self {
        Self {
            area: area.into(),
            store: HashMap::new(),
            ttl_heap: BinaryHeap::new(),
            expires_at: HashMap::new(),
            filters,
            ttl_decrement,
            counters,
        }
    }

    /// The area this database belongs to
    pub fn area(&self) -> &str {
        &self.area
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Is the database empty?
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Read-only view of the map (tests and dumps)
    pub fn key_vals(&self) -> &HashMap<String, Value> {
        &self.store
    }

    /// Merge a batch of updates, maintaining TTL bookkeeping
    pub fn merge(&mut self, update: &HashMap<String, Value>) -> MergeResult {
        let result = merge_key_values(&mut self.store, update, self.filters.as_ref());
        if !result.unknown_keys.is_empty() {
            self.counters
                .bump("kvstore.cmp_unknown", result.unknown_keys.len() as i64);
        }
        let now = Instant::now();
        for key in result.key_vals.keys() {
            if let Some(value) = self.store.get(key).cloned() {
                self.track_ttl(key, &value, now);
            }
        }
        self.counters.set("kvstore.num_keys", self.store.len() as i64);
        result
    }

    fn track_ttl(&mut self, key: &str, value: &Value, now: Instant) {
        if value.ttl == TTL_INFINITY {
            self.expires_at.remove(key);
            return;
        }
        let ttl = Duration::from_millis(value.ttl.max(0) as u64);
        let expires_at = now + ttl;
        self.expires_at.insert(key.to_string(), expires_at);
        self.ttl_heap.push(Reverse(TtlEntry {
            expires_at,
            key: key.to_string(),
            version: value.version,
            ttl_version: value.ttl_version,
            originator_id: value.originator_id.clone(),
        }));
    }

    /// When does the earliest live entry expire?
    pub fn next_expiry(&mut self) -> Option<Instant> {
        while let Some(Reverse(entry)) = self.ttl_heap.peek() {
            if self.entry_is_current(entry) {
                return Some(entry.expires_at);
            }
            self.ttl_heap.pop();
        }
        None
    }

    fn entry_is_current(&self, entry: &TtlEntry) -> bool {
        match self.store.get(&entry.key) {
            None => false,
            Some(value) => {
                value.version == entry.version
                    && value.ttl_version == entry.ttl_version
                    && value.originator_id == entry.originator_id
                    && self.expires_at.get(&entry.key) == Some(&entry.expires_at)
            }
        }
    }

    /// Remove every entry whose TTL has run out; returns the expired keys
    pub fn expire_keys(&mut self, now: Instant) -> Vec<String> {
        let mut expired = Vec::new();
        while let Some(Reverse(entry)) = self.ttl_heap.peek() {
            if entry.expires_at > now {
                break;
            }
            let entry = match self.ttl_heap.pop() {
                Some(Reverse(entry)) => entry,
                None => break,
            };
            if !self.entry_is_current(&entry) {
                continue;
            }
            debug!("area {}: ttl expired for {}", self.area, entry.key);
            self.store.remove(&entry.key);
            self.expires_at.remove(&entry.key);
            expired.push(entry.key);
        }
        if !expired.is_empty() {
            self.counters
                .bump("kvstore.ttl_expiries", expired.len() as i64);
            self.counters.set("kvstore.num_keys", self.store.len() as i64);
        }
        expired
    }

    /// Point lookup of several keys
    pub fn get_keys(&self, keys: &[String]) -> Publication {
        let mut publication = Publication {
            area: self.area.clone(),
            ..Default::default()
        };
        for key in keys {
            if let Some(value) = self.store.get(key) {
                publication.key_vals.insert(key.clone(), value.clone());
            }
        }
        publication
    }

    /// Dump all entries passing `filters`, bodies included
    pub fn dump_all(&self, filters: &KvStoreFilters) -> Publication {
        let mut publication = Publication {
            area: self.area.clone(),
            ..Default::default()
        };
        for (key, value) in &self.store {
            if filters.key_match(key, value) {
                publication.key_vals.insert(key.clone(), value.clone());
            }
        }
        publication
    }

    /// Dump matching entries with bodies stripped (hash comparison)
    pub fn dump_hashes(&self, filters: &KvStoreFilters) -> Publication {
        let mut publication = Publication {
            area: self.area.clone(),
            ..Default::default()
        };
        for (key, value) in &self.store {
            if filters.key_match(key, value) {
                publication.key_vals.insert(key.clone(), value.hash_only());
            }
        }
        publication
    }

    /// Compute the full-sync diff against a requester's hash snapshot
    ///
    /// Entries the requester lacks or holds stale come back with full
    /// bodies; keys where the requester is ahead (or undecidable) land in
    /// `to_be_updated_keys`, to be supplied in the third sync leg.
    pub fn dump_difference(&self, filters: &KvStoreFilters, theirs: &HashDump) -> Publication {
        let mut publication = Publication {
            area: self.area.clone(),
            ..Default::default()
        };
        for (key, mine) in &self.store {
            if !filters.key_match(key, mine) {
                continue;
            }
            match theirs.hashes.get(key) {
                None => {
                    publication.key_vals.insert(key.clone(), mine.clone());
                }
                Some(their_value) => match compare_values(mine, their_value) {
                    ValueCmp::First => {
                        publication.key_vals.insert(key.clone(), mine.clone());
                    }
                    ValueCmp::Second => {
                        publication.to_be_updated_keys.push(key.clone());
                    }
                    ValueCmp::Tied => {}
                    ValueCmp::Unknown => {
                        // cannot order; send ours and ask for theirs
                        publication.key_vals.insert(key.clone(), mine.clone());
                        publication.to_be_updated_keys.push(key.clone());
                    }
                },
            }
        }
        for (key, their_value) in &theirs.hashes {
            if !self.store.contains_key(key) && filters.key_match(key, their_value) {
                publication.to_be_updated_keys.push(key.clone());
            }
        }
        publication
    }

    /// Rewrite TTLs in an outbound publication to the remaining lifetime
    ///
    /// Entries within the expiry threshold are dropped entirely when
    /// `remove_about_to_expire` is set (peer-sync responses), since they
    /// would be rejected at the receiver anyway.
    pub fn update_publication_ttl(
        &self,
        publication: &mut Publication,
        remove_about_to_expire: bool,
    ) {
        let now = Instant::now();
        let decrement = self.ttl_decrement.as_millis() as i64;
        let mut to_remove = Vec::new();
        for (key, value) in publication.key_vals.iter_mut() {
            if value.ttl == TTL_INFINITY {
                continue;
            }
            match self.expires_at.get(key) {
                None => {}
                Some(expires_at) => {
                    let remaining = expires_at.saturating_duration_since(now).as_millis() as i64;
                    let ttl = remaining - decrement;
                    if ttl <= 0 || (remove_about_to_expire && ttl < TTL_THRESHOLD_MS) {
                        to_remove.push(key.clone());
                    } else {
                        value.ttl = ttl;
                    }
                }
            }
        }
        for key in to_remove {
            publication.key_vals.remove(&key);
        }
    }
}
