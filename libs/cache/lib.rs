//! A TTL-aware cache for upstream responses, keyed on `(domain, qtype, qclass)`.
//!
//! Entries store their records at insertion time and decrement TTLs lazily on read,
//! based on elapsed wall-clock time — whole seconds only, so repeated lookups inside
//! the same second naturally return identical TTLs without any extra bookkeeping.
//!
//! Backed by [`dashmap::DashMap`] for lock-striped concurrent access, with an
//! [`AtomicUsize`] tracking the live entry count so capacity checks don't have to walk
//! every shard.

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use dashmap::DashMap;
use dns_wire::{
    decrement_record, prelude::*, rebuild, OwnedRecordTuple, Query, RecordClass, RecordType,
    Response, ResponseCode,
};

/// Entries beyond this count trigger eviction of the oldest 10% (by insertion time).
pub const MAX_ENTRIES: usize = 10_000;
/// How many entries an eviction or expiry sweep pass removes per batch, so a single
/// pass never holds more than a handful of shards locked at once. Also the cadence at
/// which `insert` triggers an expiry sweep.
pub const EVICTION_BATCH_SIZE: usize = 100;
/// Fixed TTL applied to cached NXDOMAIN responses, regardless of the upstream's SOA.
pub const NEGATIVE_TTL_SECS: u32 = 30;

/// `(qname, qtype, qclass)`, with the qname case-folded so `Example.Com.` and
/// `example.com.` hit the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    domain: String,
    qtype: RecordType,
    qclass: RecordClass,
}

impl Key {
    fn new(domain: &dns_wire::DomainName, qtype: RecordType, qclass: RecordClass) -> Self {
        Self {
            domain: domain.to_string().to_ascii_lowercase(),
            qtype,
            qclass,
        }
    }
}

struct Entry {
    response_code: ResponseCode,
    answer: Vec<OwnedRecordTuple>,
    authority: Vec<OwnedRecordTuple>,
    additional: Vec<OwnedRecordTuple>,
    ttl: u32,
    created_at: Instant,
}

impl Entry {
    fn elapsed_secs(&self) -> u32 {
        self.created_at.elapsed().as_secs().min(u64::from(u32::MAX)) as u32
    }

    fn expired(&self) -> bool {
        self.elapsed_secs() >= self.ttl
    }
}

pub struct Cache {
    entries: DashMap<Key, Entry>,
    len: AtomicUsize,
    inserts: AtomicUsize,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            len: AtomicUsize::new(0),
            inserts: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a cached response for `query`, decrementing TTLs by elapsed time.
    ///
    /// Removes and returns `None` for entries that have fully expired.
    pub fn get(&self, query: &Query) -> Option<Response> {
        let domain = query.domain()?;
        let qtype = query.qtype()?;
        let qclass = query.qclass()?;
        let key = Key::new(&domain, qtype, qclass);

        let entry = self.entries.get(&key)?;

        if entry.expired() {
            drop(entry);
            self.remove(&key);
            return None;
        }

        let elapsed = entry.elapsed_secs();
        let answer = decrement_all(&entry.answer, elapsed);
        let authority = decrement_all(&entry.authority, elapsed);
        let additional = decrement_all(&entry.additional, elapsed);
        let response_code = entry.response_code;
        drop(entry);

        Some(rebuild(
            query.id(),
            &domain,
            qtype,
            qclass,
            response_code,
            false,
            answer,
            authority,
            additional,
        ))
    }

    /// Stores `response` for later lookups keyed on `query`'s question.
    ///
    /// NXDOMAIN responses are cached under a fixed [`NEGATIVE_TTL_SECS`]. NOERROR
    /// responses with an empty answer section (NODATA) are not cached, since the TTL
    /// to use for a negative NODATA entry would have to come from the authority
    /// section's SOA minimum, which this cache does not track.
    pub fn insert(&self, query: &Query, response: &Response) {
        let Some(domain) = query.domain() else {
            return;
        };
        let Some(qtype) = query.qtype() else {
            return;
        };
        let Some(qclass) = query.qclass() else {
            return;
        };

        let response_code = response.response_code();
        let answer: Vec<OwnedRecordTuple> =
            response.answer().map(|r| decrement_record(&r, 0)).collect();
        let authority: Vec<OwnedRecordTuple> = response
            .authority()
            .map(|r| decrement_record(&r, 0))
            .collect();
        let additional: Vec<OwnedRecordTuple> = response
            .additional()
            .map(|r| decrement_record(&r, 0))
            .collect();

        let ttl = match response_code {
            ResponseCode::NXDOMAIN => NEGATIVE_TTL_SECS,
            ResponseCode::NOERROR if !answer.is_empty() => answer
                .iter()
                .chain(&authority)
                .chain(&additional)
                .map(|(_, ttl, _)| *ttl)
                .min()
                .unwrap_or(0),
            _ => return,
        };

        let key = Key::new(&domain, qtype, qclass);
        let entry = Entry {
            response_code,
            answer,
            authority,
            additional,
            ttl,
            created_at: Instant::now(),
        };

        if self.inserts.fetch_add(1, Ordering::Relaxed) % EVICTION_BATCH_SIZE == 0 {
            self.sweep_expired();
        }

        let is_new = self.entries.insert(key, entry).is_none();
        if is_new {
            self.len.fetch_add(1, Ordering::Relaxed);
        }

        if self.len() >= MAX_ENTRIES {
            self.sweep_expired();
        }
        if self.len() >= MAX_ENTRIES {
            self.evict_oldest();
        }
    }

    fn remove(&self, key: &Key) {
        if self.entries.remove(key).is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Removes every expired entry, a batch of [`EVICTION_BATCH_SIZE`] at a time.
    ///
    /// Meant to be called periodically from a background task; see
    /// [`Cache::run_expiry_sweep`].
    pub fn sweep_expired(&self) {
        loop {
            let batch: Vec<Key> = self
                .entries
                .iter()
                .filter(|e| e.expired())
                .take(EVICTION_BATCH_SIZE)
                .map(|e| e.key().clone())
                .collect();

            if batch.is_empty() {
                return;
            }

            let removed = batch.len();
            for key in batch {
                self.remove(&key);
            }

            tracing::debug!(removed, "Swept expired cache entries");

            if removed < EVICTION_BATCH_SIZE {
                return;
            }
        }
    }

    /// Evicts the oldest 10% of [`MAX_ENTRIES`], in batches of [`EVICTION_BATCH_SIZE`].
    fn evict_oldest(&self) {
        let target = MAX_ENTRIES / 10;

        let mut by_age: Vec<(Key, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.created_at))
            .collect();
        by_age.sort_by_key(|(_, created_at)| *created_at);

        let to_evict = by_age.into_iter().take(target);
        let mut removed = 0;

        for (key, _) in to_evict {
            self.remove(&key);
            removed += 1;

            if removed % EVICTION_BATCH_SIZE == 0 {
                tracing::debug!(removed, "Evicting oldest cache entries over capacity");
            }
        }

        tracing::info!(removed, capacity = MAX_ENTRIES, "Evicted oldest cache entries over capacity");
    }

    /// Runs [`Cache::sweep_expired`] on `interval` until the returned handle is dropped.
    pub fn run_expiry_sweep(self: std::sync::Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.sweep_expired();
            }
        })
    }
}

fn decrement_all(records: &[OwnedRecordTuple], elapsed: u32) -> Vec<OwnedRecordTuple> {
    records
        .iter()
        .map(|(name, ttl, data)| (name.clone(), ttl.saturating_sub(elapsed), data.clone()))
        .collect()
}
