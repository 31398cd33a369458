//! Seeded hash family for topic compaction
//!
//! Subscriptions are replicated as hashed buckets instead of raw topic
//! strings: a subscription to topic `T` is stored as the set of
//! `(seed index, hash(T, seed))` pairs. The publish side hashes every
//! `/`-separated prefix of each published topic, so a subscription to a
//! prefix matches deeper topics. A stored subscription matches when every
//! stored pair also appears in the publish digest. Collisions only ever
//! produce false positives; precision-sensitive paths re-check the
//! literal topic.

use crate::config::HashConfig;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// A single hashed topic bucket: seed index in the high 16 bits, reduced
/// hash value in the low 48.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TopicBucket(pub u64);

impl TopicBucket {
    fn encode(seed_index: usize, value: u64) -> Self {
        TopicBucket(((seed_index as u64) << 48) | (value & 0xFFFF_FFFF_FFFF))
    }

    /// Index of the seed that produced this bucket
    pub fn seed_index(&self) -> usize {
        (self.0 >> 48) as usize
    }
}

/// Deterministic family of seeded hash functions over topic strings
#[derive(Debug, Clone)]
pub struct HashFamily {
    seeds: Vec<u64>,
    bucket_count: u64,
}

impl HashFamily {
    /// Build a family from configuration
    pub fn new(config: &HashConfig) -> Self {
        Self {
            seeds: config.seeds.clone(),
            bucket_count: config.bucket_count.max(1),
        }
    }

    /// Ordered seeds of the family
    pub fn seeds(&self) -> &[u64] {
        &self.seeds
    }

    /// Hash a topic under the first `number_of_hashes` seeds.
    ///
    /// Deterministic per (topic, seed); the same topic always yields the
    /// same digest.
    pub fn digest(&self, topic: &str, number_of_hashes: usize) -> Vec<u64> {
        self.seeds
            .iter()
            .take(number_of_hashes)
            .map(|&seed| self.hash_one(topic, seed))
            .collect()
    }

    /// Buckets for a single topic string under every seed
    pub fn buckets(&self, topic: &str) -> BTreeSet<TopicBucket> {
        self.seeds
            .iter()
            .enumerate()
            .map(|(i, &seed)| TopicBucket::encode(i, self.hash_one(topic, seed)))
            .collect()
    }

    /// Buckets for every `/`-separated prefix of the topic, under every
    /// seed. This is the publish-side digest: a subscription stores the
    /// buckets of its own topic only, so hierarchical prefix matching
    /// falls out of the subset rule.
    pub fn prefix_buckets(&self, topic: &str) -> BTreeSet<TopicBucket> {
        let mut out = BTreeSet::new();
        for prefix in prefixes(topic) {
            for (i, &seed) in self.seeds.iter().enumerate() {
                out.insert(TopicBucket::encode(i, self.hash_one(prefix, seed)));
            }
        }
        out
    }

    /// Whether a stored subscription digest is covered by a publish digest
    pub fn matches(stored: &BTreeSet<TopicBucket>, published: &BTreeSet<TopicBucket>) -> bool {
        stored.is_subset(published)
    }

    fn hash_one(&self, topic: &str, seed: u64) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(seed.to_be_bytes());
        hasher.update(topic.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(bytes) % self.bucket_count
    }
}

/// Successive `/`-separated prefixes of a topic, shortest first:
/// `"a/b/c"` yields `"a"`, `"a/b"`, `"a/b/c"`.
pub fn prefixes(topic: &str) -> impl Iterator<Item = &str> {
    let bytes = topic.as_bytes();
    let mut cuts: Vec<usize> = bytes
        .iter()
        .enumerate()
        .filter(|(_, &b)| b == b'/')
        .map(|(i, _)| i)
        .collect();
    cuts.push(topic.len());
    cuts.into_iter().map(move |end| &topic[..end])
}
