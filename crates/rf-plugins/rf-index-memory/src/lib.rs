//! # rf-index-memory Implementation
//!
//! An in-process [`OrderedIndex`]: ranked sets, plain sets and lazy key expiry behind one
//! lock. Holding the lock for a whole batch is what makes [`OrderedIndex::atomic`] atomic.
//!
//! Ordering follows the usual ranked-set rules: ascending by score, ties broken by member
//! bytes; reverse ranges are the exact mirror.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rf_core::{FeedError, IndexOp, OrderedIndex, Result};
use tracing::trace;

/// Score wrapper with a total order so it can live in a `BTreeSet`.
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Default, Clone)]
struct RankedSet {
    scores: HashMap<String, f64>,
    order: BTreeSet<(Score, String)>,
}

impl RankedSet {
    fn insert(&mut self, member: &str, score: f64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.order.remove(&(Score(old), member.to_string()));
        }
        self.order.insert((Score(score), member.to_string()));
    }

    fn incr(&mut self, member: &str, delta: f64) {
        let score = self.scores.get(member).copied().unwrap_or(0.0) + delta;
        self.insert(member, score);
    }

    fn remove(&mut self, member: &str) {
        if let Some(old) = self.scores.remove(member) {
            self.order.remove(&(Score(old), member.to_string()));
        }
    }

    fn len(&self) -> usize {
        self.scores.len()
    }
}

#[derive(Debug, Clone)]
enum Value {
    Ranked(RankedSet),
    Plain(HashSet<String>),
}

#[derive(Debug, Default)]
struct State {
    values: HashMap<String, Value>,
    expires: HashMap<String, Instant>,
}

impl State {
    /// Drops `key` if its deadline has passed.
    fn expire(&mut self, key: &str) {
        if self.expires.get(key).is_some_and(|at| *at <= Instant::now()) {
            trace!(key, "expired");
            self.expires.remove(key);
            self.values.remove(key);
        }
    }

    fn ranked(&mut self, key: &str) -> Result<Option<&RankedSet>> {
        self.expire(key);
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::Ranked(z)) => Ok(Some(z)),
            Some(Value::Plain(_)) => Err(wrong_type(key)),
        }
    }

    fn ranked_mut(&mut self, key: &str) -> Result<&mut RankedSet> {
        self.expire(key);
        match self
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::Ranked(RankedSet::default()))
        {
            Value::Ranked(z) => Ok(z),
            Value::Plain(_) => Err(wrong_type(key)),
        }
    }

    fn plain(&mut self, key: &str) -> Result<Option<&HashSet<String>>> {
        self.expire(key);
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::Plain(s)) => Ok(Some(s)),
            Some(Value::Ranked(_)) => Err(wrong_type(key)),
        }
    }

    fn plain_mut(&mut self, key: &str) -> Result<&mut HashSet<String>> {
        self.expire(key);
        match self
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::Plain(HashSet::new()))
        {
            Value::Plain(s) => Ok(s),
            Value::Ranked(_) => Err(wrong_type(key)),
        }
    }

    /// Empty collections do not exist, as in the real store.
    fn prune(&mut self, key: &str) {
        let empty = match self.values.get(key) {
            Some(Value::Ranked(z)) => z.len() == 0,
            Some(Value::Plain(s)) => s.is_empty(),
            None => false,
        };
        if empty {
            self.values.remove(key);
            self.expires.remove(key);
        }
    }

    fn check(&mut self, op: &IndexOp) -> Result<()> {
        match op {
            IndexOp::ZAdd { key, .. } | IndexOp::ZIncrBy { key, .. } | IndexOp::ZRem { key, .. } => {
                self.ranked(key).map(|_| ())
            }
            IndexOp::SAdd { key, .. } | IndexOp::SRem { key, .. } => self.plain(key).map(|_| ()),
            IndexOp::Del { .. } => Ok(()),
        }
    }

    fn apply(&mut self, op: IndexOp) -> Result<()> {
        match op {
            IndexOp::ZAdd { key, member, score } => self.ranked_mut(&key)?.insert(&member, score),
            IndexOp::ZIncrBy { key, member, delta } => self.ranked_mut(&key)?.incr(&member, delta),
            IndexOp::ZRem { key, members } => {
                if self.ranked(&key)?.is_some() {
                    let z = self.ranked_mut(&key)?;
                    for m in &members {
                        z.remove(m);
                    }
                    self.prune(&key);
                }
            }
            IndexOp::SAdd { key, member } => {
                self.plain_mut(&key)?.insert(member);
            }
            IndexOp::SRem { key, member } => {
                if self.plain(&key)?.is_some() {
                    self.plain_mut(&key)?.remove(&member);
                    self.prune(&key);
                }
            }
            IndexOp::Del { keys } => {
                for key in keys {
                    self.values.remove(&key);
                    self.expires.remove(&key);
                }
            }
        }
        Ok(())
    }
}

fn wrong_type(key: &str) -> FeedError {
    FeedError::Validation(format!("key {key} holds the wrong kind of value"))
}

#[derive(Debug, Default)]
pub struct MemoryIndex {
    state: Mutex<State>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys, for tests and diagnostics.
    pub fn key_count(&self) -> usize {
        let mut state = self.state.lock();
        let keys: Vec<String> = state.values.keys().cloned().collect();
        for key in &keys {
            state.expire(key);
        }
        state.values.len()
    }
}

#[async_trait]
impl OrderedIndex for MemoryIndex {
    async fn atomic(&self, ops: Vec<IndexOp>) -> Result<()> {
        let mut state = self.state.lock();
        // Type errors are found before anything is written, so a failed batch changes nothing.
        for op in &ops {
            state.check(op)?;
        }
        for op in ops {
            state.apply(op)?;
        }
        Ok(())
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut state = self.state.lock();
        Ok(state
            .ranked(key)?
            .and_then(|z| z.scores.get(member).copied()))
    }

    async fn zscores(&self, key: &str, members: &[String]) -> Result<Vec<Option<f64>>> {
        let mut state = self.state.lock();
        let z = state.ranked(key)?;
        Ok(members
            .iter()
            .map(|m| z.and_then(|z| z.scores.get(m).copied()))
            .collect())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut state = self.state.lock();
        Ok(state.ranked(key)?.map_or(0, |z| z.len() as u64))
    }

    async fn zrevrange(&self, key: &str, start: u64, stop: u64) -> Result<Vec<String>> {
        if stop < start {
            return Ok(Vec::new());
        }
        let mut state = self.state.lock();
        Ok(state
            .ranked(key)?
            .map(|z| {
                z.order
                    .iter()
                    .rev()
                    .skip(start as usize)
                    .take((stop - start + 1) as usize)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn zrange_all(&self, key: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        Ok(state
            .ranked(key)?
            .map(|z| z.order.iter().map(|(_, m)| m.clone()).collect())
            .unwrap_or_default())
    }

    async fn zcount_each(&self, keys: &[String], min: f64, max: f64) -> Result<Vec<u64>> {
        let mut state = self.state.lock();
        keys.iter()
            .map(|key| {
                Ok(state.ranked(key)?.map_or(0, |z| {
                    z.order
                        .range((Score(min), String::new())..)
                        .take_while(|(s, _)| s.0 <= max)
                        .count() as u64
                }))
            })
            .collect()
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut state = self.state.lock();
        Ok(state.plain(key)?.is_some_and(|s| s.contains(member)))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock();
        state.expire(key);
        Ok(state.values.contains_key(key))
    }

    async fn zinterstore_max(
        &self,
        dest: &str,
        set_key: &str,
        zset_key: &str,
        ttl: Duration,
    ) -> Result<u64> {
        let mut state = self.state.lock();
        let mut out = RankedSet::default();
        if let (Some(set), Some(z)) = (state.plain(set_key)?.cloned(), state.ranked(zset_key)?) {
            for member in &set {
                if let Some(score) = z.scores.get(member) {
                    // plain-set members weigh 1
                    out.insert(member, score.max(1.0));
                }
            }
        }
        let size = out.len() as u64;
        state.values.remove(dest);
        state.expires.remove(dest);
        if size > 0 {
            state.values.insert(dest.to_string(), Value::Ranked(out));
            state.expires.insert(dest.to_string(), Instant::now() + ttl);
        }
        Ok(size)
    }
}
