//! Process-wide `AlignmentRecord` pool (spec §4.8).
//!
//! The original design embeds a "magic" discriminator word in every record
//! to catch a record not originating from the pool at runtime. In an
//! ownership-based port that check is unnecessary: `get`/`put` hand out and
//! take back plain owned `Box<AlignmentRecord>`s, so a record's origin is
//! tracked by normal Rust ownership (whoever holds the box) rather than by
//! a runtime tag. `processor::process_shard` draws one box per record on
//! read and returns it once the record is emitted or dropped (spec §3's
//! pool lifecycle).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::record::AlignmentRecord;

struct Shard {
  free: Mutex<Vec<Box<AlignmentRecord>>>,
  count: AtomicUsize,
}

/// A sharded free-list pool. Insert picks the less-loaded of two
/// power-of-two-chosen shards; get pulls from a shard chosen the same way.
/// Bounded in aggregate size: puts beyond `capacity` are simply dropped
/// rather than retained.
pub struct RecordPool {
  shards: Vec<Shard>,
  capacity_per_shard: usize,
  next_probe: AtomicUsize,
}

impl RecordPool {
  pub fn new(shard_count: usize, capacity: usize) -> RecordPool {
    let shard_count = shard_count.max(1);
    let shards = (0..shard_count)
      .map(|_| Shard {
        free: Mutex::new(Vec::new()),
        count: AtomicUsize::new(0),
      })
      .collect();
    RecordPool {
      shards,
      capacity_per_shard: (capacity / shard_count).max(1),
      next_probe: AtomicUsize::new(0),
    }
  }

  fn two_candidate_shards(&self) -> (usize, usize) {
    if self.shards.len() == 1 {
      return (0, 0);
    }
    let base = self.next_probe.fetch_add(1, Ordering::Relaxed);
    let a = base % self.shards.len();
    let mut b = (base + 1 + (base / self.shards.len())) % self.shards.len();
    if b == a {
      b = (b + 1) % self.shards.len();
    }
    (a, b)
  }

  /// Take a record from the pool, or allocate a fresh default one if every
  /// probed shard is empty.
  pub fn get(&self) -> Box<AlignmentRecord> {
    let (a, b) = self.two_candidate_shards();
    for idx in [a, b] {
      let mut free = self.shards[idx].free.lock().expect("record pool shard poisoned");
      if let Some(rec) = free.pop() {
        self.shards[idx].count.fetch_sub(1, Ordering::Relaxed);
        return rec;
      }
    }
    Box::new(AlignmentRecord::default())
  }

  /// Return a record to whichever of two power-of-two-chosen shards is
  /// currently less loaded; dropped outright once that shard is at
  /// capacity.
  pub fn put(&self, record: Box<AlignmentRecord>) {
    let (a, b) = self.two_candidate_shards();
    let target = if self.shards[a].count.load(Ordering::Relaxed) <= self.shards[b].count.load(Ordering::Relaxed) {
      a
    } else {
      b
    };
    if self.shards[target].count.load(Ordering::Relaxed) >= self.capacity_per_shard {
      return;
    }
    let mut free = self.shards[target].free.lock().expect("record pool shard poisoned");
    free.push(record);
    self.shards[target].count.fetch_add(1, Ordering::Relaxed);
  }

  pub fn len(&self) -> usize {
    self.shards.iter().map(|s| s.count.load(Ordering::Relaxed)).sum()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_trips_a_record() {
    let pool = RecordPool::new(4, 16);
    let rec = pool.get();
    pool.put(rec);
    assert_eq!(pool.len(), 1);
    let _ = pool.get();
    assert_eq!(pool.len(), 0);
  }

  #[test]
  fn drops_beyond_capacity() {
    let pool = RecordPool::new(1, 2);
    for _ in 0..5 {
      pool.put(Box::new(AlignmentRecord::default()));
    }
    assert!(pool.len() <= 2);
  }
}
