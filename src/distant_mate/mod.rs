//! The distant-mate table (spec §4.2): a lookup, built in pass 1, from
//! read name to the mate record and its global `FileIndex`, for mates that
//! fall outside their own shard's padded boundary.
//!
//! Backed either by a single in-memory map or by `N` on-disk, `snap`-framed
//! shard files, opened through a reference-counted reader so that
//! concurrent pass-2 workers querying the same disk shard share one
//! decoded map — the same discipline the teacher's WASM `store.rs` uses
//! for its process-wide `RwLock`-protected store, generalized here to `N`
//! independently-locked shards instead of one.

mod codec;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{DupmarkError, Result};
use crate::record::{AlignmentRecord, FileIndex};

pub use codec::{decode_entry, encode_entry};

/// A record held in the distant-mate table, identified by the shard it was
/// originally observed in and its index within that shard's own pass-1
/// traversal. The eventual global `FileIndex` is resolved lazily from
/// `shard_offsets` once pass 1's barrier has assigned global ranges (spec
/// §4.2's "per-shard stored fileIndex is rewritten" step, realized here as
/// a read-time lookup instead of an in-place rewrite).
#[derive(Debug, Clone)]
pub struct DistantMateEntry {
  pub record: AlignmentRecord,
  pub origin_shard: usize,
  pub local_index: u64,
}

impl DistantMateEntry {
  pub fn global_file_index(&self, shard_offsets: &[FileIndex]) -> FileIndex {
    shard_offsets[self.origin_shard] + self.local_index
  }

  fn dedup_key(&self) -> (&str, i32, i64, u8, u16, i32, i64, i64) {
    let r = &self.record;
    (
      r.name.as_str(),
      r.ref_id,
      r.pos,
      r.mapq,
      r.flags.0,
      r.mate_ref_id,
      r.mate_pos,
      r.template_len,
    )
  }
}

/// Pick the entry representing `querying`'s mate out of the (at most two)
/// entries filed under one read name: the one whose read1/read2 flag
/// differs from the querying read's own.
pub fn resolve_mate<'a>(entries: &'a [DistantMateEntry], querying_is_read1: bool) -> Option<&'a DistantMateEntry> {
  entries
    .iter()
    .find(|e| e.record.flags.is_read1() != querying_is_read1)
}

/// De-duplicate entries filed under one read name and enforce the `>2`
/// fatal-consistency rule (spec §4.2).
fn dedup_and_validate(name: &str, mut entries: Vec<DistantMateEntry>) -> Result<Vec<DistantMateEntry>> {
  let original_count = entries.len();
  // `key` borrows from `e`, which is moved into `deduped` on this same
  // iteration, so compare against an owned clone of the key instead of
  // the borrow.
  let mut seen: Vec<(String, i32, i64, u8, u16, i32, i64, i64)> = Vec::new();
  let mut deduped = Vec::new();
  for e in entries.drain(..) {
    let key = e.dedup_key();
    let owned_key = (e.record.name.clone(), key.1, key.2, key.3, key.4, key.5, key.6, key.7);
    if seen.iter().any(|s| *s == owned_key) {
      continue;
    }
    seen.push(owned_key);
    deduped.push(e);
  }
  if deduped.len() < original_count {
    log::warn!(
      "distant-mate table: dropped {} duplicate entr{} for read name {name:?}",
      original_count - deduped.len(),
      if original_count - deduped.len() == 1 { "y" } else { "ies" }
    );
  }
  if deduped.len() > 2 {
    return Err(DupmarkError::input_integrity(format!(
      "distant-mate table: read name {name:?} has {} distinct entries, expected at most 2",
      deduped.len()
    )));
  }
  Ok(deduped)
}

/// Backing storage for the distant-mate table (spec §4.2).
pub enum DistantMateStore {
  Memory(MemoryTable),
  Disk(DiskTable),
}

impl DistantMateStore {
  pub fn memory() -> DistantMateStore {
    DistantMateStore::Memory(MemoryTable::default())
  }

  pub fn disk(dir: PathBuf, shard_count: usize) -> Result<DistantMateStore> {
    Ok(DistantMateStore::Disk(DiskTable::new(dir, shard_count)?))
  }

  /// Map an originating input shard to one of the table's mate shards.
  pub fn mate_shard_of(&self, input_shard_idx: usize, total_input_shards: usize) -> usize {
    match self {
      DistantMateStore::Memory(_) => 0,
      DistantMateStore::Disk(d) => {
        if total_input_shards == 0 {
          0
        } else {
          (input_shard_idx * d.shard_count) / total_input_shards
        }
      }
    }
  }

  pub fn insert(&self, mate_shard_idx: usize, entry: DistantMateEntry) -> Result<()> {
    match self {
      DistantMateStore::Memory(m) => m.insert(entry),
      DistantMateStore::Disk(d) => d.insert(mate_shard_idx, entry),
    }
  }

  pub fn open_shard(&self, mate_shard_idx: usize) -> Result<ShardView<'_>> {
    match self {
      DistantMateStore::Memory(m) => Ok(ShardView::Memory(m)),
      DistantMateStore::Disk(d) => Ok(ShardView::Disk(d.open(mate_shard_idx)?)),
    }
  }
}

/// A view of one open shard's mate entries, alive for the duration of one
/// pass-2 worker's processing of its shard.
pub enum ShardView<'a> {
  Memory(&'a MemoryTable),
  Disk(DiskShardGuard<'a>),
}

impl<'a> ShardView<'a> {
  pub fn mates(&self, name: &str) -> Vec<DistantMateEntry> {
    match self {
      ShardView::Memory(m) => m.mates(name),
      ShardView::Disk(g) => g.mates(name),
    }
  }
}

/// Single in-memory map keyed by read name (spec §4.2, used when no
/// disk-shard count is configured).
#[derive(Default)]
pub struct MemoryTable {
  map: RwLock<HashMap<String, Vec<DistantMateEntry>>>,
}

impl MemoryTable {
  fn insert(&self, entry: DistantMateEntry) -> Result<()> {
    let mut map = self.map.write().expect("distant-mate memory table poisoned");
    map.entry(entry.record.name.clone()).or_default().push(entry);
    Ok(())
  }

  fn mates(&self, name: &str) -> Vec<DistantMateEntry> {
    self
      .map
      .read()
      .expect("distant-mate memory table poisoned")
      .get(name)
      .cloned()
      .unwrap_or_default()
  }
}

struct OpenDiskShard {
  map: Arc<HashMap<String, Vec<DistantMateEntry>>>,
  refcount: usize,
}

/// `N` on-disk, `snap`-compressed shard files (spec §4.2), each written
/// append-only during phase 1 under its own mutex, then fully decoded once
/// and shared across concurrent phase-2 readers via a reference-counted
/// registry.
pub struct DiskTable {
  dir: PathBuf,
  shard_count: usize,
  writers: Vec<Mutex<snap::write::FrameEncoder<File>>>,
  open: Mutex<HashMap<usize, OpenDiskShard>>,
}

impl DiskTable {
  fn new(dir: PathBuf, shard_count: usize) -> Result<DiskTable> {
    std::fs::create_dir_all(&dir).map_err(|e| DupmarkError::resource(&dir, e))?;
    let mut writers = Vec::with_capacity(shard_count);
    for idx in 0..shard_count {
      let path = shard_path(&dir, idx);
      let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)
        .map_err(|e| DupmarkError::resource(&path, e))?;
      writers.push(Mutex::new(snap::write::FrameEncoder::new(file)));
    }
    Ok(DiskTable {
      dir,
      shard_count,
      writers,
      open: Mutex::new(HashMap::new()),
    })
  }

  fn insert(&self, mate_shard_idx: usize, entry: DistantMateEntry) -> Result<()> {
    let mut writer = self.writers[mate_shard_idx]
      .lock()
      .expect("distant-mate disk writer poisoned");
    encode_entry(&mut *writer, &entry).map_err(DupmarkError::Io)
  }

  /// Flush all writers to disk; called once at the end of phase 1, before
  /// any shard is opened for reading.
  pub fn finish_writes(&self) -> Result<()> {
    for w in &self.writers {
      w.lock().expect("distant-mate disk writer poisoned").flush().map_err(DupmarkError::Io)?;
    }
    Ok(())
  }

  fn open(&self, mate_shard_idx: usize) -> Result<DiskShardGuard<'_>> {
    let mut open = self.open.lock().expect("distant-mate disk registry poisoned");
    if let Some(entry) = open.get_mut(&mate_shard_idx) {
      entry.refcount += 1;
    } else {
      let path = shard_path(&self.dir, mate_shard_idx);
      let file = File::open(&path).map_err(|e| DupmarkError::resource(&path, e))?;
      let raw_entries = codec::decode_all(file).map_err(DupmarkError::Io)?;
      let mut by_name: HashMap<String, Vec<DistantMateEntry>> = HashMap::new();
      for e in raw_entries {
        by_name.entry(e.record.name.clone()).or_default().push(e);
      }
      for (name, entries) in by_name.iter_mut() {
        let validated = dedup_and_validate(name, std::mem::take(entries))?;
        *entries = validated;
      }
      open.insert(
        mate_shard_idx,
        OpenDiskShard {
          map: Arc::new(by_name),
          refcount: 1,
        },
      );
    }
    let map = Arc::clone(&open.get(&mate_shard_idx).unwrap().map);
    Ok(DiskShardGuard {
      table: self,
      shard_idx: mate_shard_idx,
      map,
    })
  }

  fn close(&self, mate_shard_idx: usize) {
    let mut open = self.open.lock().expect("distant-mate disk registry poisoned");
    if let Some(entry) = open.get_mut(&mate_shard_idx) {
      entry.refcount -= 1;
      if entry.refcount == 0 {
        open.remove(&mate_shard_idx);
      }
    }
  }
}

fn shard_path(dir: &Path, idx: usize) -> PathBuf {
  dir.join(format!("mate-shard-{idx:05}.snap"))
}

/// Reference-counted handle on one decoded disk shard. Dropping it
/// decrements the shard's refcount, releasing the decoded map once no
/// reader remains (spec §4.2).
pub struct DiskShardGuard<'a> {
  table: &'a DiskTable,
  shard_idx: usize,
  map: Arc<HashMap<String, Vec<DistantMateEntry>>>,
}

impl<'a> DiskShardGuard<'a> {
  fn mates(&self, name: &str) -> Vec<DistantMateEntry> {
    self.map.get(name).cloned().unwrap_or_default()
  }
}

impl<'a> Drop for DiskShardGuard<'a> {
  fn drop(&mut self) {
    self.table.close(self.shard_idx);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::{Cigar, Flags};

  fn sample(name: &str, is_read1: bool) -> AlignmentRecord {
    let mut flags = Flags(Flags::PAIRED);
    flags.set_duplicate(false);
    if is_read1 {
      flags.0 |= Flags::READ1;
    } else {
      flags.0 |= Flags::READ2;
    }
    AlignmentRecord {
      name: name.to_string(),
      ref_id: 0,
      pos: 10,
      mapq: 40,
      flags,
      cigar: Cigar(vec![(crate::record::CigarOp::Match, 50)]),
      sequence: vec![b'A'; 50],
      qualities: vec![30; 50],
      mate_ref_id: 0,
      mate_pos: 500,
      template_len: 490,
      aux: Vec::new(),
      file_index: None,
    }
  }

  #[test]
  fn memory_table_round_trips_and_resolves_mate() {
    let table = DistantMateStore::memory();
    table
      .insert(
        0,
        DistantMateEntry {
          record: sample("read-a", true),
          origin_shard: 2,
          local_index: 3,
        },
      )
      .unwrap();
    let view = table.open_shard(0).unwrap();
    let mates = view.mates("read-a");
    assert_eq!(mates.len(), 1);
    let mate = resolve_mate(&mates, false).unwrap();
    assert_eq!(mate.global_file_index(&[0, 0, 100]), 103);
  }

  #[test]
  fn dedup_drops_identical_entries() {
    let a = DistantMateEntry {
      record: sample("read-a", true),
      origin_shard: 0,
      local_index: 1,
    };
    let b = DistantMateEntry {
      record: sample("read-a", true),
      origin_shard: 1,
      local_index: 9,
    };
    let result = dedup_and_validate("read-a", vec![a, b]).unwrap();
    assert_eq!(result.len(), 1);
  }

  #[test]
  fn more_than_two_distinct_entries_is_fatal() {
    let mut a = sample("read-a", true);
    let mut b = sample("read-a", false);
    let mut c = sample("read-a", true);
    c.pos = 999;
    a.pos = 10;
    b.pos = 20;
    let entries = vec![
      DistantMateEntry { record: a, origin_shard: 0, local_index: 0 },
      DistantMateEntry { record: b, origin_shard: 0, local_index: 1 },
      DistantMateEntry { record: c, origin_shard: 0, local_index: 2 },
    ];
    assert!(dedup_and_validate("read-a", entries).is_err());
  }
}
