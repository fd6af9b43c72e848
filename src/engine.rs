//! Two-phase orchestration (spec §5).
//!
//! Phase 1 scans every record once to populate the [`distant_mate`] table.
//! Tagging decisions are then computed once, globally, over the whole
//! in-memory record set (see [`build_tag_decisions`]) rather than
//! reassembled independently inside each shard — see the `processor`
//! module doc for why a purely per-shard re-derivation would need to ship
//! primary-selection results back across shard boundaries anyway. Phase 2
//! dispatches [`crate::processor::process_shard`] across a `rayon` pool
//! sized to `config.parallelism`, feeding finished shards to the
//! [`OrderedWriter`] and merging each shard's metrics.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rayon::prelude::*;

use crate::config::{Config, DistantMateBacking, ShardStrategy};
use crate::distant_mate::{DistantMateEntry, DistantMateStore};
use crate::error::{DupmarkError, Result};
use crate::header::Header;
use crate::matcher::{compute_duplicate_sets, DuplicateSet, MatcherConfig, SetMember};
use crate::metrics::MetricsCollector;
use crate::optical::{self, HistogramClusterKey, HistogramItem, OpticalBucketKey, OpticalItem};
use crate::pair::{Pair, UmiCorrector};
use crate::pool::RecordPool;
use crate::processor::{self, process_shard, TagDecision};
use crate::record::{AlignmentRecord, FileIndex, UNMAPPED_REF_ID};
use crate::shard::{self, IndexEntry, Shard};
use crate::writer::{OrderedWriter, ShardSink};

/// Headline counters and the merged per-library metrics for one run (spec
/// §5/§6); the CLI logs these and writes the metrics/histogram files from
/// `metrics`.
#[derive(Debug, Default)]
pub struct RunSummary {
  pub metrics: MetricsCollector,
  pub shards_planned: usize,
  pub records_in: usize,
  pub records_out: usize,
  pub phase1_elapsed: std::time::Duration,
  pub phase2_elapsed: std::time::Duration,
}

/// Which shard owns a raw `(refId, pos)` coordinate. Used both for
/// emission ownership (always raw position, never five-prime — see the
/// `writer`/`processor` module docs) and to route phase-1 distant-mate
/// entries to the shard that will actually process the far mate.
fn core_shard_for(shards: &[Shard], ref_id: i32, pos: i64) -> Result<usize> {
  if ref_id == UNMAPPED_REF_ID {
    return shards
      .iter()
      .position(|s| s.is_unmapped_shard())
      .ok_or_else(|| DupmarkError::invariant("an unmapped record was encountered but no unmapped shard was planned"));
  }
  let idx = shards.partition_point(|s| !s.is_unmapped_shard() && (s.start_ref, s.start_pos) <= (ref_id, pos));
  if idx == 0 {
    return Err(DupmarkError::invariant(format!(
      "position {ref_id}:{pos} precedes every planned shard"
    )));
  }
  let candidate = &shards[idx - 1];
  if candidate.start_ref == ref_id && pos < candidate.end_pos {
    Ok(idx - 1)
  } else {
    Err(DupmarkError::invariant(format!(
      "position {ref_id}:{pos} is not covered by any planned shard"
    )))
  }
}

fn plan_shards(config: &Config, header: &Header, index_entries: Option<&[IndexEntry]>) -> Result<Vec<Shard>> {
  let shards = match config.shard_strategy {
    ShardStrategy::ByPosition { shard_size } => shard::plan_by_position(header, shard_size, config.padding, true),
    ShardStrategy::ByBytes { bytes_per_shard, min_bases } => {
      let entries = index_entries.ok_or_else(|| {
        DupmarkError::config("byte-based shard planning requires index entries but none were supplied")
      })?;
      shard::plan_by_bytes(header, entries, bytes_per_shard, min_bases, config.padding, true)?
    }
  };
  shard::check_invariants(&shards);
  Ok(shards)
}

/// Phase 1 (spec §4.2): for every record whose mate is mapped, file a copy
/// under the distant-mate table keyed by the shard that owns the mate,
/// unless that shard would already see this record directly inside its own
/// padded region.
fn populate_distant_mate_table(records: &[AlignmentRecord], shards: &[Shard], header: &Header, store: &DistantMateStore) -> Result<()> {
  for rec in records {
    if !rec.is_paired_with_mapped_mate() {
      continue;
    }
    let target_shard = core_shard_for(shards, rec.mate_ref_id, rec.mate_pos)?;
    let ref_len = header.reference_len(shards[target_shard].start_ref).unwrap_or(0);
    if !shards[target_shard].contains_five_prime(rec.ref_id, rec.pos, ref_len) {
      let mate_shard_phys = store.mate_shard_of(target_shard, shards.len());
      store.insert(
        mate_shard_phys,
        DistantMateEntry {
          record: rec.clone(),
          origin_shard: target_shard,
          local_index: rec.file_index.unwrap_or(0),
        },
      )?;
    }
  }
  if let DistantMateStore::Disk(disk) = store {
    disk.finish_writes()?;
  }
  Ok(())
}

/// Build the global `SetMember` list eligible for matching (spec §4.3):
/// secondary/supplementary/unmapped records never enter matching; a
/// mate-unmapped record is a singleton; a mapped record with a mapped mate
/// is resolved into a `Pair` by read name across the whole run.
fn build_set_members(records: &[AlignmentRecord]) -> Vec<SetMember> {
  let mut pending: HashMap<&str, usize> = HashMap::new();
  let mut members = Vec::new();
  for (i, rec) in records.iter().enumerate() {
    if rec.flags.is_secondary() || rec.flags.is_supplementary() {
      continue;
    }
    if rec.is_mate_unmapped_singleton() {
      members.push(SetMember::Singleton(rec.clone()));
      continue;
    }
    if !rec.is_paired_with_mapped_mate() {
      continue;
    }
    match pending.remove(rec.name.as_str()) {
      Some(other_idx) => members.push(SetMember::Pair(Pair::new(records[other_idx].clone(), rec.clone()))),
      None => {
        pending.insert(&rec.name, i);
      }
    }
  }
  members
}

/// Run the optical-duplicate test over one `DuplicateSet`'s pairs, and
/// write every member's `TagDecision` into `decisions` (spec §4.3/§4.5).
fn apply_set_decisions(set: &DuplicateSet, config: &Config, decisions: &mut HashMap<FileIndex, TagDecision>) -> Result<()> {
  let mut optical_members: HashSet<usize> = HashSet::new();
  if set.has_pairs && config.optical.pixel_distance >= 0 {
    let mut items = Vec::new();
    let mut items_to_member = Vec::new();
    let mut primary_item_idx = None;
    for (i, m) in set.members.iter().enumerate() {
      if let SetMember::Pair(p) = m {
        let coords = optical::parse_coords(&p.left.name)?;
        let read_group = processor::read_group_of(&p.left).map(|s| s.to_string());
        let bucket = OpticalBucketKey {
          lane: coords.lane,
          tile: coords.tile,
          read_group,
          orientation: p.orientation(),
        };
        items.push(OpticalItem { coords, bucket });
        items_to_member.push(i);
        if i == set.primary_idx {
          primary_item_idx = Some(items.len() - 1);
        }
      }
    }
    // `has_pairs` guarantees `pick_primary` chose a pair (it always
    // outranks any singleton), so `primary_item_idx` is always `Some` here.
    if let Some(primary_item_idx) = primary_item_idx {
      let flagged = optical::detect_optical(&items, primary_item_idx, config.optical.pixel_distance);
      for (item_idx, is_optical) in flagged.into_iter().enumerate() {
        if is_optical {
          optical_members.insert(items_to_member[item_idx]);
        }
      }
    }
  }

  let pair_count = set.members.iter().filter(|m| matches!(m, SetMember::Pair(_))).count();
  let optical_count = optical_members.len();
  let di: Option<FileIndex> = match &set.members[set.primary_idx] {
    SetMember::Pair(p) => p.left.file_index,
    SetMember::Singleton(_) => None,
  };

  for (i, member) in set.members.iter().enumerate() {
    let is_primary = i == set.primary_idx;
    let is_pair_member = matches!(member, SetMember::Pair(_));
    // Singletons never carry DI/DS/DL, only DT and the duplicate bit
    // (DESIGN.md open question #1): the set-size counts stay pair-only.
    let dt = if is_primary {
      None
    } else if optical_members.contains(&i) {
      Some("SQ")
    } else {
      Some("LB")
    };
    let decision = TagDecision {
      is_duplicate: !is_primary,
      is_pair_member,
      di: if is_pair_member { di } else { None },
      ds: if is_pair_member { Some(pair_count as u32) } else { None },
      dl: if is_pair_member { Some((pair_count - optical_count) as u32) } else { None },
      dt,
      du: set.corrected_umi.get(&i).cloned(),
    };
    match member {
      SetMember::Pair(p) => {
        if let Some(fi) = p.left.file_index {
          decisions.insert(fi, decision.clone());
        }
        if let Some(fi) = p.right.file_index {
          decisions.insert(fi, decision);
        }
      }
      SetMember::Singleton(r) => {
        if let Some(fi) = r.file_index {
          decisions.insert(fi, decision);
        }
      }
    }
  }
  Ok(())
}

/// Compute every record's tagging decision in one global pass, and fold in
/// the optical-distance histogram samples when one was requested (spec
/// §4.5's "when an optical-histogram output is requested").
fn build_tag_decisions(
  records: &[AlignmentRecord],
  config: &Config,
  known_umis: Option<&UmiCorrector>,
  metrics: &mut MetricsCollector,
) -> Result<HashMap<FileIndex, TagDecision>> {
  let members = build_set_members(records);

  if config.optical.histogram_path.is_some() {
    let mut histogram_items = Vec::new();
    for m in &members {
      if let SetMember::Pair(p) = m {
        let coords = optical::parse_coords(&p.left.name)?;
        let read_group = processor::read_group_of(&p.left).map(|s| s.to_string());
        histogram_items.push(HistogramItem {
          coords,
          file_index: p.left.file_index.unwrap_or(0),
          cluster: HistogramClusterKey {
            lane: coords.lane,
            read_group,
            orientation: p.orientation(),
          },
        });
      }
    }
    for (bag_size, distance) in optical::sample_histogram_distances(&histogram_items, config.optical.histogram_max_per_cluster) {
      metrics.histogram.record(bag_size, distance);
    }
  }

  let matcher_config = MatcherConfig {
    strand_specific: config.strand_specific,
    separate_singletons: config.separate_singletons,
    use_umis: config.umi.use_umis,
    scavenge_distance: config.umi.scavenge_distance,
    known_umis,
  };
  let sets = compute_duplicate_sets(members, &matcher_config)?;

  let mut decisions = HashMap::new();
  for set in &sets {
    apply_set_decisions(set, config, &mut decisions)?;
  }
  Ok(decisions)
}

/// Run one full duplicate-marking pass (spec §5): `records` must already be
/// coordinate-sorted (the engine trusts, but the clip-distance and
/// distant-mate checks in `processor::process_shard` catch the
/// consequences of a violation). `index_entries` is required only when
/// `config.shard_strategy` is `ByBytes`.
pub fn run<S: ShardSink>(
  config: &Config,
  header: Header,
  mut records: Vec<AlignmentRecord>,
  index_entries: Option<Vec<IndexEntry>>,
  known_umis: Option<UmiCorrector>,
  sink: S,
) -> Result<(RunSummary, S)> {
  config.validate()?;
  let records_in = records.len();
  let phase1_start = std::time::Instant::now();

  for (i, rec) in records.iter_mut().enumerate() {
    rec.file_index = Some(i as u64);
    rec.validate()?;
  }

  let shards = plan_shards(config, &header, index_entries.as_deref())?;
  let shard_count = shards.len();

  let store = match config.distant_mate_backing {
    DistantMateBacking::Memory => DistantMateStore::memory(),
    DistantMateBacking::Disk { shard_count } => DistantMateStore::disk(config.scratch_dir.clone(), shard_count)?,
  };
  populate_distant_mate_table(&records, &shards, &header, &store)?;

  let mut metrics = MetricsCollector::default();
  let decisions = build_tag_decisions(&records, config, known_umis.as_ref(), &mut metrics)?;
  let phase1_elapsed = phase1_start.elapsed();

  // Partition every record into the shard that owns it by raw position
  // (emission ownership), preserving input order within each bucket.
  let mut buckets: Vec<Vec<AlignmentRecord>> = vec![Vec::new(); shard_count];
  for rec in records {
    let idx = core_shard_for(&shards, rec.ref_id, rec.pos)?;
    buckets[idx].push(rec);
  }
  let indexed_buckets: Vec<(usize, Vec<AlignmentRecord>)> = buckets.into_iter().enumerate().collect();

  let writer = OrderedWriter::new(sink, config.queue_len);
  let metrics_mutex = Mutex::new(metrics);
  let records_out = AtomicUsize::new(0);

  // One shard of free list per worker, so a shard's `get`/`put` rarely
  // contends with another worker's (spec §4.8's power-of-two sharding).
  // Capacity is a fixed in-flight-records budget, not sized to the whole
  // input: the pool caps allocator traffic between concurrently running
  // shards, it does not need to hold every record at once.
  let record_pool = RecordPool::new(config.parallelism.max(1), config.parallelism.max(1) * 4096);

  let worker_pool = rayon::ThreadPoolBuilder::new()
    .num_threads(config.parallelism)
    .build()
    .map_err(|e| DupmarkError::invariant(format!("failed to build the worker thread pool: {e}")))?;

  let phase2_start = std::time::Instant::now();
  worker_pool.install(|| {
    indexed_buckets.into_par_iter().try_for_each(|(idx, core_records)| -> Result<()> {
      let shard = &shards[idx];
      let ref_len = header.reference_len(shard.start_ref).unwrap_or(0);
      let mate_shard_phys = store.mate_shard_of(idx, shard_count);
      let (out, shard_metrics) = process_shard(shard, &header, ref_len, core_records, &decisions, &store, mate_shard_phys, config, &record_pool)?;
      records_out.fetch_add(out.len(), Ordering::Relaxed);
      writer.insert(idx, out)?;
      metrics_mutex.lock().expect("metrics mutex poisoned").merge(&shard_metrics);
      Ok(())
    })
  })?;

  let phase2_elapsed = phase2_start.elapsed();
  let metrics = metrics_mutex.into_inner().expect("metrics mutex poisoned");
  let sink = writer.into_sink();

  Ok((
    RunSummary {
      metrics,
      shards_planned: shard_count,
      records_in,
      records_out: records_out.into_inner(),
      phase1_elapsed,
      phase2_elapsed,
    },
    sink,
  ))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{OutputFormat, UmiConfig};
  use crate::header::Reference;
  use crate::optical::OpticalConfig;
  use crate::record::{Cigar, CigarOp, Flags};
  use crate::writer::VecSink;

  fn header() -> Header {
    Header::new(vec![Reference { name: "chr1".to_string(), length: 1000 }], Default::default())
  }

  fn base_config() -> Config {
    Config {
      input_path: "in.bam".into(),
      index_path: None,
      output_path: "out.bam".into(),
      output_format: OutputFormat::Bam,
      parallelism: 2,
      queue_len: 4,
      shard_strategy: ShardStrategy::ByPosition { shard_size: 1000 },
      padding: 10,
      distant_mate_backing: DistantMateBacking::Memory,
      scratch_dir: "/tmp".into(),
      clear_existing: false,
      remove_duplicates: false,
      tag_duplicates: true,
      integer_di: false,
      emit_unmodified_fields: true,
      separate_singletons: false,
      strand_specific: false,
      umi: UmiConfig::default(),
      optical: OpticalConfig { pixel_distance: -1, histogram_path: None, histogram_max_per_cluster: None },
      metrics_path: "metrics.txt".into(),
    }
  }

  fn paired_record(name: &str, pos: i64, mate_pos: i64, is_read1: bool, reverse: bool, mate_reverse: bool, quals: u8) -> AlignmentRecord {
    let mut bits = Flags::PAIRED;
    bits |= if is_read1 { Flags::READ1 } else { Flags::READ2 };
    if reverse {
      bits |= Flags::REVERSE;
    }
    if mate_reverse {
      bits |= Flags::MATE_REVERSE;
    }
    AlignmentRecord {
      name: name.to_string(),
      ref_id: 0,
      pos,
      mapq: 60,
      flags: Flags(bits),
      cigar: Cigar(vec![(CigarOp::Match, 50)]),
      sequence: vec![b'A'; 50],
      qualities: vec![quals; 50],
      mate_ref_id: 0,
      mate_pos,
      template_len: (mate_pos - pos).abs(),
      aux: Vec::new(),
      file_index: None,
    }
  }

  #[test]
  fn marks_the_lower_quality_pair_as_a_duplicate_of_the_higher() {
    let config = base_config();
    let records = vec![
      paired_record("hi-r1", 100, 200, true, false, true, 30),
      paired_record("hi-r2", 200, 100, false, true, false, 30),
      paired_record("lo-r1", 100, 200, true, false, true, 10),
      paired_record("lo-r2", 200, 100, false, true, false, 10),
    ];
    let (summary, sink) = run(&config, header(), records, None, None, VecSink::default()).unwrap();
    assert_eq!(summary.records_in, 4);
    assert_eq!(summary.records_out, 4);

    let by_name: HashMap<&str, &AlignmentRecord> = sink.records.iter().map(|r| (r.name.as_str(), r)).collect();
    assert!(!by_name["hi-r1"].flags.is_duplicate());
    assert!(!by_name["hi-r2"].flags.is_duplicate());
    assert!(by_name["lo-r1"].flags.is_duplicate());
    assert!(by_name["lo-r2"].flags.is_duplicate());

    let metrics = &summary.metrics;
    let lib = &metrics.by_library[crate::header::UNKNOWN_LIBRARY];
    assert_eq!(lib.read_pairs_examined, 4);
    assert_eq!(lib.read_pair_dups, 2);
  }

  #[test]
  fn remove_duplicates_drops_flagged_records_from_output() {
    let mut config = base_config();
    config.remove_duplicates = true;
    let records = vec![
      paired_record("hi-r1", 100, 200, true, false, true, 30),
      paired_record("hi-r2", 200, 100, false, true, false, 30),
      paired_record("lo-r1", 100, 200, true, false, true, 10),
      paired_record("lo-r2", 200, 100, false, true, false, 10),
    ];
    let (summary, sink) = run(&config, header(), records, None, None, VecSink::default()).unwrap();
    assert_eq!(summary.records_in, 4);
    assert_eq!(summary.records_out, 2);
    assert_eq!(sink.records.len(), 2);
  }

  #[test]
  fn distant_mate_pair_across_shards_is_resolved() {
    let mut config = base_config();
    config.shard_strategy = ShardStrategy::ByPosition { shard_size: 300 };
    config.padding = 5;
    let records = vec![
      paired_record("r1", 10, 290, true, false, true, 30),
      paired_record("r1", 290, 10, false, true, false, 30),
    ];
    let (summary, sink) = run(&config, header(), records, None, None, VecSink::default()).unwrap();
    assert_eq!(summary.records_out, 2);
    assert!(sink.records.iter().all(|r| !r.flags.is_duplicate()));
  }
}
