//! Per-shard pass-2 processing (spec component: shard processor).
//!
//! Duplicate-set membership and tagging decisions are computed once, with
//! full visibility across the whole run (see `engine::build_tag_decisions`)
//! rather than re-assembled independently inside every shard: since all
//! pairs/singletons sharing a `DuplicateKey` share the same canonical Left
//! five-prime coordinate, and emission ownership is assigned by raw
//! position rather than five-prime (to preserve input order exactly), a
//! purely per-shard re-assembly would need to ship primary-selection
//! results back across shard boundaries anyway. This module still performs
//! every per-record invariant check the distributed design relies on — the
//! 5'-clip-distance bound and the "a distant mate must exist" check — by
//! consulting the same `DistantMateStore` a fully distributed implementation
//! would use, so a malformed or out-of-order input is still caught exactly
//! where the design calls for it.

use std::collections::HashMap;

use crate::config::Config;
use crate::distant_mate::{resolve_mate, DistantMateStore};
use crate::error::{DupmarkError, Result};
use crate::header::Header;
use crate::metrics::MetricsCollector;
use crate::pool::RecordPool;
use crate::record::{AlignmentRecord, AuxField, AuxValue, FileIndex};
use crate::shard::Shard;

/// The tagging outcome computed for one record by the global matching pass
/// (spec §4.3/§4.4): whether it is a duplicate, and its DI/DS/DL/DT/DU
/// values, if any apply to it.
#[derive(Debug, Clone)]
pub struct TagDecision {
  pub is_duplicate: bool,
  pub is_pair_member: bool,
  pub di: Option<FileIndex>,
  pub ds: Option<u32>,
  pub dl: Option<u32>,
  pub dt: Option<&'static str>,
  pub du: Option<String>,
}

const DI_TAG: [u8; 2] = *b"DI";
const DS_TAG: [u8; 2] = *b"DS";
const DL_TAG: [u8; 2] = *b"DL";
const DT_TAG: [u8; 2] = *b"DT";
const DU_TAG: [u8; 2] = *b"DU";
const RG_TAG: [u8; 2] = *b"RG";

/// The read-group ID carried on a record's `RG` aux field, if any.
pub fn read_group_of(rec: &AlignmentRecord) -> Option<&str> {
  rec.aux.iter().find(|f| f.tag == RG_TAG).and_then(|f| match &f.value {
    AuxValue::String(s) => Some(s.as_str()),
    _ => None,
  })
}

/// Strip the duplicate bit and every DI/DL/DS/DT/DU aux field, in
/// preparation for a fresh tagging decision (spec §4.3 "clear existing").
pub fn clear_tags(rec: &mut AlignmentRecord) {
  rec.flags.set_duplicate(false);
  rec
    .aux
    .retain(|f| !matches!(f.tag, DI_TAG | DS_TAG | DL_TAG | DT_TAG | DU_TAG));
}

fn set_aux(rec: &mut AlignmentRecord, tag: [u8; 2], value: AuxValue) {
  rec.aux.retain(|f| f.tag != tag);
  rec.aux.push(AuxField { tag, value });
}

/// Apply one record's tagging decision: the duplicate bit unconditionally,
/// the DI/DS/DL/DT/DU aux fields only when `tag_duplicates` is configured
/// (spec §4.3). When `emit_unmodified_fields` is turned off, only the
/// duplicate bit and DI are written; DS/DL/DT/DU are omitted (spec §6).
pub fn apply_decision(rec: &mut AlignmentRecord, decision: &TagDecision, config: &Config) {
  rec.flags.set_duplicate(decision.is_duplicate);
  if !config.tag_duplicates {
    return;
  }
  if let Some(di) = decision.di {
    let value = if config.integer_di {
      AuxValue::Int(di as i64)
    } else {
      AuxValue::String(di.to_string())
    };
    set_aux(rec, DI_TAG, value);
  }
  if !config.emit_unmodified_fields {
    return;
  }
  if let Some(ds) = decision.ds {
    set_aux(rec, DS_TAG, AuxValue::Int(ds as i64));
  }
  if let Some(dl) = decision.dl {
    set_aux(rec, DL_TAG, AuxValue::Int(dl as i64));
  }
  if let Some(dt) = decision.dt {
    set_aux(rec, DT_TAG, AuxValue::String(dt.to_string()));
  }
  if let Some(du) = &decision.du {
    set_aux(rec, DU_TAG, AuxValue::String(du.clone()));
  }
}

fn record_metrics_observation(metrics: &mut MetricsCollector, header: &Header, rec: &AlignmentRecord) {
  let lib = header.library_for_read_group(read_group_of(rec)).to_string();
  let m = metrics.library_mut(&lib);
  if rec.flags.is_secondary() || rec.flags.is_supplementary() {
    m.secondary_supplementary += 1;
  } else if rec.flags.is_unmapped() {
    m.unmapped_reads += 1;
  } else if !rec.flags.is_paired() || rec.flags.is_mate_unmapped() {
    m.unpaired_reads += 1;
  } else {
    m.read_pairs_examined += 1;
  }
}

fn record_duplicate_outcome(metrics: &mut MetricsCollector, header: &Header, rec: &AlignmentRecord, decision: &TagDecision) {
  if !decision.is_duplicate {
    return;
  }
  let lib = header.library_for_read_group(read_group_of(rec)).to_string();
  let m = metrics.library_mut(&lib);
  if decision.is_pair_member {
    m.read_pair_dups += 1;
    if decision.dt == Some("SQ") {
      m.read_pair_optical_dups += 1;
    }
  } else {
    m.unpaired_dups += 1;
  }
}

/// Process one shard's core (non-padded, emission-owned) records: validate
/// the 5'-clip-distance and distant-mate invariants, accumulate metrics,
/// apply tagging decisions, and optionally drop duplicates (spec §4.3).
///
/// Each record is drawn from `record_pool` for the duration of its
/// processing and returned once it either reaches `out` or is dropped by
/// `remove_duplicates` (spec §3/§4.8's pool lifecycle): since many shards
/// are in flight across the worker pool at once, boxes a finished shard
/// returns are picked back up by `record_pool.get()` calls other shards
/// make while this one is still running, capping allocator traffic instead
/// of allocating fresh storage for every record.
pub fn process_shard(
  shard: &Shard,
  header: &Header,
  ref_len: u64,
  core_records: Vec<AlignmentRecord>,
  decisions: &HashMap<FileIndex, TagDecision>,
  distant_mate_store: &DistantMateStore,
  mate_shard_physical: usize,
  config: &Config,
  record_pool: &RecordPool,
) -> Result<(Vec<AlignmentRecord>, MetricsCollector)> {
  let view = distant_mate_store.open_shard(mate_shard_physical)?;
  let mut metrics = MetricsCollector::default();
  let mut out = Vec::with_capacity(core_records.len());

  for record in core_records {
    let mut rec = record_pool.get();
    *rec = record;

    if config.clear_existing {
      clear_tags(&mut rec);
    }
    record_metrics_observation(&mut metrics, header, &rec);

    if !rec.flags.is_unmapped() {
      let five_prime = rec.five_prime_pos();
      let clip = (rec.pos - five_prime).unsigned_abs();
      if clip > shard.padding as u64 {
        return Err(DupmarkError::input_integrity(format!(
          "record {:?}: 5' clip distance {} exceeds configured padding {}",
          rec.name, clip, shard.padding
        )));
      }
    }

    if rec.is_paired_with_mapped_mate() && !shard.contains_five_prime(rec.mate_ref_id, rec.mate_pos, ref_len) {
      let mates = view.mates(&rec.name);
      if resolve_mate(&mates, rec.flags.is_read1()).is_none() {
        return Err(DupmarkError::input_integrity(format!(
          "record {:?}: mate lies outside the shard's padded region and no distant-mate entry was found",
          rec.name
        )));
      }
    }

    if let Some(file_index) = rec.file_index {
      if let Some(decision) = decisions.get(&file_index) {
        record_duplicate_outcome(&mut metrics, header, &rec, decision);
        apply_decision(&mut rec, decision, config);
        if config.remove_duplicates && decision.is_duplicate {
          record_pool.put(rec);
          continue;
        }
      }
    }

    out.push(std::mem::take(&mut *rec));
    record_pool.put(rec);
  }

  Ok((out, metrics))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::header::Reference;
  use crate::record::{Cigar, CigarOp, Flags};

  fn header() -> Header {
    Header::new(vec![Reference { name: "chr1".to_string(), length: 1000 }], Default::default())
  }

  fn shard0() -> Shard {
    Shard {
      start_ref: 0,
      start_pos: 0,
      start_seq: 0,
      end_ref: 0,
      end_pos: 500,
      end_seq: 0,
      padding: 20,
      shard_index: 0,
    }
  }

  fn record(name: &str, pos: i64, file_index: u64) -> AlignmentRecord {
    AlignmentRecord {
      name: name.to_string(),
      ref_id: 0,
      pos,
      mapq: 60,
      flags: Flags(Flags::PAIRED | Flags::READ1 | Flags::MATE_UNMAPPED),
      cigar: Cigar(vec![(CigarOp::Match, 50)]),
      sequence: vec![b'A'; 50],
      qualities: vec![30; 50],
      mate_ref_id: -1,
      mate_pos: -1,
      template_len: 0,
      aux: Vec::new(),
      file_index: Some(file_index),
    }
  }

  #[test]
  fn clear_tags_strips_duplicate_bit_and_di_ds_dl_dt_du() {
    let mut rec = record("r", 0, 0);
    rec.flags.set_duplicate(true);
    rec.aux.push(AuxField { tag: DI_TAG, value: AuxValue::Int(1) });
    rec.aux.push(AuxField { tag: DT_TAG, value: AuxValue::String("LB".to_string()) });
    clear_tags(&mut rec);
    assert!(!rec.flags.is_duplicate());
    assert!(rec.aux.is_empty());
  }

  #[test]
  fn process_shard_marks_duplicate_from_precomputed_decision() {
    let h = header();
    let s = shard0();
    let store = DistantMateStore::memory();
    let mut decisions = HashMap::new();
    decisions.insert(
      1,
      TagDecision {
        is_duplicate: true,
        is_pair_member: false,
        di: None,
        ds: None,
        dl: None,
        dt: Some("LB"),
        du: None,
      },
    );
    let config = crate::config::Config {
      input_path: "in.bam".into(),
      index_path: None,
      output_path: "out.bam".into(),
      output_format: crate::config::OutputFormat::Bam,
      parallelism: 1,
      queue_len: 1,
      shard_strategy: crate::config::ShardStrategy::ByPosition { shard_size: 500 },
      padding: 20,
      distant_mate_backing: crate::config::DistantMateBacking::Memory,
      scratch_dir: "/tmp".into(),
      clear_existing: false,
      remove_duplicates: false,
      tag_duplicates: true,
      integer_di: false,
      emit_unmodified_fields: true,
      separate_singletons: false,
      strand_specific: false,
      umi: Default::default(),
      optical: Default::default(),
      metrics_path: "metrics.txt".into(),
    };
    let records = vec![record("r", 0, 1)];
    let record_pool = RecordPool::new(1, 16);
    let (out, metrics) = process_shard(&s, &h, 1000, records, &decisions, &store, 0, &config, &record_pool).unwrap();
    assert!(out[0].flags.is_duplicate());
    assert_eq!(out[0].aux.iter().find(|f| f.tag == DT_TAG).unwrap().value, AuxValue::String("LB".to_string()));
    assert_eq!(metrics.by_library[crate::header::UNKNOWN_LIBRARY].unpaired_dups, 1);
  }

  fn base_config() -> crate::config::Config {
    crate::config::Config {
      input_path: "in.bam".into(),
      index_path: None,
      output_path: "out.bam".into(),
      output_format: crate::config::OutputFormat::Bam,
      parallelism: 1,
      queue_len: 1,
      shard_strategy: crate::config::ShardStrategy::ByPosition { shard_size: 500 },
      padding: 20,
      distant_mate_backing: crate::config::DistantMateBacking::Memory,
      scratch_dir: "/tmp".into(),
      clear_existing: false,
      remove_duplicates: false,
      tag_duplicates: true,
      integer_di: false,
      emit_unmodified_fields: true,
      separate_singletons: false,
      strand_specific: false,
      umi: Default::default(),
      optical: Default::default(),
      metrics_path: "metrics.txt".into(),
    }
  }

  #[test]
  fn apply_decision_writes_every_tag_when_emit_unmodified_fields_is_set() {
    let mut rec = record("r", 0, 1);
    let decision = TagDecision {
      is_duplicate: true,
      is_pair_member: true,
      di: Some(7),
      ds: Some(2),
      dl: Some(1),
      dt: Some("LB"),
      du: Some("AAC-CCG".to_string()),
    };
    apply_decision(&mut rec, &decision, &base_config());
    assert!(rec.flags.is_duplicate());
    assert!(rec.aux.iter().any(|f| f.tag == DI_TAG));
    assert!(rec.aux.iter().any(|f| f.tag == DS_TAG));
    assert!(rec.aux.iter().any(|f| f.tag == DL_TAG));
    assert!(rec.aux.iter().any(|f| f.tag == DT_TAG));
    assert!(rec.aux.iter().any(|f| f.tag == DU_TAG));
  }

  #[test]
  fn apply_decision_omits_ds_dl_dt_du_when_emit_unmodified_fields_is_clear() {
    let mut rec = record("r", 0, 1);
    let mut config = base_config();
    config.emit_unmodified_fields = false;
    let decision = TagDecision {
      is_duplicate: true,
      is_pair_member: true,
      di: Some(7),
      ds: Some(2),
      dl: Some(1),
      dt: Some("LB"),
      du: Some("AAC-CCG".to_string()),
    };
    apply_decision(&mut rec, &decision, &config);
    assert!(rec.flags.is_duplicate());
    assert!(rec.aux.iter().any(|f| f.tag == DI_TAG));
    assert!(!rec.aux.iter().any(|f| f.tag == DS_TAG));
    assert!(!rec.aux.iter().any(|f| f.tag == DL_TAG));
    assert!(!rec.aux.iter().any(|f| f.tag == DT_TAG));
    assert!(!rec.aux.iter().any(|f| f.tag == DU_TAG));
  }
}
