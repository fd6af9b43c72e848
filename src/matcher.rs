//! The duplicate matcher (spec §4.4): buckets pairs and mate-unmapped
//! singletons by `DuplicateKey`, refines by UMI when configured, and picks
//! each bucket's primary.

use std::collections::HashMap;

use crate::error::Result;
use crate::pair::{hamming_distance, parse_umi, DuplicateKey, Pair, UmiCorrector, UmiPair};
use crate::record::{AlignmentRecord, FileIndex, Orientation};

/// One inserted entry: either a resolved pair or a mate-unmapped singleton
/// (spec §3).
#[derive(Debug, Clone)]
pub enum SetMember {
  Pair(Pair),
  Singleton(AlignmentRecord),
}

impl SetMember {
  fn left_file_index(&self) -> FileIndex {
    match self {
      SetMember::Pair(p) => p.left.file_index.unwrap_or(0),
      SetMember::Singleton(r) => r.file_index.unwrap_or(0),
    }
  }

  fn is_qc_fail(&self) -> bool {
    match self {
      SetMember::Pair(p) => p.left.flags.is_qc_fail() || p.right.flags.is_qc_fail(),
      SetMember::Singleton(r) => r.flags.is_qc_fail(),
    }
  }

  /// The raw `(leftUMI, rightUMI)` pair read off this member's name(s),
  /// before any correction (spec §4.4). Both sides come from the same
  /// read's name field for a singleton.
  fn raw_umi(&self) -> Result<UmiPair> {
    let name = match self {
      SetMember::Pair(p) => &p.left.name,
      SetMember::Singleton(r) => &r.name,
    };
    let (a, b) = parse_umi(name)?;
    Ok(UmiPair::canonical(a, b))
  }

  /// Sum of base-quality score used for primary selection (spec §4.4):
  /// qualities `>= 14` summed, clamped at `32767/2`, then `32768/2`
  /// subtracted if qc-fail is set.
  fn quality_score(&self) -> i64 {
    const CLAMP: i64 = 32767 / 2;
    const QC_FAIL_PENALTY: i64 = 32768 / 2;
    let raw = match self {
      SetMember::Pair(p) => p.left.quality_sum() + p.right.quality_sum(),
      SetMember::Singleton(r) => r.quality_sum(),
    };
    let clamped = raw.min(CLAMP);
    if self.is_qc_fail() {
      clamped - QC_FAIL_PENALTY
    } else {
      clamped
    }
  }

  fn is_pair(&self) -> bool {
    matches!(self, SetMember::Pair(_))
  }
}

/// Configuration the matcher needs, a narrowed view of `config::Config`.
pub struct MatcherConfig<'a> {
  pub strand_specific: bool,
  pub separate_singletons: bool,
  pub use_umis: bool,
  pub scavenge_distance: Option<u32>,
  pub known_umis: Option<&'a UmiCorrector>,
}

/// A group of pairs/singletons sharing a `DuplicateKey` (and, in UMI mode,
/// a refined UMI key), with the chosen primary and per-member corrected-UMI
/// string when it changed (spec §4.4).
pub struct DuplicateSet {
  pub key: DuplicateKey,
  pub members: Vec<SetMember>,
  pub primary_idx: usize,
  pub has_pairs: bool,
  /// `Some(corrected UMI string)` per member index whose UMI was changed by
  /// correction or scavenging; only ever populated in UMI mode.
  pub corrected_umi: HashMap<usize, String>,
}

fn pick_primary(members: &[SetMember]) -> usize {
  let mut best = 0usize;
  for i in 1..members.len() {
    let (a, b) = (&members[i], &members[best]);
    let key_a = (a.is_pair(), a.quality_score(), std::cmp::Reverse(a.left_file_index()));
    let key_b = (b.is_pair(), b.quality_score(), std::cmp::Reverse(b.left_file_index()));
    if key_a > key_b {
      best = i;
    }
  }
  best
}

/// Bucket every inserted member by `DuplicateKey`, absorbing matching
/// singletons into pair buckets, refine by UMI if configured, and choose
/// each bucket's primary.
pub fn compute_duplicate_sets(members: Vec<SetMember>, config: &MatcherConfig) -> Result<Vec<DuplicateSet>> {
  let keys: Vec<DuplicateKey> = members
    .iter()
    .map(|m| match m {
      SetMember::Pair(p) => DuplicateKey::for_pair(p, config.strand_specific),
      SetMember::Singleton(r) => DuplicateKey::for_singleton(r, config.strand_specific),
    })
    .collect();

  let mut pair_buckets: HashMap<DuplicateKey, Vec<usize>> = HashMap::new();
  let mut singleton_buckets: HashMap<DuplicateKey, Vec<usize>> = HashMap::new();
  for (i, (m, k)) in members.iter().zip(keys.iter()).enumerate() {
    if m.is_pair() {
      pair_buckets.entry(k.clone()).or_default().push(i);
    } else {
      singleton_buckets.entry(k.clone()).or_default().push(i);
    }
  }

  // Absorb singletons into a matching pair bucket sharing (refId, 5',
  // strand) on the pair's left side, unless separate-singletons is
  // configured. A singleton's orientation (F/R) can match more than one
  // pair-orientation bucket at the same coordinate (F matches both FF and
  // FR); the largest such bucket is chosen, ties broken by orientation
  // precedence, for a deterministic attachment (not itself one of the
  // spec's named open questions, just a concrete tie-break this
  // implementation needs).
  let mut absorbed_into: HashMap<usize, DuplicateKey> = HashMap::new();
  if !config.separate_singletons {
    for (singleton_key, singleton_members) in &singleton_buckets {
      let side = singleton_key.left_side();
      let singleton_is_forward = singleton_key.orientation == Orientation::F;
      let mut candidates: Vec<&DuplicateKey> = pair_buckets
        .keys()
        .filter(|k| {
          k.left_side() == side
            && matches!(
              (singleton_is_forward, k.orientation),
              (true, Orientation::FF) | (true, Orientation::FR) | (false, Orientation::RF) | (false, Orientation::RR)
            )
        })
        .collect();
      candidates.sort_by_key(|k| (std::cmp::Reverse(pair_buckets[*k].len()), k.orientation.precedence()));
      if let Some(target) = candidates.into_iter().next() {
        for &idx in singleton_members {
          absorbed_into.insert(idx, target.clone());
        }
      }
    }
  }

  // Assemble combined bucket membership: pair bucket indices plus any
  // singletons absorbed into it; singletons not absorbed form their own
  // bucket under their own key.
  let mut combined: HashMap<DuplicateKey, Vec<usize>> = pair_buckets.clone();
  let mut standalone_singleton_keys: Vec<DuplicateKey> = Vec::new();
  for (key, indices) in &singleton_buckets {
    let mut unabsorbed = Vec::new();
    for &idx in indices {
      match absorbed_into.get(&idx) {
        Some(target) => combined.get_mut(target).unwrap().push(idx),
        None => unabsorbed.push(idx),
      }
    }
    if !unabsorbed.is_empty() {
      combined.insert(key.clone(), unabsorbed);
      standalone_singleton_keys.push(key.clone());
    }
  }

  let mut sets = Vec::new();
  for (key, indices) in combined {
    sets.extend(build_sets_for_bucket(key, indices, &members, config)?);
  }
  Ok(sets)
}

fn build_sets_for_bucket(
  key: DuplicateKey,
  indices: Vec<usize>,
  members: &[SetMember],
  config: &MatcherConfig,
) -> Result<Vec<DuplicateSet>> {
  if !config.use_umis {
    return Ok(vec![finish_set(key, indices, members, HashMap::new())]);
  }

  // UMI refinement: sub-bucket by (leftUMI, rightUMI) after optional
  // correction. Records whose UMI contains 'N' are never pooled and always
  // form their own singleton set, except that a non-'N' singleton may still
  // attach to such a set (spec §4.4) — realized here by keeping every
  // 'N'-containing entry under a distinct per-entry key while letting
  // clean singletons fall through to the ordinary UMI-keyed grouping.
  let mut by_umi: HashMap<Option<UmiPair>, Vec<usize>> = HashMap::new();
  let mut corrected_umi: HashMap<usize, String> = HashMap::new();
  let mut n_entries: Vec<usize> = Vec::new();

  for &idx in &indices {
    let raw = members[idx].raw_umi()?;
    if raw.has_n() {
      n_entries.push(idx);
      continue;
    }
    let resolved = resolve_umi(&raw, config, &mut corrected_umi, idx);
    by_umi.entry(Some(resolved)).or_default().push(idx);
  }

  let mut sets = Vec::new();
  for (umi, group_indices) in by_umi {
    let sub_key = key_with_umi(&key, umi);
    sets.push(finish_set(sub_key, group_indices, members, corrected_umi.clone()));
  }
  for idx in n_entries {
    sets.push(finish_set(key.clone(), vec![idx], members, HashMap::new()));
  }
  Ok(sets)
}

/// `DuplicateKey` itself carries no UMI field (it is position/orientation
/// only); UMI refinement distinguishes sets purely by grouping, so the key
/// returned to the caller per sub-bucket is the same base key — callers
/// that need to tell sub-buckets apart use the returned `DuplicateSet`s
/// directly rather than the key.
fn key_with_umi(key: &DuplicateKey, _umi: Option<UmiPair>) -> DuplicateKey {
  key.clone()
}

fn resolve_umi(
  raw: &UmiPair,
  config: &MatcherConfig,
  corrected_umi: &mut HashMap<usize, String>,
  idx: usize,
) -> UmiPair {
  let Some(known) = config.known_umis else {
    return raw.clone();
  };
  if known.is_empty() {
    return raw.clone();
  }
  let left_corrected = known.correct(&raw.left, None);
  let right_corrected = known.correct(&raw.right, None);
  if let (Some(l), Some(r)) = (left_corrected, right_corrected) {
    let resolved = UmiPair::canonical(l.to_string(), r.to_string());
    if resolved != *raw {
      corrected_umi.insert(idx, format!("{}+{}", resolved.left, resolved.right));
    }
    return resolved;
  }
  if let Some(d) = config.scavenge_distance {
    if let (Some(l), Some(r)) = (known.correct(&raw.left, Some(d)), known.correct(&raw.right, Some(d))) {
      let scavenged = UmiPair::canonical(l.to_string(), r.to_string());
      if hamming_distance(&raw.left, &scavenged.left) + hamming_distance(&raw.right, &scavenged.right) <= d * 2 {
        corrected_umi.insert(idx, format!("{}+{}", scavenged.left, scavenged.right));
        return scavenged;
      }
    }
  }
  raw.clone()
}

fn finish_set(
  key: DuplicateKey,
  indices: Vec<usize>,
  members: &[SetMember],
  corrected_umi: HashMap<usize, String>,
) -> DuplicateSet {
  let group: Vec<SetMember> = indices.iter().map(|&i| members[i].clone()).collect();
  let primary_idx = pick_primary(&group);
  let has_pairs = group.iter().any(|m| m.is_pair());
  // Re-key corrected_umi against the group-local indices.
  let local_corrected: HashMap<usize, String> = indices
    .iter()
    .enumerate()
    .filter_map(|(local, global)| corrected_umi.get(global).map(|s| (local, s.clone())))
    .collect();
  DuplicateSet {
    key,
    members: group,
    primary_idx,
    has_pairs,
    corrected_umi: local_corrected,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::{Cigar, CigarOp, Flags};

  fn record(name: &str, pos: i64, reverse: bool, file_index: u64, quals: u8) -> AlignmentRecord {
    let mut flags = Flags(Flags::PAIRED | Flags::MATE_UNMAPPED);
    if reverse {
      flags.0 |= Flags::REVERSE;
    }
    flags.0 |= Flags::READ1;
    AlignmentRecord {
      name: name.to_string(),
      ref_id: 0,
      pos,
      mapq: 60,
      flags,
      cigar: Cigar(vec![(CigarOp::Match, 50)]),
      sequence: vec![b'A'; 50],
      qualities: vec![quals; 50],
      mate_ref_id: -1,
      mate_pos: -1,
      template_len: 0,
      aux: Vec::new(),
      file_index: Some(file_index),
    }
  }

  #[test]
  fn singletons_with_same_position_bucket_together() {
    let members = vec![
      SetMember::Singleton(record("r1", 100, false, 0, 30)),
      SetMember::Singleton(record("r2", 100, false, 1, 30)),
    ];
    let config = MatcherConfig {
      strand_specific: false,
      separate_singletons: false,
      use_umis: false,
      scavenge_distance: None,
      known_umis: None,
    };
    let sets = compute_duplicate_sets(members, &config).unwrap();
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].members.len(), 2);
    assert!(!sets[0].has_pairs);
  }

  #[test]
  fn primary_selection_prefers_higher_quality_singleton() {
    let members = vec![
      SetMember::Singleton(record("low", 100, false, 5, 10)),
      SetMember::Singleton(record("high", 100, false, 6, 30)),
    ];
    let config = MatcherConfig {
      strand_specific: false,
      separate_singletons: false,
      use_umis: false,
      scavenge_distance: None,
      known_umis: None,
    };
    let sets = compute_duplicate_sets(members, &config).unwrap();
    let primary = &sets[0].members[sets[0].primary_idx];
    match primary {
      SetMember::Singleton(r) => assert_eq!(r.name, "high"),
      _ => panic!("expected singleton primary"),
    }
  }
}
