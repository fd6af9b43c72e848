//! `Pair`, `DuplicateKey`, canonical Left/Right ordering, and UMI parsing
//! (spec §3/§4.4).

use crate::error::{DupmarkError, Result};
use crate::record::{AlignmentRecord, Orientation};

/// Returns `true` if `a` sorts before `b` under the canonical Left/Right
/// ordering (spec §3): smaller unclipped 5' position first; ties broken by
/// orientation precedence (forward before reverse), then read1 before
/// read2, then smaller `FileIndex`. This single function is the one used by
/// both the in-shard pairing path and the distant-mate path, resolving
/// DESIGN.md open question #3.
pub fn is_left(a: &AlignmentRecord, b: &AlignmentRecord) -> bool {
  let (a5, b5) = (a.five_prime_pos(), b.five_prime_pos());
  if a5 != b5 {
    return a5 < b5;
  }
  let (ap, bp) = (
    a.orientation_single().precedence(),
    b.orientation_single().precedence(),
  );
  if ap != bp {
    return ap < bp;
  }
  if a.flags.is_read1() != b.flags.is_read1() {
    return a.flags.is_read1();
  }
  match (a.file_index, b.file_index) {
    (Some(ai), Some(bi)) => ai < bi,
    // Before file indices are assigned, fall back to a stable placeholder;
    // real pairing always happens after file-index assignment.
    _ => false,
  }
}

/// A resolved mate pair, holding owned copies of both reads so that a
/// distant mate (returned from the shared distant-mate table) can be
/// cloned in without aliasing the table's own storage (spec §4.3).
#[derive(Debug, Clone)]
pub struct Pair {
  pub left: AlignmentRecord,
  pub right: AlignmentRecord,
}

impl Pair {
  /// Construct a pair from two mates, placing them into canonical
  /// Left/Right order.
  pub fn new(a: AlignmentRecord, b: AlignmentRecord) -> Pair {
    if is_left(&a, &b) {
      Pair { left: a, right: b }
    } else {
      Pair { left: b, right: a }
    }
  }

  pub fn orientation(&self) -> Orientation {
    Orientation::from_pair_strands(self.left.flags.is_reverse(), self.right.flags.is_reverse())
  }
}

/// The canonical grouping key for duplicate detection (spec §3). Singleton
/// (mate-unmapped) keys store the same coordinate in both "left" and
/// "right" slots so that `left_side` below can be compared directly against
/// a pair's left side during singleton absorption (spec §4.4).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DuplicateKey {
  pub left_ref_id: i32,
  pub left_five_prime: i64,
  pub right_ref_id: i32,
  pub right_five_prime: i64,
  pub orientation: Orientation,
  pub strand: Option<bool>,
}

impl DuplicateKey {
  pub fn for_pair(pair: &Pair, strand_specific: bool) -> DuplicateKey {
    DuplicateKey {
      left_ref_id: pair.left.ref_id,
      left_five_prime: pair.left.five_prime_pos(),
      right_ref_id: pair.right.ref_id,
      right_five_prime: pair.right.five_prime_pos(),
      orientation: pair.orientation(),
      strand: strand_specific.then(|| pair.left.flags.is_reverse()),
    }
  }

  pub fn for_singleton(rec: &AlignmentRecord, strand_specific: bool) -> DuplicateKey {
    let five_prime = rec.five_prime_pos();
    DuplicateKey {
      left_ref_id: rec.ref_id,
      left_five_prime: five_prime,
      right_ref_id: rec.ref_id,
      right_five_prime: five_prime,
      orientation: rec.orientation_single(),
      strand: strand_specific.then(|| rec.flags.is_reverse()),
    }
  }

  /// `(refId, 5', strand)` of the key's left side, used to match a
  /// mate-unmapped singleton bucket against a pair bucket sharing the same
  /// left-side coordinate (spec §4.4's singleton-absorption rule).
  pub fn left_side(&self) -> (i32, i64, Option<bool>) {
    (self.left_ref_id, self.left_five_prime, self.strand)
  }
}

/// A parsed `"A+B"` UMI pair from the last ':'-delimited field of a read
/// name (spec §4.4).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UmiPair {
  pub left: String,
  pub right: String,
}

impl UmiPair {
  pub fn has_n(&self) -> bool {
    self.left.contains('N') || self.right.contains('N')
  }

  /// Canonical (left, right) ordering for a resolved pair: matches the
  /// read-level Left/Right assignment, with a lexicographic tie-break when
  /// position/orientation alone leave the assignment ambiguous (spec
  /// §4.4). `left_is_read1` indicates whether the UMI observed on the
  /// template's Left read was itself read1 (used only to decide the
  /// tie-break order when the two observed UMI strings are otherwise
  /// interchangeable).
  pub fn canonical(raw_left: String, raw_right: String) -> UmiPair {
    if raw_left <= raw_right {
      UmiPair {
        left: raw_left,
        right: raw_right,
      }
    } else {
      UmiPair {
        left: raw_right,
        right: raw_left,
      }
    }
  }
}

/// Extract the `"A+B"` UMI pair from a read name's last ':'-delimited
/// field.
pub fn parse_umi(name: &str) -> Result<(String, String)> {
  let field = name.rsplit(':').next().unwrap_or(name);
  let mut parts = field.splitn(2, '+');
  let a = parts.next().filter(|s| !s.is_empty());
  let b = parts.next().filter(|s| !s.is_empty());
  match (a, b) {
    (Some(a), Some(b)) => Ok((a.to_string(), b.to_string())),
    _ => Err(DupmarkError::input_integrity(format!(
      "read name {name:?} does not carry an 'A+B' UMI pair in its last field"
    ))),
  }
}

/// Hamming edit distance between two equal-length strings; UMIs observed in
/// a run are always the same configured length, so a simple positional
/// mismatch count is the edit distance that matters here.
pub fn hamming_distance(a: &str, b: &str) -> u32 {
  a.bytes().zip(b.bytes()).filter(|(x, y)| x != y).count() as u32
    + (a.len() as i64 - b.len() as i64).unsigned_abs() as u32
}

/// Maps an observed UMI to the unique nearest entry in a known set, by edit
/// distance, optionally bounded by `max_distance` (used for scavenging,
/// spec §4.4).
pub struct UmiCorrector {
  known: Vec<String>,
}

impl UmiCorrector {
  pub fn new(known: Vec<String>) -> UmiCorrector {
    UmiCorrector { known }
  }

  pub fn is_empty(&self) -> bool {
    self.known.is_empty()
  }

  /// Returns `Some(known_umi)` only if exactly one known UMI attains the
  /// minimum distance (and, when `max_distance` is set, that minimum is
  /// within it).
  pub fn correct(&self, observed: &str, max_distance: Option<u32>) -> Option<&str> {
    let mut best: Option<(u32, &str)> = None;
    let mut tie = false;
    for candidate in &self.known {
      let d = hamming_distance(observed, candidate);
      if let Some(max) = max_distance {
        if d > max {
          continue;
        }
      }
      match best {
        None => best = Some((d, candidate)),
        Some((bd, _)) if d < bd => {
          best = Some((d, candidate));
          tie = false;
        }
        Some((bd, _)) if d == bd => tie = true,
        _ => {}
      }
    }
    if tie {
      None
    } else {
      best.map(|(_, s)| s)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_umi_pair() {
    assert_eq!(
      parse_umi("A:B:1:2:3:AAC+CCG").unwrap(),
      ("AAC".to_string(), "CCG".to_string())
    );
  }

  #[test]
  fn rejects_missing_plus() {
    assert!(parse_umi("read-without-umi").is_err());
  }

  #[test]
  fn umi_pair_has_n() {
    let pair = UmiPair::canonical("AAN".to_string(), "CCG".to_string());
    assert!(pair.has_n());
  }

  #[test]
  fn corrector_picks_unique_nearest() {
    let c = UmiCorrector::new(vec!["AAA".to_string(), "TTT".to_string()]);
    assert_eq!(c.correct("AAC", None), Some("AAA"));
  }

  #[test]
  fn corrector_refuses_ties() {
    let c = UmiCorrector::new(vec!["AAA".to_string(), "AAT".to_string()]);
    // "AAC" is hamming-distance 1 from both -> ambiguous.
    assert_eq!(c.correct("AAC", None), None);
  }

  #[test]
  fn corrector_respects_max_distance() {
    let c = UmiCorrector::new(vec!["TTT".to_string()]);
    assert_eq!(c.correct("AAA", Some(1)), None);
  }
}
