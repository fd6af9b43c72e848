//! Per-library duplicate metrics, optical-distance histogram, and
//! Lander-Waterman library-size estimation (spec §4.6/§6).

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};

use crate::error::{DupmarkError, Result};

/// Per-library counters (spec §3). All counts are per-read; pair counters
/// are halved only at display time, matching the metrics file format.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
  pub unpaired_reads: u64,
  pub read_pairs_examined: u64,
  pub secondary_supplementary: u64,
  pub unmapped_reads: u64,
  pub unpaired_dups: u64,
  pub read_pair_dups: u64,
  pub read_pair_optical_dups: u64,
}

impl Metrics {
  pub fn merge(&mut self, other: &Metrics) {
    self.unpaired_reads += other.unpaired_reads;
    self.read_pairs_examined += other.read_pairs_examined;
    self.secondary_supplementary += other.secondary_supplementary;
    self.unmapped_reads += other.unmapped_reads;
    self.unpaired_dups += other.unpaired_dups;
    self.read_pair_dups += other.read_pair_dups;
    self.read_pair_optical_dups += other.read_pair_optical_dups;
  }

  fn percent_duplication(&self) -> f64 {
    let denom = (self.unpaired_reads + self.read_pairs_examined) as f64;
    if denom == 0.0 {
      return 0.0;
    }
    (self.unpaired_dups + self.read_pair_dups) as f64 / denom
  }

  fn library_size(&self) -> Option<f64> {
    let n = self.read_pairs_examined as f64 / 2.0;
    let c = n - (self.read_pair_dups as f64 / 2.0 - self.read_pair_optical_dups as f64 / 2.0);
    estimate_library_size(n, c)
  }
}

/// `f(x) = C/x - 1 + exp(-N/x)`, the Lander-Waterman root equation derived
/// from `C/X = 1 - exp(-N/X)` (spec §4.6).
fn lander_waterman_f(x: f64, c: f64, n: f64) -> f64 {
  c / x - 1.0 + (-n / x).exp()
}

/// Bisect for the library size `X` satisfying the Lander-Waterman identity.
/// Searches `[1, 100]·C` for a sign change, doubling the upper bound until
/// one is found or the search range saturates (spec §4.6), then refines
/// with 40 bisection steps.
pub fn estimate_library_size(n: f64, c: f64) -> Option<f64> {
  if n <= 0.0 || c <= 0.0 || c >= n {
    return None;
  }
  let mut hi_mult = 100.0f64;
  while lander_waterman_f(hi_mult * c, c, n) > 0.0 {
    hi_mult *= 10.0;
    if hi_mult > 1e8 {
      return None;
    }
  }
  let mut lo = c;
  let mut hi = hi_mult * c;
  for _ in 0..40 {
    let mid = 0.5 * (lo + hi);
    if lander_waterman_f(mid, c, n) < 0.0 {
      hi = mid;
    } else {
      lo = mid;
    }
  }
  Some(0.5 * (lo + hi))
}

/// The four bag-size classes the optical histogram bins into (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BagSizeClass {
  UpTo2,
  ThreeToFour,
  FiveToSeven,
  EightOrMore,
}

impl BagSizeClass {
  pub fn of(bag_size: usize) -> BagSizeClass {
    match bag_size {
      0..=2 => BagSizeClass::UpTo2,
      3..=4 => BagSizeClass::ThreeToFour,
      5..=7 => BagSizeClass::FiveToSeven,
      _ => BagSizeClass::EightOrMore,
    }
  }

  fn label(self) -> &'static str {
    match self {
      BagSizeClass::UpTo2 => "bagsize-2",
      BagSizeClass::ThreeToFour => "bagsize3-4",
      BagSizeClass::FiveToSeven => "bagsize5-7",
      BagSizeClass::EightOrMore => "bagsize8-",
    }
  }
}

/// Sparse per-bag-size-class histogram over (rounded) Euclidean optical
/// distance.
#[derive(Debug, Clone, Default)]
pub struct OpticalHistogram {
  bags: HashMap<BagSizeClass, BTreeMap<i64, u64>>,
}

impl OpticalHistogram {
  pub fn record(&mut self, bag_size: usize, distance: f64) {
    let class = BagSizeClass::of(bag_size);
    *self
      .bags
      .entry(class)
      .or_default()
      .entry(distance.round() as i64)
      .or_insert(0) += 1;
  }

  pub fn merge(&mut self, other: &OpticalHistogram) {
    for (class, bins) in &other.bags {
      let dst = self.bags.entry(*class).or_default();
      for (dist, count) in bins {
        *dst.entry(*dist).or_insert(0) += count;
      }
    }
  }
}

/// Per-library metrics plus the shared optical-distance histogram,
/// accumulated per worker and merged at the end of a run (spec §4.6).
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
  pub by_library: HashMap<String, Metrics>,
  pub histogram: OpticalHistogram,
}

impl MetricsCollector {
  pub fn library_mut(&mut self, library: &str) -> &mut Metrics {
    self.by_library.entry(library.to_string()).or_default()
  }

  pub fn merge(&mut self, other: &MetricsCollector) {
    for (library, metrics) in &other.by_library {
      self.library_mut(library).merge(metrics);
    }
    self.histogram.merge(&other.histogram);
  }
}

/// Write the tab-separated metrics file (spec §6). `max_five_prime_distance`
/// is reported verbatim in the header comment.
pub fn write_metrics_file<W: Write>(
  mut writer: W,
  collector: &MetricsCollector,
  max_five_prime_distance: u64,
) -> Result<()> {
  let emit = |writer: &mut W| -> io::Result<()> {
    writeln!(writer, "# dupmark")?;
    writeln!(writer, "# maximum 5' alignment distance: {max_five_prime_distance}")?;
    writeln!(
      writer,
      "LIBRARY\tUNPAIRED_READS_EXAMINED\tREAD_PAIRS_EXAMINED\tSECONDARY_OR_SUPPLEMENTARY_RDS\tUNMAPPED_READS\tUNPAIRED_READ_DUPLICATES\tREAD_PAIR_DUPLICATES\tREAD_PAIR_OPTICAL_DUPLICATES\tPERCENT_DUPLICATION\tESTIMATED_LIBRARY_SIZE"
    )?;
    let mut libraries: Vec<&String> = collector.by_library.keys().collect();
    libraries.sort();
    for library in libraries {
      let m = &collector.by_library[library];
      let size = m.library_size().map(|x| x.round() as u64).unwrap_or(0);
      writeln!(
        writer,
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{:.6}\t{}",
        library,
        m.unpaired_reads,
        m.read_pairs_examined / 2,
        m.secondary_supplementary,
        m.unmapped_reads,
        m.unpaired_dups,
        m.read_pair_dups / 2,
        m.read_pair_optical_dups / 2,
        m.percent_duplication(),
        size,
      )?;
    }
    Ok(())
  };
  emit(&mut writer).map_err(DupmarkError::Io)
}

/// Write the optical-histogram file (spec §6).
pub fn write_optical_histogram_file<W: Write>(mut writer: W, histogram: &OpticalHistogram) -> Result<()> {
  let emit = |writer: &mut W| -> io::Result<()> {
    writeln!(writer, "#bag_size_range\toptical_dist\tcount")?;
    for class in [
      BagSizeClass::UpTo2,
      BagSizeClass::ThreeToFour,
      BagSizeClass::FiveToSeven,
      BagSizeClass::EightOrMore,
    ] {
      if let Some(bins) = histogram.bags.get(&class) {
        for (distance, count) in bins {
          writeln!(writer, "{}\t{}\t{}", class.label(), distance, count)?;
        }
      }
    }
    Ok(())
  };
  emit(&mut writer).map_err(DupmarkError::Io)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn percent_duplication_basic() {
    let m = Metrics {
      unpaired_reads: 0,
      read_pairs_examined: 100,
      secondary_supplementary: 0,
      unmapped_reads: 0,
      unpaired_dups: 0,
      read_pair_dups: 20,
      read_pair_optical_dups: 0,
    };
    assert!((m.percent_duplication() - 0.2).abs() < 1e-9);
  }

  #[test]
  fn library_size_none_when_no_duplication() {
    let m = Metrics {
      read_pairs_examined: 100,
      read_pair_dups: 0,
      ..Default::default()
    };
    assert_eq!(m.library_size(), None);
  }

  #[test]
  fn library_size_estimates_when_duplicated() {
    let m = Metrics {
      read_pairs_examined: 2_000_000,
      read_pair_dups: 400_000,
      ..Default::default()
    };
    let size = m.library_size().expect("estimate should converge");
    assert!(size > 0.0);
  }

  #[test]
  fn histogram_bins_by_bag_size_class() {
    let mut h = OpticalHistogram::default();
    h.record(2, 3.4);
    h.record(6, 3.4);
    assert_eq!(h.bags[&BagSizeClass::UpTo2][&3], 1);
    assert_eq!(h.bags[&BagSizeClass::FiveToSeven][&3], 1);
  }

  #[test]
  fn metrics_file_has_expected_header() {
    let mut collector = MetricsCollector::default();
    collector.library_mut("lib1").read_pairs_examined = 10;
    let mut buf = Vec::new();
    write_metrics_file(&mut buf, &collector, 500).unwrap();
    let text = String::from_utf8(buf).unwrap();
    assert!(text.contains("LIBRARY\tUNPAIRED_READS_EXAMINED"));
    assert!(text.contains("maximum 5' alignment distance: 500"));
  }
}
