//! Validated run configuration (spec §6, §4.11).

use std::path::PathBuf;

use crate::error::{DupmarkError, Result};

/// Output container selector ("container A / container B" in spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
  Bam,
  Sam,
}

/// Which backing store the distant-mate table uses (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistantMateBacking {
  Memory,
  Disk { shard_count: usize },
}

/// Which strategy the shard planner uses (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStrategy {
  ByPosition { shard_size: u64 },
  ByBytes { bytes_per_shard: u64, min_bases: u64 },
}

#[derive(Debug, Clone)]
pub struct UmiConfig {
  pub use_umis: bool,
  pub known_umi_file: Option<PathBuf>,
  pub scavenge_distance: Option<u32>,
}

impl Default for UmiConfig {
  fn default() -> Self {
    UmiConfig {
      use_umis: false,
      known_umi_file: None,
      scavenge_distance: None,
    }
  }
}

#[derive(Debug, Clone)]
pub struct OpticalConfig {
  pub pixel_distance: i64,
  pub histogram_path: Option<PathBuf>,
  pub histogram_max_per_cluster: Option<usize>,
}

impl Default for OpticalConfig {
  fn default() -> Self {
    OpticalConfig {
      pixel_distance: 100,
      histogram_path: None,
      histogram_max_per_cluster: None,
    }
  }
}

/// The full, validated configuration for one engine run.
#[derive(Debug, Clone)]
pub struct Config {
  pub input_path: PathBuf,
  pub index_path: Option<PathBuf>,
  pub output_path: PathBuf,
  pub output_format: OutputFormat,

  pub parallelism: usize,
  pub queue_len: usize,
  pub shard_strategy: ShardStrategy,
  pub padding: u64,
  pub distant_mate_backing: DistantMateBacking,
  pub scratch_dir: PathBuf,

  pub clear_existing: bool,
  pub remove_duplicates: bool,
  pub tag_duplicates: bool,
  pub integer_di: bool,
  pub emit_unmodified_fields: bool,
  pub separate_singletons: bool,
  pub strand_specific: bool,

  pub umi: UmiConfig,
  pub optical: OpticalConfig,

  pub metrics_path: PathBuf,
}

impl Config {
  /// Validate cross-field invariants. Run once, before any shard planning,
  /// so that configuration errors are reported without doing any work
  /// (spec §7).
  pub fn validate(&self) -> Result<()> {
    if let ShardStrategy::ByPosition { shard_size } = self.shard_strategy {
      if self.padding >= shard_size {
        return Err(DupmarkError::config(format!(
          "clip-padding ({}) must be smaller than shard-size ({})",
          self.padding, shard_size
        )));
      }
    }
    if self.parallelism == 0 {
      return Err(DupmarkError::config("parallelism must be >= 1"));
    }
    if self.queue_len == 0 {
      return Err(DupmarkError::config("queue length must be >= 1"));
    }
    if !self.umi.use_umis {
      if self.umi.known_umi_file.is_some() {
        return Err(DupmarkError::config(
          "umi-file given but use-umis is not enabled",
        ));
      }
      if self.umi.scavenge_distance.is_some() {
        return Err(DupmarkError::config(
          "scavenge-umis given but use-umis is not enabled",
        ));
      }
    }
    if let Some(d) = self.umi.scavenge_distance {
      if d < 1 {
        return Err(DupmarkError::config("scavenge-umis distance must be >= 1"));
      }
      if self.umi.known_umi_file.is_none() {
        return Err(DupmarkError::config(
          "scavenge-umis requires a umi-file of known UMIs",
        ));
      }
    }
    if let DistantMateBacking::Disk { shard_count } = self.distant_mate_backing {
      if shard_count == 0 {
        return Err(DupmarkError::config(
          "disk-mate-shard count must be >= 1 when disk-backed",
        ));
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn base_config() -> Config {
    Config {
      input_path: "in.bam".into(),
      index_path: None,
      output_path: "out.bam".into(),
      output_format: OutputFormat::Bam,
      parallelism: 4,
      queue_len: 8,
      shard_strategy: ShardStrategy::ByPosition { shard_size: 1_000_000 },
      padding: 5_000,
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
      optical: OpticalConfig::default(),
      metrics_path: "metrics.txt".into(),
    }
  }

  #[test]
  fn rejects_padding_ge_shard_size() {
    let mut cfg = base_config();
    cfg.shard_strategy = ShardStrategy::ByPosition { shard_size: 100 };
    cfg.padding = 100;
    assert!(cfg.validate().is_err());
  }

  #[test]
  fn rejects_umi_options_without_use_umis() {
    let mut cfg = base_config();
    cfg.umi.known_umi_file = Some("umis.txt".into());
    assert!(cfg.validate().is_err());
  }

  #[test]
  fn accepts_sane_defaults() {
    assert!(base_config().validate().is_ok());
  }
}
