use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;

use dupmark::config::{Config, DistantMateBacking, OpticalConfig, OutputFormat, ShardStrategy, UmiConfig};
use dupmark::pair::UmiCorrector;

/// Mark PCR and optical duplicates in a coordinate-sorted BAM/SAM file.
#[derive(Debug, Parser)]
#[command(name = "dupmark", version, about)]
struct Args {
  /// Coordinate-sorted BAM input.
  #[arg(short = 'i', long)]
  input: PathBuf,

  /// Dense or classical coordinate index (required for --shard-bytes).
  #[arg(long)]
  index: Option<PathBuf>,

  /// Where to write the tagged output.
  #[arg(short = 'o', long)]
  output: PathBuf,

  /// Output container format.
  #[arg(long, value_enum, default_value_t = OutputFormatArg::Bam)]
  output_format: OutputFormatArg,

  /// Strip any pre-existing duplicate bit and DI/DL/DS/DT/DU aux fields from
  /// every record before computing a fresh tagging decision (spec "clear
  /// existing"); needed to re-run on the tool's own output without stacking
  /// stale tags on top of new ones.
  #[arg(long)]
  clear_existing: bool,

  /// Overwrite the output path if it already exists.
  #[arg(long)]
  overwrite: bool,

  /// Number of pass-2 worker threads.
  #[arg(short = 'p', long, default_value_t = 4)]
  parallelism: usize,

  /// Number of finished shards the ordered writer may buffer ahead.
  #[arg(long, default_value_t = 8)]
  queue_len: usize,

  /// Shard size in bases (position-based sharding; mutually exclusive with --shard-bytes).
  #[arg(long, default_value_t = 1_000_000)]
  shard_size: u64,

  /// Target compressed bytes per shard (index-based sharding).
  #[arg(long)]
  shard_bytes: Option<u64>,

  /// Minimum bases a byte-planned shard must cover before it is closed.
  #[arg(long, default_value_t = 10_000)]
  min_shard_bases: u64,

  /// Bases of padding added on each side of a shard's clip-distance check.
  #[arg(long, default_value_t = 5_000)]
  clip_padding: u64,

  /// Number of on-disk shards for the distant-mate table (omit to keep it in memory).
  #[arg(long)]
  disk_mate_shards: Option<usize>,

  /// Scratch directory for the on-disk distant-mate table.
  #[arg(long, default_value = "/tmp")]
  scratch_dir: PathBuf,

  /// Physically drop duplicate records from the output instead of just tagging them.
  #[arg(long)]
  remove_duplicates: bool,

  /// Skip setting the duplicate flag (still computes and reports metrics).
  #[arg(long)]
  no_tag_duplicates: bool,

  /// Emit the DI tag as a plain integer instead of the default string form.
  #[arg(long)]
  integer_di: bool,

  /// Omit DS/DL/DT/DU tags, writing only the duplicate flag and DI.
  #[arg(long)]
  no_emit_unmodified_fields: bool,

  /// Never absorb mate-unmapped singletons into a pair's duplicate set.
  #[arg(long)]
  separate_singletons: bool,

  /// Treat opposite-strand pairs at the same position as distinct duplicate groups.
  #[arg(long)]
  strand_specific: bool,

  /// Enable UMI-aware duplicate grouping.
  #[arg(long)]
  use_umis: bool,

  /// File of known UMI sequences, one per line.
  #[arg(long)]
  umi_file: Option<PathBuf>,

  /// Maximum edit distance for scavenging an unlisted UMI into a known one (requires --umi-file).
  #[arg(long)]
  scavenge_umis: Option<u32>,

  /// Pixel radius for the optical-duplicate test; omit or pass a negative value to disable it.
  #[arg(long, default_value_t = 100)]
  optical_distance: i64,

  /// Write a per-cluster optical-distance histogram to this path.
  #[arg(long)]
  optical_histogram: Option<PathBuf>,

  /// Cap the number of reads sampled per cluster when building the histogram.
  #[arg(long)]
  histogram_max_per_cluster: Option<usize>,

  /// Where to write the per-library metrics file.
  #[arg(long, default_value = "dupmark_metrics.txt")]
  metrics: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormatArg {
  Bam,
  Sam,
}

fn build_config(args: &Args) -> anyhow::Result<Config> {
  let shard_strategy = match args.shard_bytes {
    Some(bytes_per_shard) => ShardStrategy::ByBytes {
      bytes_per_shard,
      min_bases: args.min_shard_bases,
    },
    None => ShardStrategy::ByPosition {
      shard_size: args.shard_size,
    },
  };

  let distant_mate_backing = match args.disk_mate_shards {
    Some(shard_count) => DistantMateBacking::Disk { shard_count },
    None => DistantMateBacking::Memory,
  };

  let config = Config {
    input_path: args.input.clone(),
    index_path: args.index.clone(),
    output_path: args.output.clone(),
    output_format: match args.output_format {
      OutputFormatArg::Bam => OutputFormat::Bam,
      OutputFormatArg::Sam => OutputFormat::Sam,
    },
    parallelism: args.parallelism,
    queue_len: args.queue_len,
    shard_strategy,
    padding: args.clip_padding,
    distant_mate_backing,
    scratch_dir: args.scratch_dir.clone(),
    clear_existing: args.clear_existing,
    remove_duplicates: args.remove_duplicates,
    tag_duplicates: !args.no_tag_duplicates,
    integer_di: args.integer_di,
    emit_unmodified_fields: !args.no_emit_unmodified_fields,
    separate_singletons: args.separate_singletons,
    strand_specific: args.strand_specific,
    umi: UmiConfig {
      use_umis: args.use_umis,
      known_umi_file: args.umi_file.clone(),
      scavenge_distance: args.scavenge_umis,
    },
    optical: OpticalConfig {
      pixel_distance: args.optical_distance,
      histogram_path: args.optical_histogram.clone(),
      histogram_max_per_cluster: args.histogram_max_per_cluster,
    },
    metrics_path: args.metrics.clone(),
  };
  config.validate().context("invalid configuration")?;
  Ok(config)
}

fn load_known_umis(path: &PathBuf) -> anyhow::Result<UmiCorrector> {
  let text = std::fs::read_to_string(path).with_context(|| format!("reading known-UMI file {path:?}"))?;
  let known: Vec<String> = text.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect();
  Ok(UmiCorrector::new(known))
}

fn run(args: Args) -> anyhow::Result<()> {
  let config = build_config(&args)?;

  if config.output_path.exists() && !args.overwrite {
    bail!("{:?} already exists; pass --overwrite to overwrite it", config.output_path);
  }

  log::info!("reading {:?}", config.input_path);
  let (header, records) = dupmark::io::read_all_records(&config.input_path)
    .with_context(|| format!("reading {:?}", config.input_path))?;
  log::info!("read {} records across {} references", records.len(), header.references.len());

  let index_entries = match &config.index_path {
    Some(path) => {
      let entries = dupmark::io::read_dense_index(path)
        .or_else(|_| {
          let sam_header = dupmark::io::reconstruct_sam_header(&header);
          dupmark::io::read_classical_index(path, &sam_header)
        })
        .with_context(|| format!("reading index {path:?}"))?;
      Some(entries)
    }
    None => None,
  };

  let known_umis = match &config.umi.known_umi_file {
    Some(path) => Some(load_known_umis(path)?),
    None => None,
  };

  let sam_header = dupmark::io::reconstruct_sam_header(&header);
  let summary = match config.output_format {
    OutputFormat::Bam => {
      let sink = dupmark::io::BamSink::create(&config.output_path, sam_header)
        .with_context(|| format!("creating output {:?}", config.output_path))?;
      let (summary, sink) = dupmark::run(&config, header, records, index_entries, known_umis, sink)?;
      sink.finish().context("finishing BAM output")?;
      summary
    }
    OutputFormat::Sam => {
      let sink = dupmark::io::SamSink::create(&config.output_path, sam_header)
        .with_context(|| format!("creating output {:?}", config.output_path))?;
      let (summary, sink) = dupmark::run(&config, header, records, index_entries, known_umis, sink)?;
      sink.finish().context("finishing SAM output")?;
      summary
    }
  };

  log::info!(
    "wrote {} of {} records ({} shards) in {:.2}s (phase 1: {:.2}s, phase 2: {:.2}s)",
    summary.records_out,
    summary.records_in,
    summary.shards_planned,
    (summary.phase1_elapsed + summary.phase2_elapsed).as_secs_f64(),
    summary.phase1_elapsed.as_secs_f64(),
    summary.phase2_elapsed.as_secs_f64()
  );

  let metrics_file = File::create(&config.metrics_path)
    .with_context(|| format!("creating metrics file {:?}", config.metrics_path))?;
  dupmark::metrics::write_metrics_file(BufWriter::new(metrics_file), &summary.metrics, config.padding)?;

  if let Some(histogram_path) = &config.optical.histogram_path {
    let histogram_file = File::create(histogram_path)
      .with_context(|| format!("creating optical-histogram file {histogram_path:?}"))?;
    dupmark::metrics::write_optical_histogram_file(BufWriter::new(histogram_file), &summary.metrics.histogram)?;
  }

  Ok(())
}

fn main() -> anyhow::Result<()> {
  env_logger::init();
  let args = Args::parse();
  run(args)
}
