use criterion::{criterion_group, criterion_main, Criterion};

use dupmark::header::{Header, Reference};
use dupmark::matcher::{compute_duplicate_sets, MatcherConfig, SetMember};
use dupmark::pair::Pair;
use dupmark::record::{AlignmentRecord, Cigar, CigarOp, Flags};
use dupmark::shard::plan_by_position;

fn synthetic_header(ref_len: u64) -> Header {
  Header::new(vec![Reference { name: "chr1".to_string(), length: ref_len }], Default::default())
}

fn synthetic_pair(pos: i64, file_index: u64, quals: u8) -> SetMember {
  let mut rng = fastrand::Rng::with_seed(file_index);
  let jitter = rng.i64(0..5);
  let left = AlignmentRecord {
    name: format!("r{file_index}"),
    ref_id: 0,
    pos: pos + jitter,
    mapq: 60,
    flags: Flags(Flags::PAIRED | Flags::READ1 | Flags::MATE_REVERSE),
    cigar: Cigar(vec![(CigarOp::Match, 100)]),
    sequence: vec![b'A'; 100],
    qualities: vec![quals; 100],
    mate_ref_id: 0,
    mate_pos: pos + 300,
    template_len: 300,
    aux: Vec::new(),
    file_index: Some(file_index * 2),
  };
  let right = AlignmentRecord {
    name: left.name.clone(),
    ref_id: 0,
    pos: pos + 300,
    mapq: 60,
    flags: Flags(Flags::PAIRED | Flags::READ2 | Flags::REVERSE),
    cigar: Cigar(vec![(CigarOp::Match, 100)]),
    sequence: vec![b'A'; 100],
    qualities: vec![quals; 100],
    mate_ref_id: 0,
    mate_pos: pos + jitter,
    template_len: 300,
    aux: Vec::new(),
    file_index: Some(file_index * 2 + 1),
  };
  SetMember::Pair(Pair::new(left, right))
}

fn bench_plan_by_position(c: &mut Criterion) {
  let header = synthetic_header(250_000_000);
  let mut group = c.benchmark_group("ShardPlanner");
  group.bench_function("plan_by_position/100kb shards", |b| {
    b.iter(|| plan_by_position(&header, 100_000, 500, true))
  });
  group.finish();
}

fn bench_matcher(c: &mut Criterion) {
  // Members clustered into groups of 4 duplicate pairs each, at distinct
  // positions spaced far enough apart not to collide.
  let members: Vec<SetMember> = (0..40_000u64)
    .map(|i| {
      let cluster = (i / 4) as i64;
      synthetic_pair(cluster * 1000, i, 20 + (i % 10) as u8)
    })
    .collect();

  let mut group = c.benchmark_group("Matcher");
  group.sample_size(10);
  group.bench_function("compute_duplicate_sets/40k members", |b| {
    b.iter_batched(
      || members.clone(),
      |members| {
        let config = MatcherConfig {
          strand_specific: false,
          separate_singletons: false,
          use_umis: false,
          scavenge_distance: None,
          known_umis: None,
        };
        compute_duplicate_sets(members, &config).unwrap()
      },
      criterion::BatchSize::LargeInput,
    )
  });
  group.finish();
}

criterion_group!(benches, bench_plan_by_position, bench_matcher);
criterion_main!(benches);
