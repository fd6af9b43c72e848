//! Optical-duplicate detection (spec §4.5): flow-cell coordinate parsing,
//! the pixel-radius test, and histogram distance sampling.

use std::collections::HashMap;

use crate::error::{DupmarkError, Result};
use crate::record::{FileIndex, Orientation};

/// Flow-cell coordinates parsed from a read name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCoords {
  pub lane: i32,
  pub tile: i64,
  pub x: i64,
  pub y: i64,
}

/// Parse `lane`/`tile`/`x`/`y` out of a ':'-delimited read name. Accepts
/// exactly 5, 7, or 8 fields; the tile field sits at index 2 (5-field names)
/// or index 4 (7- or 8-field names), with lane immediately before it and
/// x/y immediately after (spec §4.5).
pub fn parse_coords(name: &str) -> Result<ReadCoords> {
  let fields: Vec<&str> = name.split(':').collect();
  let tile_idx = match fields.len() {
    5 => 2,
    7 | 8 => 4,
    n => {
      return Err(DupmarkError::input_integrity(format!(
        "read name {name:?} has {n} ':'-delimited fields, expected 5, 7 or 8"
      )))
    }
  };
  let lane_idx = tile_idx - 1;
  let x_idx = tile_idx + 1;
  let y_idx = tile_idx + 2;

  let parse_int = |idx: usize, what: &str| -> Result<i64> {
    fields[idx].parse::<i64>().map_err(|_| {
      DupmarkError::input_integrity(format!(
        "read name {name:?}: field {idx} ({what}) is not an integer"
      ))
    })
  };

  let lane = parse_int(lane_idx, "lane")? as i32;
  let tile_field = fields[tile_idx];
  let tile_digits = tile_field.trim_start_matches('-').len();
  if tile_digits != 4 && tile_digits != 5 {
    return Err(DupmarkError::input_integrity(format!(
      "read name {name:?}: tile {tile_field:?} must have 4 or 5 digits"
    )));
  }
  let tile = parse_int(tile_idx, "tile")?;
  let x = parse_int(x_idx, "x")?;
  let y = parse_int(y_idx, "y")?;

  Ok(ReadCoords { lane, tile, x, y })
}

/// The partitioning key for the optical-duplicate test: pairs in different
/// buckets can never be optical duplicates of each other (spec §4.5).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpticalBucketKey {
  pub lane: i32,
  pub tile: i64,
  pub read_group: Option<String>,
  pub orientation: Orientation,
}

pub struct OpticalItem {
  pub coords: ReadCoords,
  pub bucket: OpticalBucketKey,
}

fn within_radius(a: ReadCoords, b: ReadCoords, pixel_distance: i64) -> bool {
  (a.x - b.x).abs() <= pixel_distance && (a.y - b.y).abs() <= pixel_distance
}

/// Flag optical duplicates within a `DuplicateSet`'s pairs (spec §4.5).
///
/// Only the primary's own bucket is ever examined: a bucket with no primary
/// member has no seed to propagate from, so its members are non-optical
/// (still library duplicates, tagged "LB" downstream). `pixel_distance < 0`
/// disables the detector entirely.
pub fn detect_optical(items: &[OpticalItem], primary_idx: usize, pixel_distance: i64) -> Vec<bool> {
  let mut flagged = vec![false; items.len()];
  if pixel_distance < 0 {
    return flagged;
  }

  let primary_bucket = &items[primary_idx].bucket;
  let members: Vec<usize> = items
    .iter()
    .enumerate()
    .filter(|(_, it)| &it.bucket == primary_bucket)
    .map(|(i, _)| i)
    .collect();

  for &i in &members {
    if i == primary_idx {
      continue;
    }
    if within_radius(items[i].coords, items[primary_idx].coords, pixel_distance) {
      flagged[i] = true;
    }
  }

  // Transitive closure over the remaining members, iterated to a fixpoint
  // so a chain of near neighbours all end up flagged regardless of scan
  // order.
  loop {
    let mut changed = false;
    for &i in &members {
      if i == primary_idx {
        continue;
      }
      for &j in &members {
        if i == j || j == primary_idx {
          continue;
        }
        if flagged[i] != flagged[j] && within_radius(items[i].coords, items[j].coords, pixel_distance) {
          flagged[i] = true;
          flagged[j] = true;
          changed = true;
        }
      }
    }
    if !changed {
      break;
    }
  }

  flagged
}

/// The grouping key for optical-histogram sampling: coarser than the
/// dup-test bucket (no tile dimension), per spec §4.5.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HistogramClusterKey {
  pub lane: i32,
  pub read_group: Option<String>,
  pub orientation: Orientation,
}

pub struct HistogramItem {
  pub coords: ReadCoords,
  pub file_index: FileIndex,
  pub cluster: HistogramClusterKey,
}

/// Group items by cluster, and within each cluster select at most `k`
/// members: sort by `FileIndex`, then apply a deterministic shuffle seeded
/// by the cluster's smallest `FileIndex`, then truncate (spec §4.5).
/// Returns, for every pairwise Euclidean distance among the selected
/// members of a cluster, that cluster's full (pre-truncation) bag size
/// alongside it, since the histogram bins distances by the bag-size class
/// of the cluster they came from (spec §4.6).
pub fn sample_histogram_distances(items: &[HistogramItem], k: Option<usize>) -> Vec<(usize, f64)> {
  let mut clusters: HashMap<&HistogramClusterKey, Vec<&HistogramItem>> = HashMap::new();
  for item in items {
    clusters.entry(&item.cluster).or_default().push(item);
  }

  let mut distances = Vec::new();
  for members in clusters.values_mut() {
    let bag_size = members.len();
    members.sort_by_key(|it| it.file_index);
    let selected: Vec<&HistogramItem> = match k {
      None => members.clone(),
      Some(k) => {
        let seed = members.first().map(|it| it.file_index).unwrap_or(0);
        let mut order: Vec<usize> = (0..members.len()).collect();
        let mut rng = fastrand::Rng::with_seed(seed);
        // Fisher-Yates, matching fastrand's own `shuffle` algorithm but
        // applied to indices so the original FileIndex order is available
        // for the initial sort above.
        for i in (1..order.len()).rev() {
          let j = rng.usize(0..=i);
          order.swap(i, j);
        }
        order.truncate(k);
        order.into_iter().map(|i| members[i]).collect()
      }
    };
    for i in 0..selected.len() {
      for j in (i + 1)..selected.len() {
        let (a, b) = (selected[i].coords, selected[j].coords);
        let dx = (a.x - b.x) as f64;
        let dy = (a.y - b.y) as f64;
        distances.push((bag_size, (dx * dx + dy * dy).sqrt()));
      }
    }
  }
  distances
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_seven_field_illumina_name() {
    let c = parse_coords("INST1:1:FC1:4:1101:10000:20000").unwrap();
    assert_eq!(c.lane, 4);
    assert_eq!(c.tile, 1101);
    assert_eq!(c.x, 10000);
    assert_eq!(c.y, 20000);
  }

  #[test]
  fn parses_five_field_name() {
    let c = parse_coords("7:1101:5000:6000:1").unwrap();
    assert_eq!(c.lane, 7);
    assert_eq!(c.tile, 1101);
    assert_eq!(c.x, 5000);
    assert_eq!(c.y, 6000);
  }

  #[test]
  fn rejects_bad_field_count() {
    assert!(parse_coords("a:b:c:d").is_err());
  }

  #[test]
  fn rejects_bad_tile_digit_count() {
    assert!(parse_coords("INST1:1:FC1:4:11:10000:20000").is_err());
  }

  fn item(bucket: OpticalBucketKey, x: i64, y: i64) -> OpticalItem {
    OpticalItem {
      coords: ReadCoords { lane: bucket.lane, tile: bucket.tile, x, y },
      bucket,
    }
  }

  #[test]
  fn flags_only_primary_bucket_neighbours() {
    let bucket_a = OpticalBucketKey {
      lane: 1,
      tile: 1101,
      read_group: None,
      orientation: Orientation::FR,
    };
    let bucket_b = OpticalBucketKey {
      lane: 1,
      tile: 1102,
      read_group: None,
      orientation: Orientation::FR,
    };
    let items = vec![
      item(bucket_a.clone(), 100, 100), // primary
      item(bucket_a.clone(), 105, 102), // within radius, same bucket
      item(bucket_b.clone(), 100, 100), // would be within radius, different bucket
    ];
    let flagged = detect_optical(&items, 0, 50);
    assert_eq!(flagged, vec![false, true, false]);
  }

  #[test]
  fn disabled_when_pixel_distance_negative() {
    let bucket = OpticalBucketKey {
      lane: 1,
      tile: 1101,
      read_group: None,
      orientation: Orientation::FR,
    };
    let items = vec![item(bucket.clone(), 0, 0), item(bucket, 1, 1)];
    assert_eq!(detect_optical(&items, 0, -1), vec![false, false]);
  }
}
