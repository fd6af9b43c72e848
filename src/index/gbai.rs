//! Bit-exact codec for the alternate dense index format (spec §6).
//!
//! Framing: a 16-byte magic, followed by a gzip-compressed stream of fixed
//! 20-byte entries `(refId: i32 LE, pos: i32 LE, seq: u32 LE, compressed
//! virtual offset: u64 LE)`. Mirrors the teacher's own binary framing style
//! (`byteorder` LE fields, a magic-byte sniff à la `src/deser/gz.rs`,
//! `crates/set/src/lib.rs`'s explicit little-endian header layout).

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{DupmarkError, Result};
use crate::record::UNMAPPED_REF_ID;
use crate::shard::IndexEntry;

pub const MAGIC: [u8; 16] = [
  b'G', b'B', b'A', b'I', 0x01, 0xf1, 0x78, 0x5c, 0x7b, 0xcb, 0xc1, 0xba, 0x08, 0x23, 0xb1, 0x19,
];

const ENTRY_BYTE_SIZE: usize = 4 + 4 + 4 + 8;

/// Decode a `.gbai` byte stream into index entries, validating the magic,
/// the sort order, and the strictly-increasing file-offset invariant (spec
/// §6).
pub fn read<R: Read>(mut reader: R) -> Result<Vec<IndexEntry>> {
  let mut magic = [0u8; 16];
  reader.read_exact(&mut magic).map_err(DupmarkError::Io)?;
  if magic != MAGIC {
    return Err(DupmarkError::input_integrity(
      "gbai index: bad magic bytes",
    ));
  }

  let mut gz = GzDecoder::new(reader);
  let mut buf = Vec::new();
  gz.read_to_end(&mut buf).map_err(DupmarkError::Io)?;
  if buf.len() % ENTRY_BYTE_SIZE != 0 {
    return Err(DupmarkError::input_integrity(
      "gbai index: truncated entry stream",
    ));
  }

  let mut entries = Vec::with_capacity(buf.len() / ENTRY_BYTE_SIZE);
  let mut cursor = io::Cursor::new(&buf);
  let mut prev: Option<IndexEntry> = None;
  while (cursor.position() as usize) < buf.len() {
    let ref_id = cursor.read_i32::<LittleEndian>().map_err(DupmarkError::Io)?;
    let pos = cursor.read_i32::<LittleEndian>().map_err(DupmarkError::Io)? as i64;
    let seq = cursor.read_u32::<LittleEndian>().map_err(DupmarkError::Io)?;
    let voffset = cursor.read_u64::<LittleEndian>().map_err(DupmarkError::Io)?;
    let file_offset = voffset >> 16;
    let entry = IndexEntry {
      ref_id,
      pos,
      seq,
      file_offset,
    };

    if let Some(p) = prev {
      let p_key = (sort_key(p.ref_id), p.pos, p.seq);
      let key = (sort_key(entry.ref_id), entry.pos, entry.seq);
      if key <= p_key {
        return Err(DupmarkError::input_integrity(
          "gbai index: entries not strictly ordered by (refId, pos, seq)",
        ));
      }
      if entry.file_offset <= p.file_offset {
        return Err(DupmarkError::input_integrity(
          "gbai index: file offset not strictly increasing between entries",
        ));
      }
    }
    prev = Some(entry);
    entries.push(entry);
  }
  Ok(entries)
}

/// `-1` (unmapped) sorts last, per spec §6.
fn sort_key(ref_id: i32) -> i64 {
  if ref_id == UNMAPPED_REF_ID {
    i64::MAX
  } else {
    ref_id as i64
  }
}

/// Encode index entries to the `.gbai` format. Entries must already be in
/// the sort order required by the format; this does not re-sort them.
pub fn write<W: Write>(mut writer: W, entries: &[IndexEntry], within_block_offsets: &[u16]) -> Result<()> {
  debug_assert_eq!(entries.len(), within_block_offsets.len());
  writer.write_all(&MAGIC).map_err(DupmarkError::Io)?;
  let mut gz = GzEncoder::new(writer, Compression::default());
  for (entry, within_block) in entries.iter().zip(within_block_offsets) {
    gz.write_i32::<LittleEndian>(entry.ref_id).map_err(DupmarkError::Io)?;
    gz.write_i32::<LittleEndian>(entry.pos as i32).map_err(DupmarkError::Io)?;
    gz.write_u32::<LittleEndian>(entry.seq).map_err(DupmarkError::Io)?;
    let voffset = (entry.file_offset << 16) | (*within_block as u64);
    gz.write_u64::<LittleEndian>(voffset).map_err(DupmarkError::Io)?;
  }
  gz.finish().map_err(DupmarkError::Io)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_trips_entries() {
    let entries = vec![
      IndexEntry { ref_id: 0, pos: 0, seq: 0, file_offset: 0 },
      IndexEntry { ref_id: 0, pos: 100, seq: 0, file_offset: 4096 },
      IndexEntry { ref_id: 1, pos: 0, seq: 0, file_offset: 8192 },
    ];
    let offsets = vec![0u16; entries.len()];
    let mut buf = Vec::new();
    write(&mut buf, &entries, &offsets).unwrap();
    let decoded = read(io::Cursor::new(buf)).unwrap();
    assert_eq!(decoded.len(), entries.len());
    for (a, b) in entries.iter().zip(decoded.iter()) {
      assert_eq!(a.ref_id, b.ref_id);
      assert_eq!(a.pos, b.pos);
      assert_eq!(a.file_offset, b.file_offset);
    }
  }

  #[test]
  fn rejects_bad_magic() {
    let buf = vec![0u8; 16];
    assert!(read(io::Cursor::new(buf)).is_err());
  }

  #[test]
  fn rejects_non_increasing_file_offset() {
    let entries = vec![
      IndexEntry { ref_id: 0, pos: 0, seq: 0, file_offset: 10 },
      IndexEntry { ref_id: 0, pos: 100, seq: 0, file_offset: 10 },
    ];
    let offsets = vec![0u16; entries.len()];
    let mut buf = Vec::new();
    write(&mut buf, &entries, &offsets).unwrap();
    assert!(read(io::Cursor::new(buf)).is_err());
  }
}
