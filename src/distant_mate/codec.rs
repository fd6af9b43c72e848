//! Wire framing for the on-disk distant-mate shard files: a `snap`-framed
//! stream of `(originShard: u32 LE, localIndex: u64 LE, recordLen: u32 LE,
//! record bytes)` tuples (spec §4.2's "serialised_record" left abstract;
//! this is this crate's concrete realization of it, in the same
//! hand-rolled `byteorder` style as `index::gbai`).

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::record::{AlignmentRecord, AuxField, AuxValue, Cigar, CigarOp, Flags, OrderedF64};

use super::DistantMateEntry;

pub fn encode_entry<W: Write>(mut writer: W, entry: &DistantMateEntry) -> io::Result<()> {
  writer.write_u32::<LittleEndian>(entry.origin_shard as u32)?;
  writer.write_u64::<LittleEndian>(entry.local_index)?;
  let body = encode_record(&entry.record);
  writer.write_u32::<LittleEndian>(body.len() as u32)?;
  writer.write_all(&body)?;
  Ok(())
}

pub fn decode_entry<R: Read>(mut reader: R) -> io::Result<DistantMateEntry> {
  let origin_shard = reader.read_u32::<LittleEndian>()? as usize;
  let local_index = reader.read_u64::<LittleEndian>()?;
  let len = reader.read_u32::<LittleEndian>()? as usize;
  let mut body = vec![0u8; len];
  reader.read_exact(&mut body)?;
  let record = decode_record(&body)?;
  Ok(DistantMateEntry {
    record,
    origin_shard,
    local_index,
  })
}

/// Decode every entry in a shard file, compressed with `snap`'s framing
/// format.
pub fn decode_all(file: std::fs::File) -> io::Result<Vec<DistantMateEntry>> {
  let mut reader = snap::read::FrameDecoder::new(file);
  let mut entries = Vec::new();
  loop {
    match decode_entry(&mut reader) {
      Ok(entry) => entries.push(entry),
      Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
      Err(e) => return Err(e),
    }
  }
  Ok(entries)
}

fn encode_record(rec: &AlignmentRecord) -> Vec<u8> {
  let mut buf = Vec::new();
  write_string(&mut buf, &rec.name);
  buf.write_i32::<LittleEndian>(rec.ref_id).unwrap();
  buf.write_i64::<LittleEndian>(rec.pos).unwrap();
  buf.write_u8(rec.mapq).unwrap();
  buf.write_u16::<LittleEndian>(rec.flags.0).unwrap();
  buf.write_u32::<LittleEndian>(rec.cigar.0.len() as u32).unwrap();
  for (op, len) in &rec.cigar.0 {
    buf.write_u8(cigar_op_to_u8(*op)).unwrap();
    buf.write_u32::<LittleEndian>(*len).unwrap();
  }
  buf.write_u32::<LittleEndian>(rec.sequence.len() as u32).unwrap();
  buf.write_u32::<LittleEndian>(rec.qualities.len() as u32).unwrap();
  buf.extend_from_slice(&rec.qualities);
  buf.write_i32::<LittleEndian>(rec.mate_ref_id).unwrap();
  buf.write_i64::<LittleEndian>(rec.mate_pos).unwrap();
  buf.write_i64::<LittleEndian>(rec.template_len).unwrap();
  buf.write_u32::<LittleEndian>(rec.aux.len() as u32).unwrap();
  for aux in &rec.aux {
    buf.write_all(&aux.tag).unwrap();
    match &aux.value {
      AuxValue::Int(v) => {
        buf.write_u8(0).unwrap();
        buf.write_i64::<LittleEndian>(*v).unwrap();
      }
      AuxValue::Float(OrderedF64(v)) => {
        buf.write_u8(1).unwrap();
        buf.write_f64::<LittleEndian>(*v).unwrap();
      }
      AuxValue::String(s) => {
        buf.write_u8(2).unwrap();
        write_string(&mut buf, s);
      }
      AuxValue::Other(bytes) => {
        buf.write_u8(3).unwrap();
        buf.write_u32::<LittleEndian>(bytes.len() as u32).unwrap();
        buf.write_all(bytes).unwrap();
      }
    }
  }
  buf
}

fn decode_record(buf: &[u8]) -> io::Result<AlignmentRecord> {
  let mut cursor = io::Cursor::new(buf);
  let name = read_string(&mut cursor)?;
  let ref_id = cursor.read_i32::<LittleEndian>()?;
  let pos = cursor.read_i64::<LittleEndian>()?;
  let mapq = cursor.read_u8()?;
  let flags = Flags(cursor.read_u16::<LittleEndian>()?);
  let cigar_len = cursor.read_u32::<LittleEndian>()? as usize;
  let mut ops = Vec::with_capacity(cigar_len);
  for _ in 0..cigar_len {
    let op = cigar_op_from_u8(cursor.read_u8()?)?;
    let len = cursor.read_u32::<LittleEndian>()?;
    ops.push((op, len));
  }
  // Only the read length is framed, not the bases: a distant-mate entry's
  // copy is consulted by `processor::process_shard` for pairing/invariant
  // checks alone and is never written back out, so the bases themselves
  // would be dead weight in every on-disk shard file.
  let seq_len = cursor.read_u32::<LittleEndian>()? as usize;
  let qual_len = cursor.read_u32::<LittleEndian>()? as usize;
  let mut qualities = vec![0u8; qual_len];
  cursor.read_exact(&mut qualities)?;
  let mate_ref_id = cursor.read_i32::<LittleEndian>()?;
  let mate_pos = cursor.read_i64::<LittleEndian>()?;
  let template_len = cursor.read_i64::<LittleEndian>()?;
  let aux_len = cursor.read_u32::<LittleEndian>()? as usize;
  let mut aux = Vec::with_capacity(aux_len);
  for _ in 0..aux_len {
    let mut tag = [0u8; 2];
    cursor.read_exact(&mut tag)?;
    let value = match cursor.read_u8()? {
      0 => AuxValue::Int(cursor.read_i64::<LittleEndian>()?),
      1 => AuxValue::Float(OrderedF64(cursor.read_f64::<LittleEndian>()?)),
      2 => AuxValue::String(read_string(&mut cursor)?),
      3 => {
        let len = cursor.read_u32::<LittleEndian>()? as usize;
        let mut bytes = vec![0u8; len];
        cursor.read_exact(&mut bytes)?;
        AuxValue::Other(bytes)
      }
      other => {
        return Err(io::Error::new(
          io::ErrorKind::InvalidData,
          format!("unknown aux value discriminant {other}"),
        ))
      }
    };
    aux.push(AuxField { tag, value });
  }
  Ok(AlignmentRecord {
    name,
    ref_id,
    pos,
    mapq,
    flags,
    cigar: Cigar(ops),
    sequence: vec![0u8; seq_len],
    qualities,
    mate_ref_id,
    mate_pos,
    template_len,
    aux,
    file_index: None,
  })
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
  buf.write_u16::<LittleEndian>(s.len() as u16).unwrap();
  buf.extend_from_slice(s.as_bytes());
}

fn read_string<R: Read>(reader: &mut R) -> io::Result<String> {
  let len = reader.read_u16::<LittleEndian>()? as usize;
  let mut bytes = vec![0u8; len];
  reader.read_exact(&mut bytes)?;
  String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn cigar_op_to_u8(op: CigarOp) -> u8 {
  match op {
    CigarOp::Match => 0,
    CigarOp::Insertion => 1,
    CigarOp::Deletion => 2,
    CigarOp::Skip => 3,
    CigarOp::SoftClip => 4,
    CigarOp::HardClip => 5,
    CigarOp::Padding => 6,
    CigarOp::SeqMatch => 7,
    CigarOp::SeqMismatch => 8,
  }
}

fn cigar_op_from_u8(b: u8) -> io::Result<CigarOp> {
  Ok(match b {
    0 => CigarOp::Match,
    1 => CigarOp::Insertion,
    2 => CigarOp::Deletion,
    3 => CigarOp::Skip,
    4 => CigarOp::SoftClip,
    5 => CigarOp::HardClip,
    6 => CigarOp::Padding,
    7 => CigarOp::SeqMatch,
    8 => CigarOp::SeqMismatch,
    other => {
      return Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unknown cigar op discriminant {other}"),
      ))
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample() -> AlignmentRecord {
    AlignmentRecord {
      name: "read-x".to_string(),
      ref_id: 3,
      pos: 1000,
      mapq: 60,
      flags: Flags(Flags::PAIRED | Flags::READ1),
      cigar: Cigar(vec![(CigarOp::SoftClip, 5), (CigarOp::Match, 95)]),
      sequence: vec![b'A'; 100],
      qualities: vec![35; 100],
      mate_ref_id: 3,
      mate_pos: 2000,
      template_len: 1100,
      aux: vec![
        AuxField { tag: *b"RG", value: AuxValue::String("lib1".to_string()) },
        AuxField { tag: *b"NM", value: AuxValue::Int(2) },
      ],
      file_index: None,
    }
  }

  #[test]
  fn round_trips_a_record_through_the_frame() {
    let entry = DistantMateEntry {
      record: sample(),
      origin_shard: 7,
      local_index: 42,
    };
    let mut buf = Vec::new();
    encode_entry(&mut buf, &entry).unwrap();
    let decoded = decode_entry(io::Cursor::new(buf)).unwrap();
    assert_eq!(decoded.origin_shard, 7);
    assert_eq!(decoded.local_index, 42);
    assert_eq!(decoded.record.name, "read-x");
    assert_eq!(decoded.record.aux.len(), 2);
  }
}
