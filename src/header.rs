//! Reference sequence dictionary and read-group → library mapping (spec §3).
//!
//! Built once from the container header and shared immutably (`Arc<Header>`)
//! across every worker, mirroring how the teacher crate shares its
//! immutable post-load coverage/header objects.

use std::collections::HashMap;

use crate::record::UNMAPPED_REF_ID;

pub const UNKNOWN_LIBRARY: &str = "Unknown Library";

#[derive(Debug, Clone)]
pub struct Reference {
  pub name: String,
  pub length: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Header {
  pub references: Vec<Reference>,
  /// Read-group ID -> library name, flattened from the container's `@RG`
  /// records at load time.
  read_group_to_library: HashMap<String, String>,
}

impl Header {
  pub fn new(references: Vec<Reference>, read_group_to_library: HashMap<String, String>) -> Self {
    Header {
      references,
      read_group_to_library,
    }
  }

  pub fn reference(&self, ref_id: i32) -> Option<&Reference> {
    if ref_id == UNMAPPED_REF_ID {
      None
    } else {
      self.references.get(ref_id as usize)
    }
  }

  pub fn reference_len(&self, ref_id: i32) -> Option<u64> {
    self.reference(ref_id).map(|r| r.length)
  }

  /// The library for a record's read-group tag, or `Unknown Library` if the
  /// record carries no RG tag or the RG is not in the header.
  pub fn library_for_read_group(&self, read_group: Option<&str>) -> &str {
    read_group
      .and_then(|rg| self.read_group_to_library.get(rg))
      .map(|s| s.as_str())
      .unwrap_or(UNKNOWN_LIBRARY)
  }
}
