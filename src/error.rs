//! Error taxonomy for the duplicate-marking engine (spec §7).

use std::path::PathBuf;

use thiserror::Error;

/// Every error the engine can return, classified by the kind of failure.
#[derive(Error, Debug)]
pub enum DupmarkError {
  /// Invalid configuration, detected before any shard work begins.
  #[error("invalid configuration: {0}")]
  Config(String),

  /// Input integrity violation: a malformed or inconsistent record, or a
  /// cross-shard invariant that the input's sort order was supposed to
  /// guarantee.
  #[error("input integrity error: {0}")]
  InputIntegrity(String),

  /// Resource failure: could not open/create a file, disk full, index
  /// parse failure.
  #[error("resource error at {path:?}: {source}")]
  Resource {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// Transient I/O during phase 1/2 processing.
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  /// A class invariant that should never fire in a correct build, but is
  /// surfaced as an error (rather than a panic) wherever it crosses a
  /// worker boundary, per the design notes in spec §9.
  #[error("invariant violation: {0}")]
  Invariant(String),
}

impl DupmarkError {
  pub fn config<S: Into<String>>(msg: S) -> Self {
    DupmarkError::Config(msg.into())
  }

  pub fn input_integrity<S: Into<String>>(msg: S) -> Self {
    DupmarkError::InputIntegrity(msg.into())
  }

  pub fn invariant<S: Into<String>>(msg: S) -> Self {
    DupmarkError::Invariant(msg.into())
  }

  pub fn resource(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
    DupmarkError::Resource {
      path: path.into(),
      source,
    }
  }
}

pub type Result<T> = std::result::Result<T, DupmarkError>;
