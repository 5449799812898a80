use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StrataError>;

/// Mount-time and configuration errors. Once the union is up, per-operation
/// failures travel as raw errno values instead (see `union::convert`).
#[derive(Error, Debug)]
pub enum StrataError {
    #[error("Bad mount option: {0}")]
    Option(String),

    #[error("Bad branch specification: {0}")]
    Branch(String),

    #[error("Branch is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Branches overlap: {0} and {1}")]
    Overlap(PathBuf, PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mount failed: {0}")]
    Mount(String),
}
