//! Error taxonomy shared by the point cloud, registration, run configuration
//! and result parsing stages.
//!
//! A point cloud that ends up with zero points is deliberately absent here:
//! building returns [`crate::builder::BuildOutcome::Empty`] instead. Only a
//! bulk sweep, which cannot proceed without every cloud, turns it into
//! [`DvcError::EmptyPointCloud`].

use crate::volume_loader::VolumeLoaderError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DvcError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Range reversed: minimum {min} is greater than maximum {max}")]
    RangeReversed { min: u32, max: u32 },

    #[error("Dimension mismatch: expected {expected:?}, got {actual:?}")]
    DimensionMismatch {
        expected: [usize; 3],
        actual: [usize; 3],
    },

    #[error("No points in the point cloud for subvolume size {subvol_size}")]
    EmptyPointCloud { subvol_size: u32 },

    #[error("Operation not allowed while {0}")]
    InvalidState(String),

    #[error("Could not parse {path}, line {line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Solver error: {0}")]
    Solver(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Volume error: {0}")]
    Volume(#[from] VolumeLoaderError),
}

pub type Result<T> = std::result::Result<T, DvcError>;

impl DvcError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        DvcError::Configuration(msg.into())
    }

    pub(crate) fn parse(path: impl Into<PathBuf>, line: usize, msg: impl Into<String>) -> Self {
        DvcError::Parse {
            path: path.into(),
            line,
            message: msg.into(),
        }
    }
}
