//! # DVC-volume library
//!
//! This crate prepares Digital Volume Correlation (DVC) runs for an
//! external solver: it turns a reference and a correlate volume into the
//! point clouds, rigid offset and control files the solver reads, and reads
//! back what the solver writes.
//!
//! A session goes through these steps:
//!  - Draw a mask on slices of the reference volume and extrude it
//!  - Lay a lattice of subvolume centres over the mask, optionally eroding
//!    the mask so no subvolume sticks out of it
//!  - Pick point0, the solver's starting point, and register the correlate
//!    volume around it, by hand or automatically
//!  - Write a run configuration, for a single run or a sweep over subvolume
//!    sizes and points per subvolume
//!  - Launch the solver jobs and collect their displacement results
//!
//!  Volumes are read from MetaImage (`.mha`/`.mhd`) or raw files and are
//!  held as `ndarray` arrays indexed `(z, y, x)`. Coordinates handed to or
//!  returned from the public API are `(x, y, z)`. Erosion, masking and slice
//!  rendering run in parallel using rayon.
//!
//! # Examples
//!
//! ## Building a point cloud inside a mask
//!
//! Load the images and a mask, anchor the cloud at point0 and write it as a
//! `.roi` file.
//!
//! ```no_run
//! # use dvc_volume::session::{SessionContext, SessionImage, SessionSettings};
//! let mut session = SessionContext::new(SessionSettings::default())
//!     .expect("default settings should be valid");
//! let reference = SessionImage::load("reference.mha", None).expect("should have loaded reference");
//! let correlate = SessionImage::load("correlate.mha", None).expect("should have loaded correlate");
//! session.load_images(reference, correlate).expect("images should match");
//! session.set_point0([120.0, 80.0, 40.0]).expect("point0 should be inside the volume");
//! session.load_mask("mask.mha").expect("should have loaded the mask");
//! let cloud = session
//!     .build_pointcloud()
//!     .expect("should have built a point cloud")
//!     .into_cloud()
//!     .expect("mask should contain points");
//! cloud.save("pointcloud.roi").expect("should have written the point cloud");
//! ```

pub mod builder;
pub mod enums;
pub mod error;
pub mod mask;
pub mod pointcloud;
pub mod registration;
pub mod results;
pub mod run_config;
pub mod runner;
pub mod sampler;
pub mod session;
pub mod subvolume;
pub mod transform;
pub mod volume;
pub mod volume_loader;

pub use error::{DvcError, Result};
