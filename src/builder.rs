//! Masked point cloud construction.
//!
//! Sampling, rotation, masking and id assignment in one pass. The point
//! with id 1 is where the solver starts and what it measures the rigid
//! offset at, so when point0 is inside the mask the cloud is shifted until a
//! lattice point coincides with it and that point is written first.

use crate::enums::Dimensionality;
use crate::error::Result;
use crate::mask::{Mask, MaskModel, erode, erosion_kernel_size};
use crate::pointcloud::{PointCloud, PointRecord};
use crate::sampler::{PointCloudSampler, SamplingPlane};
use crate::subvolume::SubvolumeSpec;
use crate::transform::PointCloudTransformer;
use crate::volume::VolumeGeometry;

use rayon::prelude::*;

/// Squared distance under which a point is taken to be point0.
const COINCIDENT_SQUARED_DISTANCE: f64 = 0.001;

#[derive(Clone, Debug, PartialEq)]
pub enum BuildOutcome {
    Built(PointCloud),
    /// No lattice point survived masking.
    Empty,
}

impl BuildOutcome {
    pub fn point_count(&self) -> usize {
        match self {
            BuildOutcome::Built(cloud) => cloud.len(),
            BuildOutcome::Empty => 0,
        }
    }

    pub fn into_cloud(self) -> Option<PointCloud> {
        match self {
            BuildOutcome::Built(cloud) => Some(cloud),
            BuildOutcome::Empty => None,
        }
    }
}

#[derive(Debug)]
struct ErosionCache {
    mask_version: u64,
    kernel: [usize; 3],
    eroded: Mask,
}

/// Builds point clouds over a mask, keeping the last eroded mask around
/// until the mask version or the kernel changes.
#[derive(Debug, Default)]
pub struct MaskedPointCloudBuilder {
    cache: Option<ErosionCache>,
}

impl MaskedPointCloudBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mask eroded for `spec`, computed at most once per mask version
    /// and kernel size.
    pub fn eroded_mask<'a>(
        &'a mut self,
        mask: &'a MaskModel,
        spec: &SubvolumeSpec,
        plane: SamplingPlane,
    ) -> &'a Mask {
        let kernel = erosion_kernel_size(spec, plane.orientation);
        let fresh = matches!(
            &self.cache,
            Some(cache) if cache.mask_version == mask.version() && cache.kernel == kernel
        );
        if fresh {
            log::debug!("Reusing eroded mask (version {}, kernel {kernel:?})", mask.version());
        } else {
            log::info!("Eroding mask version {} with kernel {kernel:?}", mask.version());
            self.cache = Some(ErosionCache {
                mask_version: mask.version(),
                kernel,
                eroded: erode(mask.mask(), kernel),
            });
        }
        match &self.cache {
            Some(cache) => &cache.eroded,
            None => mask.mask(),
        }
    }

    pub fn build(
        &mut self,
        mask: &MaskModel,
        spec: &SubvolumeSpec,
        point0: Option<[f64; 3]>,
        plane: SamplingPlane,
    ) -> Result<BuildOutcome> {
        let geometry = *mask.mask().geometry();
        let mut points = PointCloudSampler::new(spec).sample(&geometry, plane)?;
        PointCloudTransformer::rotate_about_center(&mut points, geometry.center(), spec.rotation());

        let keep_mask = if spec.erode() {
            self.eroded_mask(mask, spec, plane)
        } else {
            mask.mask()
        };
        let sampled = points.len();
        let mut points: Vec<[f64; 3]> = points
            .into_par_iter()
            .filter(|p| keep_mask.value_at_world(*p) == Some(1))
            .collect();
        log::info!("{} of {sampled} sampled points lie inside the mask", points.len());

        if points.is_empty() {
            return Ok(BuildOutcome::Empty);
        }

        let anchored = point0
            .map(|p0| on_sampling_plane(p0, spec, plane, &geometry))
            .filter(|p0| mask.mask().value_at_world(*p0) == Some(1));
        let cloud = match anchored {
            Some(p0) => {
                let anchor = PointCloudTransformer::anchor_to_reference(&mut points, p0).unwrap_or(0);
                let rest = points
                    .iter()
                    .enumerate()
                    .filter(|(i, p)| *i != anchor && geometry.contains_world(**p))
                    .map(|(_, p)| *p);
                let dropped = points.len() - 1 - rest.clone().count();
                if dropped > 0 {
                    log::info!("Dropped {dropped} points moved outside the volume by anchoring");
                }
                PointCloud::from_positions(std::iter::once(points[anchor]).chain(rest))
            }
            None => order_by_coincidence(&points, point0),
        };
        Ok(BuildOutcome::Built(cloud))
    }
}

/// A 2D cloud stays on its slice, so point0 is projected onto that slice
/// before anchoring.
fn on_sampling_plane(
    point0: [f64; 3],
    spec: &SubvolumeSpec,
    plane: SamplingPlane,
    geometry: &VolumeGeometry,
) -> [f64; 3] {
    if spec.dimensionality() != Dimensionality::Two {
        return point0;
    }
    let through = plane.orientation.through_plane_axis();
    let mut projected = point0;
    projected[through] =
        geometry.origin[through] + plane.slice_index as f64 * geometry.spacing[through];
    projected
}

/// Without an anchor, a point practically on point0 still goes first.
fn order_by_coincidence(points: &[[f64; 3]], point0: Option<[f64; 3]>) -> PointCloud {
    let coincident = point0.and_then(|p0| {
        points.iter().position(|p| {
            (0..3).map(|axis| (p[axis] - p0[axis]).powi(2)).sum::<f64>() < COINCIDENT_SQUARED_DISTANCE
        })
    });
    match coincident {
        Some(first) => {
            let ordered = std::iter::once(points[first]).chain(
                points
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != first)
                    .map(|(_, p)| *p),
            );
            PointCloud::from_positions(ordered)
        }
        None => PointCloud::from_records(
            points
                .iter()
                .zip(1..)
                .map(|(&position, id)| PointRecord { id, position })
                .collect(),
        ),
    }
}
