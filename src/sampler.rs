//! Regular lattices of candidate subvolume centres.

use crate::enums::{Dimensionality, Orientation, SubvolumeShape};
use crate::error::{DvcError, Result};
use crate::subvolume::SubvolumeSpec;
use crate::volume::VolumeGeometry;

/// The slice a 2D point cloud is laid out on. Ignored for 3D clouds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SamplingPlane {
    pub orientation: Orientation,
    pub slice_index: usize,
}

impl SamplingPlane {
    pub fn new(orientation: Orientation, slice_index: usize) -> Self {
        Self {
            orientation,
            slice_index,
        }
    }
}

pub struct PointCloudSampler<'a> {
    spec: &'a SubvolumeSpec,
}

impl<'a> PointCloudSampler<'a> {
    pub fn new(spec: &'a SubvolumeSpec) -> Self {
        Self { spec }
    }

    /// Lattice step in voxels along `x, y, z`.
    pub fn step(&self) -> [f64; 3] {
        let size = self.spec.size() as f64;
        self.spec.overlap().map(|overlap| match self.spec.shape() {
            SubvolumeShape::Cube => size * (1.0 - overlap),
            SubvolumeShape::Sphere => sphere_spacing(size / 2.0, overlap),
        })
    }

    /// World coordinates of every lattice point, x fastest. No masking is
    /// applied here.
    ///
    /// # Errors
    ///
    /// Returns error if the subvolume spec is invalid or a 2D plane's slice
    /// lies outside the volume
    pub fn sample(&self, geometry: &VolumeGeometry, plane: SamplingPlane) -> Result<Vec<[f64; 3]>> {
        self.spec.validate()?;
        let step = self.step();
        if step.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(DvcError::configuration(format!(
                "overlap {:?} leaves no room between subvolumes",
                self.spec.overlap()
            )));
        }

        let start = self.spec.size() as f64 / 2.0;
        let mut positions: [Vec<f64>; 3] = std::array::from_fn(|axis| {
            lattice(start, step[axis], geometry.dimensions[axis])
        });

        if self.spec.dimensionality() == Dimensionality::Two {
            let through = plane.orientation.through_plane_axis();
            if plane.slice_index >= geometry.dimensions[through] {
                return Err(DvcError::configuration(format!(
                    "slice {} is outside the volume ({} slices along {:?})",
                    plane.slice_index, geometry.dimensions[through], plane.orientation
                )));
            }
            positions[through] = vec![plane.slice_index as f64];
        }

        let [xs, ys, zs] = &positions;
        let mut points = Vec::with_capacity(xs.len() * ys.len() * zs.len());
        for &z in zs {
            for &y in ys {
                for &x in xs {
                    points.push(geometry.index_to_world([x, y, z]));
                }
            }
        }
        log::debug!(
            "Sampled {} {} lattice points with step {step:?}",
            points.len(),
            self.spec.shape()
        );
        Ok(points)
    }
}

fn lattice(start: f64, step: f64, dimension: usize) -> Vec<f64> {
    let last = dimension as f64 - 1.0;
    let mut values = Vec::new();
    let mut p = start;
    while p <= last {
        values.push(p);
        p += step;
    }
    values
}

/// Distance between two spheres of `radius` whose shared volume is
/// `overlap` of one sphere. The lens fraction
/// `(2r - d)^2 (d + 4r) / (16 r^3)` falls from 1 at `d = 0` to 0 at `d = 2r`.
fn sphere_spacing(radius: f64, overlap: f64) -> f64 {
    let fraction = |d: f64| (2.0 * radius - d).powi(2) * (d + 4.0 * radius) / (16.0 * radius.powi(3));
    let (mut lo, mut hi) = (0.0, 2.0 * radius);
    for _ in 0..64 {
        let mid = 0.5 * (lo + hi);
        if fraction(mid) > overlap {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}
