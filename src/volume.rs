use crate::enums::Orientation;

use image::ImageBuffer;
use image::Luma;
use ndarray::Array3;
use ndarray::ArrayView2;
use ndarray::s;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Placement of a voxel grid in world space. All triples are ordered
/// `(x, y, z)`, while the backing arrays are indexed `(z, y, x)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VolumeGeometry {
    pub dimensions: [usize; 3],
    pub spacing: [f64; 3],
    pub origin: [f64; 3],
}

impl VolumeGeometry {
    pub fn new(dimensions: [usize; 3], spacing: [f64; 3], origin: [f64; 3]) -> Self {
        Self {
            dimensions,
            spacing,
            origin,
        }
    }

    /// Unit spacing, origin at zero.
    pub fn with_dimensions(dimensions: [usize; 3]) -> Self {
        Self::new(dimensions, [1.0; 3], [0.0; 3])
    }

    /// Array shape `(z, y, x)` matching these dimensions
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.dimensions[2], self.dimensions[1], self.dimensions[0])
    }

    pub fn world_to_continuous_index(&self, point: [f64; 3]) -> [f64; 3] {
        std::array::from_fn(|axis| (point[axis] - self.origin[axis]) / self.spacing[axis])
    }

    /// Nearest voxel to a world coordinate, `None` when it falls outside the grid.
    pub fn world_to_index(&self, point: [f64; 3]) -> Option<[usize; 3]> {
        let continuous = self.world_to_continuous_index(point);
        let mut index = [0usize; 3];
        for axis in 0..3 {
            let rounded = continuous[axis].round();
            if !rounded.is_finite() || rounded < 0.0 || rounded >= self.dimensions[axis] as f64 {
                return None;
            }
            index[axis] = rounded as usize;
        }
        Some(index)
    }

    pub fn index_to_world(&self, index: [f64; 3]) -> [f64; 3] {
        std::array::from_fn(|axis| self.origin[axis] + index[axis] * self.spacing[axis])
    }

    /// World position of the middle of the voxel grid.
    pub fn center(&self) -> [f64; 3] {
        std::array::from_fn(|axis| {
            let last = self.dimensions[axis].saturating_sub(1) as f64;
            self.origin[axis] + 0.5 * last * self.spacing[axis]
        })
    }

    /// Whether a world coordinate has a nearest voxel, the same rule as
    /// [`VolumeGeometry::world_to_index`].
    pub fn contains_world(&self, point: [f64; 3]) -> bool {
        self.world_to_index(point).is_some()
    }

    /// Geometry of the same volume shown down-sampled by `factors` per axis,
    /// as a viewer does for large data sets.
    pub fn resampled(&self, factors: [f64; 3]) -> Self {
        Self {
            dimensions: std::array::from_fn(|axis| {
                (self.dimensions[axis] as f64 / factors[axis]).ceil() as usize
            }),
            spacing: std::array::from_fn(|axis| self.spacing[axis] * factors[axis]),
            origin: self.origin,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Volume<A = u16> {
    pub data: Array3<A>,
    pub geometry: VolumeGeometry,
}

impl<A> Volume<A> {
    /// Wrap an array indexed `(z, y, x)`; the dimensions are taken from it.
    pub fn new(data: Array3<A>, spacing: [f64; 3], origin: [f64; 3]) -> Self {
        let (depth, height, width) = data.dim();
        Self {
            data,
            geometry: VolumeGeometry::new([width, height, depth], spacing, origin),
        }
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<A> {
        &self.data
    }

    /// Get a mutable reference to the underlying data
    pub fn data_mut(&mut self) -> &mut Array3<A> {
        &mut self.data
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    fn is_valid_index(&self, index: usize, orientation: &Orientation) -> bool {
        index < self.geometry.dimensions[orientation.through_plane_axis()]
    }
}

impl<A: Copy> Volume<A> {
    /// Voxel value at an `(x, y, z)` index.
    pub fn value_at_index(&self, [x, y, z]: [usize; 3]) -> Option<A> {
        self.data.get((z, y, x)).copied()
    }

    /// Value of the voxel nearest to a world coordinate.
    pub fn value_at_world(&self, point: [f64; 3]) -> Option<A> {
        self.geometry
            .world_to_index(point)
            .and_then(|index| self.value_at_index(index))
    }

    pub fn get_slice_from_axis(
        &self,
        index: usize,
        orientation: &Orientation,
    ) -> Option<ArrayView2<'_, A>> {
        if !self.is_valid_index(index, orientation) {
            return None;
        }
        let slice_result = match orientation {
            Orientation::XY => self.data().slice(s![index, .., ..]),
            Orientation::XZ => self.data().slice(s![.., index, ..]),
            Orientation::YZ => self.data().slice(s![.., .., index]),
        };
        Some(slice_result)
    }

    /// Copy out the inclusive `(x, y, z)` index extent `[[x0, x1], [y0, y1], [z0, z1]]`.
    /// The origin moves so world coordinates are preserved.
    pub fn crop(&self, extent: [[usize; 2]; 3]) -> Volume<A> {
        let [[x0, x1], [y0, y1], [z0, z1]] = extent;
        let data = self
            .data
            .slice(s![z0..=z1, y0..=y1, x0..=x1])
            .to_owned();
        let origin = self
            .geometry
            .index_to_world([x0 as f64, y0 as f64, z0 as f64]);
        Volume::new(data, self.geometry.spacing, origin)
    }
}

impl<A> Volume<A>
where
    A: Copy + Into<f64> + Send + Sync,
{
    /// Render one slice as an 8-bit grey image, stretched between the
    /// slice's own minimum and maximum.
    pub fn get_image_from_axis(
        &self,
        index: usize,
        orientation: Orientation,
    ) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let slice = self.get_slice_from_axis(index, &orientation)?;
        Self::slice_to_image(&slice)
    }

    fn slice_to_image(slice: &ArrayView2<'_, A>) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let (height, width) = slice.dim();
        let (min, max) = slice.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |acc, &v| {
            let v: f64 = v.into();
            (acc.0.min(v), acc.1.max(v))
        });
        let pixel_data: Vec<u8> = slice
            .into_par_iter()
            .map(|&v| Self::normalize_to_u8(v.into(), min, max))
            .collect();
        ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
    }

    #[inline]
    fn normalize_to_u8(value: f64, min: f64, max: f64) -> u8 {
        if max <= min {
            return 0;
        }
        (((value - min) / (max - min)) * 255.0).clamp(0.0, 255.0) as u8
    }
}
