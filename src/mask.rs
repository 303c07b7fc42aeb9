//! Binary masks painted on the reference volume and the erosion that keeps
//! subvolumes inside them.
//!
//! A mask is a `Volume<u8>` holding only 0 and 1, with the same geometry as
//! the reference volume. Masks are painted one lasso at a time: the polygon
//! is filled on one slice and that slice is copied over a range of
//! neighbouring slices. Copying overwrites whatever those slices held; the
//! only way earlier strokes survive is the optional union with the
//! previously stored mask in [`MaskModel::extend`].

use crate::enums::{Dimensionality, Orientation, SubvolumeShape};
use crate::error::{DvcError, Result};
use crate::subvolume::SubvolumeSpec;
use crate::volume::{Volume, VolumeGeometry};
use crate::volume_loader::VolumeLoader;

use ndarray::{Array3, ArrayView1, ArrayViewMut1, Axis, Zip};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

pub type Mask = Volume<u8>;

static NEXT_MASK_VERSION: AtomicU64 = AtomicU64::new(1);

fn next_version() -> u64 {
    NEXT_MASK_VERSION.fetch_add(1, Ordering::Relaxed)
}

/// Array axis (`z, y, x` order) holding the slices of an orientation.
fn slice_axis(orientation: Orientation) -> Axis {
    Axis(2 - orientation.through_plane_axis())
}

pub fn empty_mask(geometry: &VolumeGeometry) -> Mask {
    Volume {
        data: Array3::zeros(geometry.shape()),
        geometry: *geometry,
    }
}

/// Fill a polygon on a single slice. `polygon` holds world coordinates of
/// the two in-plane axes (see [`Orientation::in_plane_axes`]); a voxel is
/// set when its centre lies inside the polygon.
pub fn rasterize_lasso(
    polygon: &[[f64; 2]],
    slice_index: usize,
    orientation: Orientation,
    geometry: &VolumeGeometry,
) -> Result<Mask> {
    if polygon.len() < 3 {
        return Err(DvcError::configuration(format!(
            "a lasso needs at least 3 vertices, got {}",
            polygon.len()
        )));
    }
    let through = orientation.through_plane_axis();
    if slice_index >= geometry.dimensions[through] {
        return Err(DvcError::configuration(format!(
            "slice {slice_index} is outside the volume ({} slices)",
            geometry.dimensions[through]
        )));
    }

    let [a, b] = orientation.in_plane_axes();
    let vertices: Vec<[f64; 2]> = polygon
        .iter()
        .map(|&[u, v]| {
            [
                (u - geometry.origin[a]) / geometry.spacing[a],
                (v - geometry.origin[b]) / geometry.spacing[b],
            ]
        })
        .collect();

    let range = |axis_values: &mut dyn Iterator<Item = f64>, dim: usize| {
        let (lo, hi) = axis_values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
        let lo = lo.ceil().max(0.0) as usize;
        let hi = (hi.floor().min(dim as f64 - 1.0)).max(-1.0);
        (lo, hi as isize)
    };
    let (a_lo, a_hi) = range(&mut vertices.iter().map(|p| p[0]), geometry.dimensions[a]);
    let (b_lo, b_hi) = range(&mut vertices.iter().map(|p| p[1]), geometry.dimensions[b]);

    let mut mask = empty_mask(geometry);
    for i in a_lo as isize..=a_hi {
        for j in b_lo as isize..=b_hi {
            if point_in_polygon([i as f64, j as f64], &vertices) {
                let mut index = [0usize; 3];
                index[a] = i as usize;
                index[b] = j as usize;
                index[through] = slice_index;
                let [x, y, z] = index;
                mask.data[(z, y, x)] = 1;
            }
        }
    }
    Ok(mask)
}

/// Even-odd rule.
fn point_in_polygon([px, py]: [f64; 2], vertices: &[[f64; 2]]) -> bool {
    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let [xi, yi] = vertices[i];
        let [xj, yj] = vertices[j];
        if (yi > py) != (yj > py) && px < (xj - xi) * (py - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Copy slice `from_slice` onto every slice of
/// `[from_slice - range_below, from_slice + range_above]`, clamped to the
/// volume. Slices in range are overwritten, not merged.
pub fn extrude(
    mask: &Mask,
    from_slice: usize,
    range_below: usize,
    range_above: usize,
    orientation: Orientation,
) -> Result<Mask> {
    let axis = slice_axis(orientation);
    let slices = mask.data.len_of(axis);
    if from_slice >= slices {
        return Err(DvcError::configuration(format!(
            "slice {from_slice} is outside the volume ({slices} slices)"
        )));
    }
    let lo = from_slice.saturating_sub(range_below);
    let hi = (from_slice + range_above).min(slices - 1);

    let mut extruded = mask.clone();
    let source = mask.data.index_axis(axis, from_slice);
    for slice in lo..=hi {
        extruded.data.index_axis_mut(axis, slice).assign(&source);
    }
    Ok(extruded)
}

/// Voxelwise union, thresholded back to `{0, 1}`.
pub fn union(a: &Mask, b: &Mask) -> Result<Mask> {
    if a.geometry.dimensions != b.geometry.dimensions {
        return Err(DvcError::DimensionMismatch {
            expected: a.geometry.dimensions,
            actual: b.geometry.dimensions,
        });
    }
    let mut merged = a.clone();
    Zip::from(&mut merged.data)
        .and(&b.data)
        .for_each(|m, &other| *m = ((*m as u16 + other as u16) >= 1) as u8);
    Ok(merged)
}

/// Structuring element size `(kx, ky, kz)` used to erode the mask for a
/// given subvolume.
///
/// In-plane entries start at the subvolume size; the through-plane entry is
/// 1 for 2D point clouds. Each entry is then scaled by the erosion
/// multiplier and padded by half a voxel: `ceil(k * m + 0.5)` for cubes and
/// `ceil(2 * k * m + 0.5)` for spheres.
pub fn erosion_kernel_size(spec: &SubvolumeSpec, orientation: Orientation) -> [usize; 3] {
    let size = spec.size() as f64;
    let mut raw = [size; 3];
    if spec.dimensionality() == Dimensionality::Two {
        raw[orientation.through_plane_axis()] = 1.0;
    }
    let multiplier = spec.erosion_multiplier();
    raw.map(|k| match spec.shape() {
        SubvolumeShape::Cube => (k * multiplier + 0.5).ceil() as usize,
        SubvolumeShape::Sphere => (2.0 * k * multiplier + 0.5).ceil() as usize,
    })
}

/// Binary erosion with a box of `kernel` voxels (`x, y, z`). A voxel stays 1
/// only if every voxel within `k / 2` of it along each axis is 1; voxels
/// outside the volume count as 0.
pub fn erode(mask: &Mask, kernel: [usize; 3]) -> Mask {
    let mut current = mask.data.mapv(|v| (v != 0) as u8);
    for (xyz_axis, &k) in kernel.iter().enumerate() {
        let half = k / 2;
        if half == 0 {
            continue;
        }
        let axis = Axis(2 - xyz_axis);
        let mut next = Array3::<u8>::zeros(current.raw_dim());
        Zip::from(next.lanes_mut(axis))
            .and(current.lanes(axis))
            .par_for_each(|out, lane| erode_lane(lane, out, half));
        current = next;
    }
    Volume {
        data: current,
        geometry: mask.geometry,
    }
}

fn erode_lane(input: ArrayView1<'_, u8>, mut output: ArrayViewMut1<'_, u8>, half: usize) {
    let n = input.len();
    let mut background = Vec::with_capacity(n + 1);
    background.push(0usize);
    for &v in input.iter() {
        let last = background[background.len() - 1];
        background.push(last + (v == 0) as usize);
    }
    for i in 0..n {
        let inside = i >= half && i + half < n;
        output[i] = (inside && background[i + half + 1] == background[i - half]) as u8;
    }
}

/// The session's current mask plus a version number that changes on every
/// mutation. Versions are unique across all models, so a cache keyed on
/// them can never confuse two masks.
#[derive(Clone, Debug)]
pub struct MaskModel {
    mask: Mask,
    version: u64,
}

impl MaskModel {
    pub fn new(geometry: &VolumeGeometry) -> Self {
        Self {
            mask: empty_mask(geometry),
            version: next_version(),
        }
    }

    /// Adopt a mask for a reference volume, thresholding any non-zero voxel to 1.
    pub fn from_mask(reference: &VolumeGeometry, mask: Mask) -> Result<Self> {
        if reference.dimensions != mask.geometry.dimensions {
            return Err(DvcError::DimensionMismatch {
                expected: reference.dimensions,
                actual: mask.geometry.dimensions,
            });
        }
        Ok(Self {
            mask: Volume {
                data: mask.data.mapv(|v| (v != 0) as u8),
                geometry: *reference,
            },
            version: next_version(),
        })
    }

    pub fn load(path: impl AsRef<Path>, reference: &VolumeGeometry) -> Result<Self> {
        let loaded = VolumeLoader::load_metaimage(path)?;
        let data = loaded.volume.data.mapv(|v| (v != 0) as u8);
        Self::from_mask(reference, Volume::new(data, reference.spacing, reference.origin))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        VolumeLoader::save_mask(&self.mask, path)?;
        Ok(())
    }

    pub fn mask(&self) -> &Mask {
        &self.mask
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.mask.data.iter().all(|&v| v == 0)
    }

    /// Paint a lasso and extrude it. With `accumulate` the result is merged
    /// with the mask held so far, otherwise it replaces it.
    pub fn extend(
        &mut self,
        polygon: &[[f64; 2]],
        slice_index: usize,
        orientation: Orientation,
        range_below: usize,
        range_above: usize,
        accumulate: bool,
    ) -> Result<()> {
        let painted = rasterize_lasso(polygon, slice_index, orientation, &self.mask.geometry)?;
        let extruded = extrude(&painted, slice_index, range_below, range_above, orientation)?;
        self.mask = if accumulate {
            union(&extruded, &self.mask)?
        } else {
            extruded
        };
        self.version = next_version();
        log::info!(
            "Mask extended on {orientation:?} slice {slice_index} (-{range_below}/+{range_above}), version {}",
            self.version
        );
        Ok(())
    }

    pub fn clear(&mut self) {
        self.mask.data.fill(0);
        self.version = next_version();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::Dimensionality;

    fn square() -> Vec<[f64; 2]> {
        vec![[1.5, 1.5], [5.5, 1.5], [5.5, 4.5], [1.5, 4.5]]
    }

    #[test]
    fn lasso_fills_one_slice() {
        let geometry = VolumeGeometry::with_dimensions([8, 6, 5]);
        let mask = rasterize_lasso(&square(), 2, Orientation::XY, &geometry).unwrap();

        assert_eq!(mask.data.iter().map(|&v| v as usize).sum::<usize>(), 4 * 3);
        assert_eq!(mask.value_at_index([2, 2, 2]), Some(1));
        assert_eq!(mask.value_at_index([5, 4, 2]), Some(1));
        assert_eq!(mask.value_at_index([1, 2, 2]), Some(0));
        assert_eq!(mask.value_at_index([2, 2, 1]), Some(0));
    }

    #[test]
    fn lasso_on_yz_plane_uses_y_and_z() {
        let geometry = VolumeGeometry::with_dimensions([4, 8, 6]);
        let mask = rasterize_lasso(&square(), 3, Orientation::YZ, &geometry).unwrap();
        assert_eq!(mask.value_at_index([3, 2, 2]), Some(1));
        assert_eq!(mask.value_at_index([3, 5, 4]), Some(1));
        assert_eq!(mask.value_at_index([2, 2, 2]), Some(0));
    }

    #[test]
    fn extrude_is_clamped_and_overwrites() {
        let geometry = VolumeGeometry::with_dimensions([8, 6, 5]);
        let mut mask = rasterize_lasso(&square(), 1, Orientation::XY, &geometry).unwrap();
        mask.data[(3, 0, 0)] = 1;

        let extruded = extrude(&mask, 1, 4, 2, Orientation::XY).unwrap();
        for z in 0..=3 {
            assert_eq!(extruded.value_at_index([2, 2, z]), Some(1));
        }
        assert_eq!(extruded.value_at_index([2, 2, 4]), Some(0));
        // slice 3 was in range, so its own content is replaced
        assert_eq!(extruded.value_at_index([0, 0, 3]), Some(0));
    }

    #[test]
    fn union_thresholds() {
        let geometry = VolumeGeometry::with_dimensions([3, 3, 3]);
        let mut a = empty_mask(&geometry);
        let mut b = empty_mask(&geometry);
        a.data[(0, 0, 0)] = 1;
        b.data[(0, 0, 0)] = 1;
        b.data[(1, 1, 1)] = 1;
        let merged = union(&a, &b).unwrap();
        assert_eq!(merged.data[(0, 0, 0)], 1);
        assert_eq!(merged.data[(1, 1, 1)], 1);
        assert_eq!(merged.data.iter().map(|&v| v as usize).sum::<usize>(), 2);

        let other = empty_mask(&VolumeGeometry::with_dimensions([3, 3, 4]));
        assert!(matches!(union(&a, &other), Err(DvcError::DimensionMismatch { .. })));
    }

    #[test]
    fn kernel_sizes() {
        let cube = SubvolumeSpec::new(SubvolumeShape::Cube, 30, [0.2; 3], Dimensionality::Three)
            .unwrap()
            .with_erosion(1.0)
            .unwrap();
        assert_eq!(erosion_kernel_size(&cube, Orientation::XY), [31, 31, 31]);

        let sphere = SubvolumeSpec::new(SubvolumeShape::Sphere, 30, [0.2; 3], Dimensionality::Two)
            .unwrap()
            .with_erosion(1.0)
            .unwrap();
        assert_eq!(erosion_kernel_size(&sphere, Orientation::XY), [61, 61, 3]);
        assert_eq!(erosion_kernel_size(&sphere, Orientation::XZ), [61, 3, 61]);

        let flat_cube = SubvolumeSpec::new(SubvolumeShape::Cube, 10, [0.2; 3], Dimensionality::Two)
            .unwrap()
            .with_erosion(0.5)
            .unwrap();
        assert_eq!(erosion_kernel_size(&flat_cube, Orientation::YZ), [1, 6, 6]);
    }

    #[test]
    fn erosion_of_empty_mask_is_empty() {
        let mask = empty_mask(&VolumeGeometry::with_dimensions([6, 6, 6]));
        let eroded = erode(&mask, [3, 3, 3]);
        assert!(eroded.data.iter().all(|&v| v == 0));
    }

    #[test]
    fn erosion_shrinks_a_block() {
        let geometry = VolumeGeometry::with_dimensions([12, 12, 12]);
        let mut mask = empty_mask(&geometry);
        mask.data
            .slice_mut(ndarray::s![2..10, 2..10, 2..10])
            .fill(1);
        let eroded = erode(&mask, [5, 5, 1]);
        assert_eq!(eroded.value_at_index([4, 4, 2]), Some(1));
        assert_eq!(eroded.value_at_index([7, 7, 9]), Some(1));
        assert_eq!(eroded.value_at_index([3, 4, 4]), Some(0));
        assert_eq!(eroded.value_at_index([4, 8, 4]), Some(0));
    }

    #[test]
    fn extend_accumulates_only_when_asked() {
        let geometry = VolumeGeometry::with_dimensions([8, 6, 5]);
        let mut model = MaskModel::new(&geometry);
        let start = model.version();

        model.extend(&square(), 0, Orientation::XY, 0, 0, false).unwrap();
        assert!(model.version() > start);
        let other = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];

        model.extend(&other, 4, Orientation::XY, 0, 0, true).unwrap();
        assert_eq!(model.mask().value_at_index([2, 2, 0]), Some(1));

        model.extend(&other, 4, Orientation::XY, 0, 0, false).unwrap();
        assert_eq!(model.mask().value_at_index([2, 2, 0]), Some(0));

        model.clear();
        assert!(model.is_empty());
    }

    #[test]
    fn mask_for_wrong_volume_is_rejected() {
        let reference = VolumeGeometry::with_dimensions([4, 4, 4]);
        let mask = empty_mask(&VolumeGeometry::with_dimensions([4, 4, 5]));
        assert!(matches!(
            MaskModel::from_mask(&reference, mask),
            Err(DvcError::DimensionMismatch { .. })
        ));
    }
}
