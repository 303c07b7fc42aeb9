use crate::enums::{Dimensionality, SubvolumeShape};
use crate::error::{DvcError, Result};

use serde::{Deserialize, Serialize};

/// Largest overlap accepted between neighbouring subvolumes.
pub const MAX_OVERLAP: f64 = 0.99;

/// Geometry of the subvolume tracked around every point of the cloud.
///
/// `size` is the side length of a cube or the diameter of a sphere, in
/// voxels. Construct through [`SubvolumeSpec::new`], which validates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubvolumeSpec {
    shape: SubvolumeShape,
    size: u32,
    overlap: [f64; 3],
    rotation: [f64; 3],
    dimensionality: Dimensionality,
    erode: bool,
    erosion_multiplier: f64,
}

impl Default for SubvolumeSpec {
    fn default() -> Self {
        Self {
            shape: SubvolumeShape::Cube,
            size: 30,
            overlap: [0.2; 3],
            rotation: [0.0; 3],
            dimensionality: Dimensionality::Three,
            erode: false,
            erosion_multiplier: 1.0,
        }
    }
}

impl SubvolumeSpec {
    pub fn new(
        shape: SubvolumeShape,
        size: u32,
        overlap: [f64; 3],
        dimensionality: Dimensionality,
    ) -> Result<Self> {
        let spec = Self {
            shape,
            size,
            overlap,
            dimensionality,
            ..Self::default()
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Rotation of the lattice in degrees about x, y and z.
    pub fn with_rotation(mut self, rotation: [f64; 3]) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_erosion(mut self, erosion_multiplier: f64) -> Result<Self> {
        if !(erosion_multiplier.is_finite() && erosion_multiplier > 0.0) {
            return Err(DvcError::configuration(format!(
                "erosion multiplier must be positive, got {erosion_multiplier}"
            )));
        }
        self.erode = true;
        self.erosion_multiplier = erosion_multiplier;
        Ok(self)
    }

    pub fn without_erosion(mut self) -> Self {
        self.erode = false;
        self
    }

    /// Same settings with another subvolume size, as used by bulk sweeps.
    pub fn with_size(mut self, size: u32) -> Result<Self> {
        self.size = size;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(DvcError::configuration("subvolume size must be positive"));
        }
        if let Some(bad) = self
            .overlap
            .iter()
            .find(|o| !(o.is_finite() && (0.0..=MAX_OVERLAP).contains(*o)))
        {
            return Err(DvcError::configuration(format!(
                "overlap must be within [0, {MAX_OVERLAP}], got {bad}"
            )));
        }
        Ok(())
    }

    pub fn shape(&self) -> SubvolumeShape {
        self.shape
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn overlap(&self) -> [f64; 3] {
        self.overlap
    }

    pub fn rotation(&self) -> [f64; 3] {
        self.rotation
    }

    pub fn dimensionality(&self) -> Dimensionality {
        self.dimensionality
    }

    pub fn erode(&self) -> bool {
        self.erode
    }

    pub fn erosion_multiplier(&self) -> f64 {
        self.erosion_multiplier
    }
}
