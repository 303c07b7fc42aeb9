use serde::{Deserialize, Serialize};
use std::fmt;

/// Viewing plane of a 2D slice. The through-plane axis is the one the
/// slice index counts along.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Orientation {
    /// Looking down the Z axis.
    #[default]
    XY,
    /// Looking down the Y axis.
    XZ,
    /// Looking down the X axis.
    YZ,
}

impl Orientation {
    /// Index (x = 0, y = 1, z = 2) of the axis perpendicular to the plane
    pub fn through_plane_axis(&self) -> usize {
        match self {
            Orientation::XY => 2,
            Orientation::XZ => 1,
            Orientation::YZ => 0,
        }
    }

    /// The two in-plane axes, first and second.
    pub fn in_plane_axes(&self) -> [usize; 2] {
        match self {
            Orientation::XY => [0, 1],
            Orientation::XZ => [0, 2],
            Orientation::YZ => [1, 2],
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubvolumeShape {
    #[default]
    Cube,
    Sphere,
}

impl fmt::Display for SubvolumeShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubvolumeShape::Cube => f.write_str("cube"),
            SubvolumeShape::Sphere => f.write_str("sphere"),
        }
    }
}

/// Whether subvolumes are laid out over the whole volume or only on the
/// active slice.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dimensionality {
    Two,
    #[default]
    Three,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl fmt::Display for Endianness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endianness::Little => f.write_str("little"),
            Endianness::Big => f.write_str("big"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectiveFunction {
    Sad,
    Ssd,
    Zssd,
    Nssd,
    #[default]
    Znssd,
}

impl fmt::Display for ObjectiveFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectiveFunction::Sad => "sad",
            ObjectiveFunction::Ssd => "ssd",
            ObjectiveFunction::Zssd => "zssd",
            ObjectiveFunction::Nssd => "nssd",
            ObjectiveFunction::Znssd => "znssd",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpolationType {
    Trilinear,
    #[default]
    Tricubic,
}

impl fmt::Display for InterpolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpolationType::Trilinear => f.write_str("trilinear"),
            InterpolationType::Tricubic => f.write_str("tricubic"),
        }
    }
}

/// Degrees of freedom of the solver's search.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SearchDof {
    Three,
    #[default]
    Six,
    Twelve,
}

impl From<SearchDof> for u8 {
    fn from(dof: SearchDof) -> Self {
        match dof {
            SearchDof::Three => 3,
            SearchDof::Six => 6,
            SearchDof::Twelve => 12,
        }
    }
}

impl TryFrom<u8> for SearchDof {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            3 => Ok(SearchDof::Three),
            6 => Ok(SearchDof::Six),
            12 => Ok(SearchDof::Twelve),
            other => Err(format!("degrees of freedom must be 3, 6 or 12, got {other}")),
        }
    }
}

/// Keys used to nudge the correlate volume during manual registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranslationKey {
    /// +1 along the second in-plane axis.
    Up,
    /// -1 along the second in-plane axis.
    Down,
    /// -1 along the first in-plane axis.
    Left,
    /// +1 along the first in-plane axis.
    Right,
}
