//! Rigid registration of the correlate volume onto the reference volume.
//!
//! The engine holds an integer voxel translation `T`. Voxel `i` of the
//! reference is compared with voxel `i - T` of the correlate, and the solver
//! is handed `-T` as its rigid offset. Translations are stored `(x, y, z)`.

pub mod automatic;

pub use automatic::{
    AutomaticRegistration, AutomaticRegistrationConfig, AutomaticRegistrationResult,
    RegistrationOutcome,
};

use crate::enums::{Orientation, TranslationKey};
use crate::error::{DvcError, Result};
use crate::volume::Volume;

use ndarray::Array3;
use std::sync::Arc;

pub const DEFAULT_BOX_SIZE: u32 = 50;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RegistrationState {
    /// No volumes loaded.
    #[default]
    Idle,
    SelectingPoint0,
    Ready,
    Registering,
    Confirmed,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DifferenceStatistics {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
}

impl DifferenceStatistics {
    /// `None` for an empty region.
    pub fn from_values(values: &[f32]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = values.iter().map(|&v| v as f64).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len();
        let median = if n % 2 == 0 {
            0.5 * (sorted[n / 2 - 1] + sorted[n / 2])
        } else {
            sorted[n / 2]
        };
        Some(Self {
            min: sorted[0],
            max: sorted[n - 1],
            mean: sorted.iter().sum::<f64>() / n as f64,
            median,
        })
    }
}

/// `correlate[i - T] - reference[i]` over the registration box.
#[derive(Clone, Debug)]
pub struct DifferenceImage {
    pub volume: Volume<f32>,
    pub statistics: Option<DifferenceStatistics>,
}

/// In-plane axes moved by the stepping keys: `(first, second)`.
fn key_axes(orientation: Orientation) -> (usize, usize) {
    match orientation {
        Orientation::XY => (0, 1),
        Orientation::XZ => (0, 2),
        Orientation::YZ => (2, 1),
    }
}

#[derive(Debug)]
pub struct RegistrationEngine {
    state: RegistrationState,
    reference: Option<Arc<Volume<u16>>>,
    correlate: Option<Arc<Volume<u16>>>,
    point0: Option<[f64; 3]>,
    box_size: u32,
    translation: [i64; 3],
    difference: Option<DifferenceImage>,
}

impl Default for RegistrationEngine {
    fn default() -> Self {
        Self {
            state: RegistrationState::Idle,
            reference: None,
            correlate: None,
            point0: None,
            box_size: DEFAULT_BOX_SIZE,
            translation: [0; 3],
            difference: None,
        }
    }
}

impl RegistrationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    pub fn point0(&self) -> Option<[f64; 3]> {
        self.point0
    }

    pub fn box_size(&self) -> u32 {
        self.box_size
    }

    pub fn translation(&self) -> [i64; 3] {
        self.translation
    }

    pub fn difference(&self) -> Option<&DifferenceImage> {
        self.difference.as_ref()
    }

    pub fn reference(&self) -> Option<&Arc<Volume<u16>>> {
        self.reference.as_ref()
    }

    /// The rigid offset for the solver, `-T` with one decimal.
    pub fn rigid_trans(&self) -> String {
        let [x, y, z] = self.translation.map(|t| -t as f64);
        format!("{x:.1} {y:.1} {z:.1}")
    }

    /// Load both volumes. Any previous translation is discarded; point0 is
    /// kept when it still lies inside the reference.
    pub fn load_volumes(&mut self, reference: Arc<Volume<u16>>, correlate: Arc<Volume<u16>>) -> Result<()> {
        let expected = reference.geometry.dimensions;
        let actual = correlate.geometry.dimensions;
        if expected != actual {
            return Err(DvcError::DimensionMismatch { expected, actual });
        }
        self.point0 = self
            .point0
            .filter(|p| reference.geometry.world_to_index(*p).is_some());
        self.reference = Some(reference);
        self.correlate = Some(correlate);
        self.translation = [0; 3];
        self.difference = None;
        self.state = if self.point0.is_some() {
            RegistrationState::Ready
        } else {
            RegistrationState::SelectingPoint0
        };
        Ok(())
    }

    pub fn set_point0(&mut self, point0: [f64; 3]) -> Result<()> {
        match self.state {
            RegistrationState::Idle | RegistrationState::Registering => {
                return Err(self.invalid("setting point0"));
            }
            _ => {}
        }
        let reference = self.loaded_reference()?;
        if reference.geometry.world_to_index(point0).is_none() {
            return Err(DvcError::configuration(format!(
                "point0 {point0:?} is outside the reference volume"
            )));
        }
        self.point0 = Some(point0);
        self.state = RegistrationState::Ready;
        log::info!("Point0 set to {point0:?}");
        Ok(())
    }

    pub fn set_box_size(&mut self, box_size: u32) -> Result<()> {
        if box_size == 0 {
            return Err(DvcError::configuration("registration box size must be positive"));
        }
        self.box_size = box_size;
        if self.state == RegistrationState::Registering {
            self.refresh_difference()?;
        }
        Ok(())
    }

    pub fn start_registration(&mut self) -> Result<&DifferenceImage> {
        match self.state {
            RegistrationState::Ready | RegistrationState::Confirmed => {}
            _ => return Err(self.invalid("starting registration")),
        }
        self.state = RegistrationState::Registering;
        self.refresh_difference()
    }

    /// Move the correlate by one voxel along an in-plane axis of the viewed slice.
    pub fn translate(&mut self, key: TranslationKey, orientation: Orientation) -> Result<&DifferenceImage> {
        if self.state != RegistrationState::Registering {
            return Err(self.invalid("translating"));
        }
        let (first, second) = key_axes(orientation);
        let (axis, step) = match key {
            TranslationKey::Up => (second, 1),
            TranslationKey::Down => (second, -1),
            TranslationKey::Left => (first, -1),
            TranslationKey::Right => (first, 1),
        };
        let limit = self.box_size as i64;
        self.translation[axis] = (self.translation[axis] + step).clamp(-limit, limit);
        self.refresh_difference()
    }

    /// Replace the translation, e.g. with a typed value or an automatic result.
    pub fn set_translation(&mut self, translation: [i64; 3]) -> Result<()> {
        match self.state {
            RegistrationState::Ready | RegistrationState::Registering | RegistrationState::Confirmed => {}
            _ => return Err(self.invalid("setting the translation")),
        }
        self.translation = translation;
        if self.state == RegistrationState::Registering {
            self.refresh_difference()?;
        }
        Ok(())
    }

    pub fn reset(&mut self) -> Result<()> {
        self.set_translation([0; 3])
    }

    pub fn confirm(&mut self) -> Result<[i64; 3]> {
        if self.state != RegistrationState::Registering {
            return Err(self.invalid("confirming"));
        }
        self.state = RegistrationState::Confirmed;
        log::info!("Registration confirmed, rigid_trans {}", self.rigid_trans());
        Ok(self.translation)
    }

    /// Give up on registering: zero translation, taken as confirmed.
    pub fn cancel(&mut self) -> Result<()> {
        match self.state {
            RegistrationState::Ready | RegistrationState::Registering | RegistrationState::Confirmed => {}
            _ => return Err(self.invalid("cancelling")),
        }
        self.translation = [0; 3];
        self.difference = None;
        self.state = RegistrationState::Confirmed;
        Ok(())
    }

    /// Run [`AutomaticRegistration`] on a crop of twice the box size around
    /// point0 and adopt the result. Leaves the engine registering so the
    /// result can be inspected before confirming.
    pub fn run_automatic(&mut self, config: AutomaticRegistrationConfig) -> Result<AutomaticRegistrationResult> {
        match self.state {
            RegistrationState::Ready | RegistrationState::Registering | RegistrationState::Confirmed => {}
            _ => return Err(self.invalid("running automatic registration")),
        }
        let (reference, correlate, p) = self.loaded()?;
        let dims = reference.geometry.dimensions;
        let half_box = (self.box_size / 2) as usize;
        let full_box = self.box_size as usize;

        let extent: [[usize; 2]; 3] =
            std::array::from_fn(|a| [p[a].saturating_sub(full_box), (p[a] + full_box).min(dims[a] - 1)]);
        let window_xyz: [[usize; 2]; 3] = std::array::from_fn(|a| {
            let lo = extent[a][0];
            [p[a].saturating_sub(half_box) - lo, (p[a] + half_box).min(dims[a]) - lo]
        });
        let local_xyz: [usize; 3] = std::array::from_fn(|a| p[a] - extent[a][0]);

        let im0 = reference.crop(extent).data.mapv(f64::from);
        let im1 = correlate.crop(extent).data.mapv(f64::from);
        let result = AutomaticRegistration::new(config).run(
            im0.view(),
            im1.view(),
            flip(local_xyz),
            flip(window_xyz),
        )?;

        let [sz, sy, sx] = result.shift;
        self.translation = [-sx, -sy, -sz];
        self.state = RegistrationState::Registering;
        self.refresh_difference()?;
        log::info!(
            "Automatic registration {:?} after {} iterations, rigid_trans {}",
            result.outcome,
            result.iterations,
            self.rigid_trans()
        );
        Ok(result)
    }

    fn invalid(&self, action: &str) -> DvcError {
        DvcError::InvalidState(format!("{action} in state {:?}", self.state))
    }

    fn loaded_reference(&self) -> Result<&Arc<Volume<u16>>> {
        self.reference
            .as_ref()
            .ok_or_else(|| DvcError::InvalidState("no reference volume loaded".into()))
    }

    fn loaded(&self) -> Result<(Arc<Volume<u16>>, Arc<Volume<u16>>, [usize; 3])> {
        let reference = self.loaded_reference()?.clone();
        let correlate = self
            .correlate
            .clone()
            .ok_or_else(|| DvcError::InvalidState("no correlate volume loaded".into()))?;
        let point0 = self
            .point0
            .ok_or_else(|| DvcError::InvalidState("point0 not selected".into()))?;
        let index = reference
            .geometry
            .world_to_index(point0)
            .ok_or_else(|| DvcError::configuration("point0 is outside the reference volume"))?;
        Ok((reference, correlate, index))
    }

    fn refresh_difference(&mut self) -> Result<&DifferenceImage> {
        let (reference, correlate, p) = self.loaded()?;
        let image = difference_image(&reference, &correlate, p, self.box_size, self.translation);
        log::debug!(
            "Difference over {:?} voxels with T {:?}: {:?}",
            image.volume.geometry.dimensions,
            self.translation,
            image.statistics
        );
        Ok(&*self.difference.insert(image))
    }
}

fn flip<T: Copy>([x, y, z]: [T; 3]) -> [T; 3] {
    [z, y, x]
}

/// `correlate[i - T] - reference[i]` for every `i` in the box
/// `[p - box/2, p + box/2]` whose partner `i - T` is inside the volume.
pub fn difference_image(
    reference: &Volume<u16>,
    correlate: &Volume<u16>,
    point: [usize; 3],
    box_size: u32,
    translation: [i64; 3],
) -> DifferenceImage {
    let dims = reference.geometry.dimensions;
    let half = (box_size / 2) as i64;
    let range: [(i64, i64); 3] = std::array::from_fn(|a| {
        let p = point[a] as i64;
        let last = dims[a] as i64 - 1;
        let t = translation[a];
        let lo = (p - half).max(0).max(t);
        let hi = (p + half).min(last).min(last + t);
        (lo, hi)
    });
    let len = range.map(|(lo, hi)| (hi - lo + 1).max(0) as usize);
    let start = range.map(|(lo, _)| lo);

    let data = Array3::from_shape_fn((len[2], len[1], len[0]), |(z, y, x)| {
        let i = [start[0] + x as i64, start[1] + y as i64, start[2] + z as i64];
        let j = std::array::from_fn::<usize, 3, _>(|a| (i[a] - translation[a]) as usize);
        let i = i.map(|v| v as usize);
        let reference = reference.data[(i[2], i[1], i[0])] as f32;
        let correlate = correlate.data[(j[2], j[1], j[0])] as f32;
        correlate - reference
    });
    let origin = reference
        .geometry
        .index_to_world(start.map(|v| v as f64));
    let statistics = DifferenceStatistics::from_values(data.as_slice().unwrap_or(&[]));
    DifferenceImage {
        volume: Volume::new(data, reference.geometry.spacing, origin),
        statistics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(shift: [i64; 3]) -> Arc<Volume<u16>> {
        let data = Array3::from_shape_fn((20, 20, 20), |(z, y, x)| {
            let [x, y, z] = [x as i64 - shift[0], y as i64 - shift[1], z as i64 - shift[2]];
            (1000 + 7 * x + 31 * y + 101 * z) as u16
        });
        Arc::new(Volume::new(data, [1.0; 3], [0.0; 3]))
    }

    fn ready_engine(correlate_shift: [i64; 3]) -> RegistrationEngine {
        let mut engine = RegistrationEngine::new();
        engine.load_volumes(ramp([0; 3]), ramp(correlate_shift)).unwrap();
        engine.set_point0([10.0, 10.0, 10.0]).unwrap();
        engine.set_box_size(8).unwrap();
        engine
    }

    #[test]
    fn state_machine_guards() {
        let mut engine = RegistrationEngine::new();
        assert_eq!(engine.state(), RegistrationState::Idle);
        assert!(matches!(engine.set_point0([1.0; 3]), Err(DvcError::InvalidState(_))));
        assert!(engine.start_registration().is_err());

        engine.load_volumes(ramp([0; 3]), ramp([0; 3])).unwrap();
        assert_eq!(engine.state(), RegistrationState::SelectingPoint0);
        assert!(matches!(engine.set_point0([50.0, 1.0, 1.0]), Err(DvcError::Configuration(_))));
        engine.set_point0([10.0, 10.0, 10.0]).unwrap();
        assert_eq!(engine.state(), RegistrationState::Ready);
        assert!(engine.translate(TranslationKey::Up, Orientation::XY).is_err());

        engine.start_registration().unwrap();
        assert!(engine.set_point0([5.0; 3]).is_err());
        engine.confirm().unwrap();
        assert_eq!(engine.state(), RegistrationState::Confirmed);
    }

    #[test]
    fn volumes_must_match() {
        let mut engine = RegistrationEngine::new();
        let small = Arc::new(Volume::new(Array3::<u16>::zeros((2, 2, 2)), [1.0; 3], [0.0; 3]));
        assert!(matches!(
            engine.load_volumes(ramp([0; 3]), small),
            Err(DvcError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn keys_follow_the_viewed_plane() {
        let mut engine = ready_engine([0; 3]);
        engine.start_registration().unwrap();
        engine.translate(TranslationKey::Right, Orientation::XY).unwrap();
        engine.translate(TranslationKey::Up, Orientation::XY).unwrap();
        assert_eq!(engine.translation(), [1, 1, 0]);
        engine.translate(TranslationKey::Down, Orientation::XZ).unwrap();
        assert_eq!(engine.translation(), [1, 1, -1]);
        engine.translate(TranslationKey::Left, Orientation::YZ).unwrap();
        assert_eq!(engine.translation(), [1, 1, -2]);
        engine.translate(TranslationKey::Up, Orientation::YZ).unwrap();
        assert_eq!(engine.translation(), [1, 2, -2]);
    }

    #[test]
    fn steps_are_clamped_to_the_box() {
        let mut engine = ready_engine([0; 3]);
        engine.set_box_size(2).unwrap();
        engine.start_registration().unwrap();
        for _ in 0..5 {
            engine.translate(TranslationKey::Left, Orientation::XY).unwrap();
        }
        assert_eq!(engine.translation(), [-2, 0, 0]);
    }

    #[test]
    fn rigid_trans_is_negated_translation() {
        let mut engine = ready_engine([0; 3]);
        engine.set_translation([3, -2, 0]).unwrap();
        assert_eq!(engine.rigid_trans(), "-3.0 2.0 0.0");
    }

    #[test]
    fn difference_vanishes_at_the_true_offset() {
        let mut engine = ready_engine([2, -1, 1]);
        let before = engine.start_registration().unwrap().statistics.unwrap();
        assert!(before.max.abs() > 0.0);

        engine.set_translation([-2, 1, -1]).unwrap();
        let stats = engine.difference().unwrap().statistics.unwrap();
        assert_eq!((stats.min, stats.max, stats.mean, stats.median), (0.0, 0.0, 0.0, 0.0));
        assert_eq!(engine.rigid_trans(), "2.0 -1.0 1.0");
    }

    #[test]
    fn difference_region_shrinks_with_translation() {
        let reference = ramp([0; 3]);
        let image = difference_image(&reference, &reference, [1, 10, 10], 4, [0; 3]);
        assert_eq!(image.volume.geometry.dimensions, [4, 5, 5]);
        let shifted = difference_image(&reference, &reference, [1, 10, 10], 4, [2, 0, 0]);
        assert_eq!(shifted.volume.geometry.dimensions, [2, 5, 5]);
        assert_eq!(shifted.volume.geometry.origin, [2.0, 8.0, 8.0]);

        let none = difference_image(&reference, &reference, [1, 10, 10], 4, [19, 0, 0]);
        assert!(none.statistics.is_none());
    }

    #[test]
    fn automatic_result_becomes_the_translation() {
        let mut engine = ready_engine([0; 3]);
        let result = engine.run_automatic(AutomaticRegistrationConfig::default()).unwrap();
        assert_eq!(result.shift, [0, 0, 0]);
        assert_eq!(engine.state(), RegistrationState::Registering);
        assert_eq!(engine.rigid_trans(), "0.0 0.0 0.0");
    }

    #[test]
    fn median_of_even_count() {
        let stats = DifferenceStatistics::from_values(&[4.0, -1.0, 3.0, 0.0]).unwrap();
        assert_eq!(stats.median, 1.5);
        assert_eq!(stats.min, -1.0);
        assert_eq!(stats.max, 4.0);
        assert_eq!(stats.mean, 1.5);
    }
}
