//! One working session: the two images, the mask drawn on the reference,
//! the current point cloud and the registration around point0.
//!
//! Components talk to each other only through [`SessionContext`], which
//! owns all of them, instead of reaching into a shared application object.

use crate::builder::{BuildOutcome, MaskedPointCloudBuilder};
use crate::enums::Orientation;
use crate::error::{DvcError, Result};
use crate::mask::MaskModel;
use crate::pointcloud::PointCloud;
use crate::registration::{
    AutomaticRegistrationConfig, AutomaticRegistrationResult, DEFAULT_BOX_SIZE, RegistrationEngine,
};
use crate::run_config::{ImageInputs, PointCloudSource, RunConfig, RunConfigBuilder, RunMode, SolverParameters};
use crate::sampler::SamplingPlane;
use crate::subvolume::SubvolumeSpec;
use crate::volume::{Volume, VolumeGeometry};
use crate::volume_loader::{VolumeInfo, VolumeLoader};

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Parameters a user edits during a session, stored as JSON between runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub subvolume: SubvolumeSpec,
    pub orientation: Orientation,
    /// Active slice along the orientation's through-plane axis.
    pub slice_index: usize,
    pub subvolume_points: u32,
    pub solver: SolverParameters,
    pub box_size: u32,
    /// In world coordinates.
    pub point0: Option<[f64; 3]>,
    pub omp_threads: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            subvolume: SubvolumeSpec::default(),
            orientation: Orientation::default(),
            slice_index: 0,
            subvolume_points: 10000,
            solver: SolverParameters::default(),
            box_size: DEFAULT_BOX_SIZE,
            point0: None,
            omp_threads: crate::runner::DEFAULT_OMP_THREADS,
        }
    }
}

impl SessionSettings {
    /// # Errors
    ///
    /// Returns error if the file cannot be read or holds invalid values
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.subvolume.validate()?;
        if self.box_size == 0 {
            return Err(DvcError::configuration("registration box size must be positive"));
        }
        if self.subvolume_points == 0 {
            return Err(DvcError::configuration("points per subvolume must be positive"));
        }
        Ok(())
    }

    pub fn sampling_plane(&self) -> SamplingPlane {
        SamplingPlane::new(self.orientation, self.slice_index)
    }
}

/// An image of the session together with the file the solver will read.
#[derive(Clone, Debug)]
pub struct SessionImage {
    pub path: PathBuf,
    pub volume: Arc<Volume<u16>>,
    pub info: VolumeInfo,
}

impl SessionImage {
    pub fn load_metaimage(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let loaded = VolumeLoader::load_metaimage(&path)?;
        log::info!("Loaded {} with dimensions {:?}", path.display(), loaded.volume.geometry.dimensions);
        Ok(Self {
            path,
            volume: Arc::new(loaded.volume),
            info: loaded.info,
        })
    }

    pub fn load_raw(path: impl Into<PathBuf>, dimensions: [usize; 3], info: VolumeInfo) -> Result<Self> {
        let path = path.into();
        let loaded = VolumeLoader::load_raw(&path, dimensions, info)?;
        Ok(Self {
            path,
            volume: Arc::new(loaded.volume),
            info: loaded.info,
        })
    }

    /// Load by extension: `.mha`/`.mhd` are MetaImage, anything else is raw
    /// and needs its layout.
    pub fn load(path: impl Into<PathBuf>, raw_layout: Option<([usize; 3], VolumeInfo)>) -> Result<Self> {
        let path = path.into();
        let is_metaimage = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("mha") || ext.eq_ignore_ascii_case("mhd"));
        match (is_metaimage, raw_layout) {
            (true, _) => Self::load_metaimage(path),
            (false, Some((dimensions, info))) => Self::load_raw(path, dimensions, info),
            (false, None) => Err(DvcError::configuration(format!(
                "{} is not a MetaImage; its dimensions and layout are required",
                path.display()
            ))),
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionContext {
    settings: SessionSettings,
    reference: Option<SessionImage>,
    correlate: Option<SessionImage>,
    mask: Option<MaskModel>,
    point_cloud: Option<PointCloud>,
    registration: RegistrationEngine,
    builder: MaskedPointCloudBuilder,
}

impl SessionContext {
    pub fn new(settings: SessionSettings) -> Result<Self> {
        settings.validate()?;
        let mut registration = RegistrationEngine::new();
        registration.set_box_size(settings.box_size)?;
        Ok(Self {
            settings,
            registration,
            ..Self::default()
        })
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Replace the settings. Point0 and the box size are passed on to the
    /// registration engine when images are loaded. Nothing changes when
    /// either is rejected.
    pub fn update_settings(&mut self, settings: SessionSettings) -> Result<()> {
        settings.validate()?;
        if let (Some(point0), Some(_)) = (settings.point0, &self.reference) {
            self.registration.set_point0(point0)?;
        }
        self.registration.set_box_size(settings.box_size)?;
        self.settings = settings;
        Ok(())
    }

    /// Load the image pair. A mask of other dimensions and the current
    /// point cloud are dropped.
    ///
    /// # Errors
    ///
    /// Returns error if the images differ in dimensions
    pub fn load_images(&mut self, reference: SessionImage, correlate: SessionImage) -> Result<()> {
        self.registration
            .load_volumes(reference.volume.clone(), correlate.volume.clone())?;
        let geometry = reference.volume.geometry;
        if self
            .mask
            .as_ref()
            .is_some_and(|mask| mask.mask().geometry.dimensions != geometry.dimensions)
        {
            log::info!("Dropping mask that does not fit the new images");
            self.mask = None;
        }
        self.point_cloud = None;
        self.reference = Some(reference);
        self.correlate = Some(correlate);
        if let Some(point0) = self.settings.point0 {
            if geometry.contains_world(point0) {
                self.registration.set_point0(point0)?;
            } else {
                log::warn!("Point0 {point0:?} lies outside the new images and was cleared");
                self.settings.point0 = None;
            }
        }
        Ok(())
    }

    pub fn reference(&self) -> Option<&SessionImage> {
        self.reference.as_ref()
    }

    pub fn correlate(&self) -> Option<&SessionImage> {
        self.correlate.as_ref()
    }

    pub fn reference_geometry(&self) -> Result<VolumeGeometry> {
        self.reference
            .as_ref()
            .map(|image| image.volume.geometry)
            .ok_or_else(|| DvcError::InvalidState("no reference image loaded".into()))
    }

    pub fn set_point0(&mut self, point0: [f64; 3]) -> Result<()> {
        self.registration.set_point0(point0)?;
        self.settings.point0 = Some(point0);
        Ok(())
    }

    /// Voxel index of point0, optionally in a viewer showing the reference
    /// down-sampled by `factors`.
    pub fn point0_image_coords(&self, factors: Option<[f64; 3]>) -> Option<[usize; 3]> {
        let point0 = self.settings.point0?;
        let geometry = self.reference_geometry().ok()?;
        match factors {
            Some(factors) => geometry.resampled(factors).world_to_index(point0),
            None => geometry.world_to_index(point0),
        }
    }

    pub fn mask(&self) -> Option<&MaskModel> {
        self.mask.as_ref()
    }

    /// Adopt a mask; it must match the reference image.
    pub fn set_mask(&mut self, mask: MaskModel) -> Result<()> {
        let geometry = self.reference_geometry()?;
        let actual = mask.mask().geometry.dimensions;
        if actual != geometry.dimensions {
            return Err(DvcError::DimensionMismatch {
                expected: geometry.dimensions,
                actual,
            });
        }
        self.mask = Some(mask);
        Ok(())
    }

    pub fn load_mask(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let geometry = self.reference_geometry()?;
        self.mask = Some(MaskModel::load(path, &geometry)?);
        Ok(())
    }

    pub fn save_mask(&self, path: impl AsRef<Path>) -> Result<()> {
        self.mask
            .as_ref()
            .ok_or_else(|| DvcError::InvalidState("no mask to save".into()))?
            .save(path)
    }

    /// Paint a lasso on the active slice and extrude it `below` and `above`
    /// slices. Creates the mask on first use.
    pub fn extend_mask(&mut self, polygon: &[[f64; 2]], below: usize, above: usize, accumulate: bool) -> Result<()> {
        let geometry = self.reference_geometry()?;
        let SamplingPlane {
            orientation,
            slice_index,
        } = self.settings.sampling_plane();
        self.mask
            .get_or_insert_with(|| MaskModel::new(&geometry))
            .extend(polygon, slice_index, orientation, below, above, accumulate)
    }

    pub fn point_cloud(&self) -> Option<&PointCloud> {
        self.point_cloud.as_ref()
    }

    pub fn load_pointcloud(&mut self, path: impl AsRef<Path>) -> Result<&PointCloud> {
        let cloud = PointCloud::load(path)?;
        Ok(self.point_cloud.insert(cloud))
    }

    /// Build a point cloud over the mask with the current settings and keep
    /// it when it has points.
    pub fn build_pointcloud(&mut self) -> Result<BuildOutcome> {
        let mask = self
            .mask
            .as_ref()
            .ok_or_else(|| DvcError::InvalidState("no mask to build a point cloud in".into()))?;
        let outcome = self.builder.build(
            mask,
            &self.settings.subvolume,
            self.settings.point0,
            self.settings.sampling_plane(),
        )?;
        match &outcome {
            BuildOutcome::Built(cloud) => {
                log::info!("Built point cloud with {} points", cloud.len());
                self.point_cloud = Some(cloud.clone());
            }
            BuildOutcome::Empty => log::warn!("No points of the lattice lie inside the mask"),
        }
        Ok(outcome)
    }

    pub fn registration(&self) -> &RegistrationEngine {
        &self.registration
    }

    pub fn registration_mut(&mut self) -> &mut RegistrationEngine {
        &mut self.registration
    }

    /// Find the rigid offset around point0 and accept it.
    pub fn register_automatically(
        &mut self,
        config: AutomaticRegistrationConfig,
    ) -> Result<AutomaticRegistrationResult> {
        let result = self.registration.run_automatic(config)?;
        self.registration.confirm()?;
        Ok(result)
    }

    pub fn image_inputs(&self) -> Result<ImageInputs> {
        let reference = self
            .reference
            .as_ref()
            .ok_or_else(|| DvcError::InvalidState("no reference image loaded".into()))?;
        let correlate = self
            .correlate
            .as_ref()
            .ok_or_else(|| DvcError::InvalidState("no correlate image loaded".into()))?;
        Ok(ImageInputs {
            reference_file: reference.path.clone(),
            correlate_file: correlate.path.clone(),
            info: reference.info,
            dims: reference.volume.geometry.dimensions,
        })
    }

    /// Write a run configuration for the current session.
    ///
    /// With [`PointCloudSource::Generated`] a single run uses the session's
    /// point cloud, built first if there is none, while a bulk run builds one
    /// cloud per swept size from the mask.
    pub fn create_run_config(
        &mut self,
        run_folder: impl Into<PathBuf>,
        mode: &RunMode,
        source: &PointCloudSource,
    ) -> Result<RunConfig> {
        let geometry = self.reference_geometry()?;
        if matches!((mode, source), (RunMode::Single { .. }, PointCloudSource::Generated))
            && self.point_cloud.is_none()
        {
            if let BuildOutcome::Empty = self.build_pointcloud()? {
                return Err(DvcError::EmptyPointCloud {
                    subvol_size: self.settings.subvolume.size(),
                });
            }
        }

        let mut config = RunConfigBuilder::new(run_folder, self.image_inputs()?, self.settings.subvolume)
            .solver(self.settings.solver)
            .rigid_trans(self.registration.rigid_trans());
        if let Some(point0) = self.settings.point0 {
            if let Some(index) = geometry.world_to_index(point0) {
                config = config.point0(index, point0);
            }
        }

        let Self {
            settings,
            mask,
            point_cloud,
            builder,
            ..
        } = self;
        let plane = settings.sampling_plane();
        config.build(mode, source, |spec| match (mode, point_cloud.as_ref()) {
            (RunMode::Single { .. }, Some(cloud)) => Ok(BuildOutcome::Built(cloud.clone())),
            _ => {
                let mask = mask
                    .as_ref()
                    .ok_or_else(|| DvcError::InvalidState("no mask to build point clouds in".into()))?;
                builder.build(mask, spec, settings.point0, plane)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::{Dimensionality, Endianness, SubvolumeShape};
    use crate::registration::RegistrationState;
    use crate::run_config::{RUN_CONFIG_FILE, SweepRange};
    use ndarray::Array3;

    fn image(path: &str, shift: usize) -> SessionImage {
        let data = Array3::from_shape_fn((24, 24, 24), |(z, y, x)| {
            let x = x as f64 - 12.0 - shift as f64;
            let d = x * x + (y as f64 - 12.0).powi(2) + (z as f64 - 12.0).powi(2);
            (100.0 + 1000.0 * (-d / 10.0).exp()) as u16
        });
        SessionImage {
            path: path.into(),
            volume: Arc::new(Volume::new(data, [1.0; 3], [0.0; 3])),
            info: VolumeInfo {
                bit_depth: 16,
                endianness: Endianness::Little,
                header_length: 0,
            },
        }
    }

    fn session() -> SessionContext {
        let settings = SessionSettings {
            subvolume: SubvolumeSpec::new(SubvolumeShape::Cube, 6, [0.0; 3], Dimensionality::Three).unwrap(),
            orientation: Orientation::XY,
            slice_index: 12,
            box_size: 10,
            ..SessionSettings::default()
        };
        let mut session = SessionContext::new(settings).unwrap();
        session
            .load_images(image("ref.raw", 0), image("cor.raw", 0))
            .unwrap();
        session
    }

    fn square() -> Vec<[f64; 2]> {
        vec![[2.0, 2.0], [21.0, 2.0], [21.0, 21.0], [2.0, 21.0]]
    }

    #[test]
    fn settings_round_trip_and_validate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = SessionSettings {
            point0: Some([1.0, 2.0, 3.0]),
            ..SessionSettings::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(SessionSettings::load(&path).unwrap(), settings);

        fs::write(&path, r#"{"box_size": 0}"#).unwrap();
        assert!(matches!(SessionSettings::load(&path), Err(DvcError::Configuration(_))));
    }

    #[test]
    fn point0_in_full_and_down_sampled_images() {
        let mut session = session();
        assert_eq!(session.point0_image_coords(None), None);
        session.set_point0([10.0, 11.0, 12.0]).unwrap();
        assert_eq!(session.registration().state(), RegistrationState::Ready);
        assert_eq!(session.point0_image_coords(None), Some([10, 11, 12]));
        assert_eq!(session.point0_image_coords(Some([2.0, 2.0, 2.0])), Some([5, 6, 6]));
        assert!(session.set_point0([100.0, 0.0, 0.0]).is_err());
    }

    #[test]
    fn mask_then_point_cloud_anchored_at_point0() {
        let mut session = session();
        assert!(matches!(session.build_pointcloud(), Err(DvcError::InvalidState(_))));

        session.set_point0([10.0, 11.0, 12.0]).unwrap();
        session.extend_mask(&square(), 12, 12, false).unwrap();
        let cloud = session.build_pointcloud().unwrap().into_cloud().unwrap();
        assert_eq!(cloud.first().unwrap().position, [10.0, 11.0, 12.0]);
        assert_eq!(session.point_cloud(), Some(&cloud));
    }

    #[test]
    fn updated_settings_reach_the_registration() {
        let mut session = session();
        let settings = SessionSettings {
            box_size: 8,
            point0: Some([4.0, 5.0, 6.0]),
            ..session.settings().clone()
        };
        session.update_settings(settings).unwrap();
        assert_eq!(session.registration().box_size(), 8);
        assert_eq!(session.registration().point0(), Some([4.0, 5.0, 6.0]));

        let invalid = SessionSettings {
            box_size: 0,
            ..session.settings().clone()
        };
        assert!(session.update_settings(invalid).is_err());
        assert_eq!(session.settings().box_size, 8);

        let outside = SessionSettings {
            box_size: 12,
            point0: Some([40.0, 5.0, 6.0]),
            ..session.settings().clone()
        };
        assert!(matches!(session.update_settings(outside), Err(DvcError::Configuration(_))));
        assert_eq!(session.settings().box_size, 8);
        assert_eq!(session.settings().point0, Some([4.0, 5.0, 6.0]));
        assert_eq!(session.registration().box_size(), 8);
        assert_eq!(session.registration().point0(), Some([4.0, 5.0, 6.0]));
    }

    #[test]
    fn point0_half_a_voxel_past_the_edge_survives_reloading() {
        let mut session = session();
        session.set_point0([23.4, 0.0, -0.4]).unwrap();
        session
            .load_images(image("ref.raw", 0), image("cor.raw", 0))
            .unwrap();
        assert_eq!(session.settings().point0, Some([23.4, 0.0, -0.4]));
        assert_eq!(session.registration().point0(), Some([23.4, 0.0, -0.4]));
        assert_eq!(session.point0_image_coords(None), Some([23, 0, 0]));
    }

    #[test]
    fn mask_of_other_dimensions_is_rejected() {
        let mut session = session();
        let other = MaskModel::new(&VolumeGeometry::with_dimensions([8, 8, 8]));
        assert!(matches!(
            session.set_mask(other),
            Err(DvcError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn automatic_registration_feeds_the_run_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session();
        session
            .load_images(image("ref.raw", 0), image("cor.raw", 2))
            .unwrap();
        session.set_point0([12.0, 12.0, 12.0]).unwrap();
        session
            .register_automatically(AutomaticRegistrationConfig::default())
            .unwrap();
        assert_eq!(session.registration().state(), RegistrationState::Confirmed);
        assert_eq!(session.registration().rigid_trans(), "2.0 0.0 0.0");

        session.extend_mask(&square(), 12, 12, false).unwrap();
        let config = session
            .create_run_config(
                dir.path().join("run"),
                &RunMode::Single { subvolume_points: 500 },
                &PointCloudSource::Generated,
            )
            .unwrap();
        assert_eq!(config.rigid_trans, "2.0 0.0 0.0");
        assert_eq!(config.point0, Some([12, 12, 12]));
        assert_eq!(config.dims, [24, 24, 24]);
        assert!(dir.path().join("run").join(RUN_CONFIG_FILE).exists());
        assert!(dir.path().join("run").join("_6.roi").exists());
    }

    #[test]
    fn bulk_run_without_mask_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session();
        let err = session
            .create_run_config(
                dir.path().join("run"),
                &RunMode::Bulk {
                    subvolume_sizes: SweepRange::new(6, 10, 2),
                    subvolume_points: SweepRange::single(100),
                },
                &PointCloudSource::Generated,
            )
            .unwrap_err();
        assert!(matches!(err, DvcError::InvalidState(_)));
        assert!(!dir.path().join("run").exists());
    }
}
