//! Run configurations: everything the solver jobs of one run need, written
//! once as `_run_config.json` in the run folder.
//!
//! A single run uses one point cloud and one number of sampling points per
//! subvolume. A bulk run sweeps both: one point cloud is written per
//! subvolume size, and every cloud is solved with every points-per-subvolume
//! value.

use crate::builder::BuildOutcome;
use crate::enums::{Endianness, InterpolationType, ObjectiveFunction, SearchDof, SubvolumeShape};
use crate::error::{DvcError, Result};
use crate::subvolume::SubvolumeSpec;
use crate::volume_loader::VolumeInfo;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const RUN_CONFIG_FILE: &str = "_run_config.json";

/// `min..=max` in steps of `step`. A zero step means just `min`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepRange {
    pub min: u32,
    pub max: u32,
    pub step: u32,
}

impl SweepRange {
    pub fn new(min: u32, max: u32, step: u32) -> Self {
        Self { min, max, step }
    }

    pub fn single(value: u32) -> Self {
        Self::new(value, value, 0)
    }

    pub fn values(&self) -> Result<Vec<u32>> {
        build_sweep(self.min, self.max, self.step)
    }
}

pub fn build_sweep(min: u32, max: u32, step: u32) -> Result<Vec<u32>> {
    if step == 0 {
        return Ok(vec![min]);
    }
    if min > max {
        return Err(DvcError::RangeReversed { min, max });
    }
    let count = (max - min) / step + 1;
    Ok((0..count).map(|i| min + i * step).collect())
}

/// Solver settings that are not derived from the images or the point cloud.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverParameters {
    /// Points of each cloud the solver processes.
    pub points_to_process: u32,
    /// Largest displacement searched for, in voxels.
    pub disp_max: u32,
    pub dof: SearchDof,
    pub objective: ObjectiveFunction,
    pub interpolation: InterpolationType,
}

impl Default for SolverParameters {
    fn default() -> Self {
        Self {
            points_to_process: 100,
            disp_max: 15,
            dof: SearchDof::default(),
            objective: ObjectiveFunction::default(),
            interpolation: InterpolationType::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RunMode {
    Single { subvolume_points: u32 },
    Bulk {
        subvolume_sizes: SweepRange,
        subvolume_points: SweepRange,
    },
}

/// Where a bulk run's per-size point clouds come from.
#[derive(Clone, Debug, PartialEq)]
pub enum PointCloudSource {
    /// Built for each swept subvolume size.
    Generated,
    /// One existing file reused for every size.
    Loaded(PathBuf),
}

/// The images a run correlates, as the solver will read them.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageInputs {
    pub reference_file: PathBuf,
    pub correlate_file: PathBuf,
    pub info: VolumeInfo,
    pub dims: [usize; 3],
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub points: u32,
    pub subvolume_points: Vec<u32>,
    pub subvolume_sizes: Vec<u32>,
    pub reference_file: PathBuf,
    pub correlate_file: PathBuf,
    pub roi_files: Vec<PathBuf>,
    pub vol_bit_depth: u8,
    pub vol_hdr_lngth: usize,
    pub vol_endian: Endianness,
    pub dims: [usize; 3],
    pub subvol_geom: SubvolumeShape,
    pub subvol_npts: Vec<u32>,
    pub disp_max: u32,
    pub dof: SearchDof,
    pub obj: ObjectiveFunction,
    pub interp_type: InterpolationType,
    pub rigid_trans: String,
    pub run_folder: PathBuf,
    pub point0: Option<[usize; 3]>,
    pub point0_world_coordinate: Option<[f64; 3]>,
}

impl RunConfig {
    pub fn save(&self) -> Result<PathBuf> {
        let path = self.run_folder.join(RUN_CONFIG_FILE);
        let file = fs::File::create(&path)?;
        serde_json::to_writer_pretty(file, self)?;
        log::info!("Wrote run configuration {}", path.display());
        Ok(path)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Number of solver jobs: every point cloud with every points-per-subvolume value.
    pub fn job_count(&self) -> usize {
        self.roi_files.len() * self.subvolume_points.len()
    }
}

pub struct RunConfigBuilder {
    run_folder: PathBuf,
    images: ImageInputs,
    spec: SubvolumeSpec,
    solver: SolverParameters,
    rigid_trans: String,
    point0: Option<([usize; 3], [f64; 3])>,
}

impl RunConfigBuilder {
    pub fn new(run_folder: impl Into<PathBuf>, images: ImageInputs, spec: SubvolumeSpec) -> Self {
        Self {
            run_folder: run_folder.into(),
            images,
            spec,
            solver: SolverParameters::default(),
            rigid_trans: "0.0 0.0 0.0".to_string(),
            point0: None,
        }
    }

    pub fn solver(mut self, solver: SolverParameters) -> Self {
        self.solver = solver;
        self
    }

    /// Offset written for the solver, see [`crate::registration::RegistrationEngine::rigid_trans`].
    pub fn rigid_trans(mut self, rigid_trans: impl Into<String>) -> Self {
        self.rigid_trans = rigid_trans.into();
        self
    }

    pub fn point0(mut self, index: [usize; 3], world: [f64; 3]) -> Self {
        self.point0 = Some((index, world));
        self
    }

    /// Create the run folder, place the point cloud file(s) in it and write
    /// `_run_config.json`.
    ///
    /// `cloud` is the existing point cloud for single runs and for bulk runs
    /// reading [`PointCloudSource::Loaded`]. `build_cloud` is called once per
    /// swept size for [`PointCloudSource::Generated`]; a cloud without points
    /// aborts the whole run and removes its folder.
    ///
    /// # Errors
    ///
    /// Returns error if a sweep range is reversed, the folder already exists,
    /// a point cloud is empty or any file cannot be written
    pub fn build<F>(&self, mode: &RunMode, source: &PointCloudSource, mut build_cloud: F) -> Result<RunConfig>
    where
        F: FnMut(&SubvolumeSpec) -> Result<BuildOutcome>,
    {
        self.spec.validate()?;
        let (sizes, points) = match mode {
            RunMode::Single { subvolume_points } => (vec![self.spec.size()], vec![*subvolume_points]),
            RunMode::Bulk {
                subvolume_sizes,
                subvolume_points,
            } => (subvolume_sizes.values()?, subvolume_points.values()?),
        };
        if sizes.contains(&0) {
            return Err(DvcError::configuration("subvolume sizes must be positive"));
        }

        if let Some(parent) = self.run_folder.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir(&self.run_folder)?;

        let result = self.write_run(&sizes, &points, source, &mut build_cloud);
        if result.is_err() {
            if let Err(err) = fs::remove_dir_all(&self.run_folder) {
                log::warn!("Could not remove {}: {err}", self.run_folder.display());
            }
        }
        result
    }

    fn write_run<F>(
        &self,
        sizes: &[u32],
        points: &[u32],
        source: &PointCloudSource,
        build_cloud: &mut F,
    ) -> Result<RunConfig>
    where
        F: FnMut(&SubvolumeSpec) -> Result<BuildOutcome>,
    {
        let mut roi_files = Vec::with_capacity(sizes.len());
        for &size in sizes {
            let roi_file = self.run_folder.join(format!("_{size}.roi"));
            match source {
                PointCloudSource::Loaded(path) => {
                    fs::copy(path, &roi_file)?;
                }
                PointCloudSource::Generated => {
                    let spec = self.spec.with_size(size)?;
                    match build_cloud(&spec)? {
                        BuildOutcome::Built(cloud) => cloud.save(&roi_file)?,
                        BuildOutcome::Empty => {
                            return Err(DvcError::EmptyPointCloud { subvol_size: size });
                        }
                    }
                }
            }
            roi_files.push(roi_file);
        }

        let vol_bit_depth = match self.images.info.bit_depth {
            8 => 8,
            _ => 16,
        };
        let config = RunConfig {
            points: self.solver.points_to_process,
            subvolume_points: points.to_vec(),
            subvolume_sizes: sizes.to_vec(),
            reference_file: self.images.reference_file.clone(),
            correlate_file: self.images.correlate_file.clone(),
            roi_files,
            vol_bit_depth,
            vol_hdr_lngth: self.images.info.header_length,
            vol_endian: self.images.info.endianness,
            dims: self.images.dims,
            subvol_geom: self.spec.shape(),
            subvol_npts: points.to_vec(),
            disp_max: self.solver.disp_max,
            dof: self.solver.dof,
            obj: self.solver.objective,
            interp_type: self.solver.interpolation,
            rigid_trans: self.rigid_trans.clone(),
            run_folder: self.run_folder.clone(),
            point0: self.point0.map(|(index, _)| index),
            point0_world_coordinate: self.point0.map(|(_, world)| world),
        };
        config.save()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::Dimensionality;
    use crate::pointcloud::PointCloud;

    fn images() -> ImageInputs {
        ImageInputs {
            reference_file: "ref.raw".into(),
            correlate_file: "cor.raw".into(),
            info: VolumeInfo {
                bit_depth: 16,
                endianness: Endianness::Little,
                header_length: 0,
            },
            dims: [64, 64, 32],
        }
    }

    fn spec() -> SubvolumeSpec {
        SubvolumeSpec::new(SubvolumeShape::Sphere, 20, [0.2; 3], Dimensionality::Three).unwrap()
    }

    #[test]
    fn sweeps() {
        assert_eq!(build_sweep(10, 100, 0).unwrap(), vec![10]);
        assert_eq!(build_sweep(10, 100, 30).unwrap(), vec![10, 40, 70, 100]);
        assert_eq!(build_sweep(10, 95, 30).unwrap(), vec![10, 40, 70]);
        assert_eq!(build_sweep(10, 10, 5).unwrap(), vec![10]);
        assert!(matches!(
            build_sweep(100, 10, 10),
            Err(DvcError::RangeReversed { min: 100, max: 10 })
        ));
    }

    #[test]
    fn single_run_copies_the_cloud() {
        let dir = tempfile::tempdir().unwrap();
        let cloud_file = dir.path().join("cloud.roi");
        PointCloud::from_positions([[1.0, 2.0, 3.0]]).save(&cloud_file).unwrap();
        let run_folder = dir.path().join("Results").join("first");

        let config = RunConfigBuilder::new(&run_folder, images(), spec())
            .rigid_trans("-3.0 2.0 0.0")
            .point0([10, 11, 12], [10.0, 11.0, 12.0])
            .build(
                &RunMode::Single { subvolume_points: 5000 },
                &PointCloudSource::Loaded(cloud_file),
                |_| unreachable!(),
            )
            .unwrap();

        assert_eq!(config.roi_files, vec![run_folder.join("_20.roi")]);
        assert!(run_folder.join("_20.roi").exists());
        assert_eq!(config.job_count(), 1);
        let reloaded = RunConfig::load(run_folder.join(RUN_CONFIG_FILE)).unwrap();
        assert_eq!(reloaded, config);
        assert_eq!(reloaded.rigid_trans, "-3.0 2.0 0.0");
    }

    #[test]
    fn bulk_run_builds_one_cloud_per_size() {
        let dir = tempfile::tempdir().unwrap();
        let run_folder = dir.path().join("bulk");
        let mut seen = Vec::new();
        let config = RunConfigBuilder::new(&run_folder, images(), spec())
            .build(
                &RunMode::Bulk {
                    subvolume_sizes: SweepRange::new(10, 30, 10),
                    subvolume_points: SweepRange::new(1000, 3000, 1000),
                },
                &PointCloudSource::Generated,
                |spec| {
                    seen.push(spec.size());
                    Ok(BuildOutcome::Built(PointCloud::from_positions([[0.0; 3]])))
                },
            )
            .unwrap();
        assert_eq!(seen, vec![10, 20, 30]);
        assert_eq!(config.subvolume_sizes, vec![10, 20, 30]);
        assert_eq!(config.subvolume_points, vec![1000, 2000, 3000]);
        assert_eq!(config.job_count(), 9);
        assert!(run_folder.join("_30.roi").exists());
    }

    #[test]
    fn empty_cloud_aborts_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let run_folder = dir.path().join("bulk");
        let err = RunConfigBuilder::new(&run_folder, images(), spec())
            .build(
                &RunMode::Bulk {
                    subvolume_sizes: SweepRange::new(10, 30, 10),
                    subvolume_points: SweepRange::single(1000),
                },
                &PointCloudSource::Generated,
                |spec| {
                    Ok(if spec.size() < 20 {
                        BuildOutcome::Built(PointCloud::from_positions([[0.0; 3]]))
                    } else {
                        BuildOutcome::Empty
                    })
                },
            )
            .unwrap_err();
        assert!(matches!(err, DvcError::EmptyPointCloud { subvol_size: 20 }));
        assert!(!run_folder.exists());
    }

    #[test]
    fn reversed_range_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let run_folder = dir.path().join("bulk");
        let err = RunConfigBuilder::new(&run_folder, images(), spec())
            .build(
                &RunMode::Bulk {
                    subvolume_sizes: SweepRange::new(100, 10, 10),
                    subvolume_points: SweepRange::single(1000),
                },
                &PointCloudSource::Generated,
                |_| Ok(BuildOutcome::Empty),
            )
            .unwrap_err();
        assert!(matches!(err, DvcError::RangeReversed { .. }));
        assert!(!run_folder.exists());
    }
}
