//! Solver jobs: one `dvc_result_<n>/` folder per point cloud and
//! points-per-subvolume pair, each holding the solver's control file and a
//! copy of its point cloud, and the process boundary that runs them one
//! after another.

use crate::error::{DvcError, Result};
use crate::results::{RESULT_FOLDER_PREFIX, ResultsModel, RunResult};
use crate::run_config::RunConfig;

use futures::channel::oneshot;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use web_time::Instant;

pub const JOB_CONFIG_FILE: &str = "dvc_config.txt";
pub const JOB_POINT_CLOUD_FILE: &str = "grid_input.roi";
pub const DEFAULT_OMP_THREADS: usize = 4;

const INPUT_ERROR_PREFIX: &str = "Input Error";

#[derive(Clone, Debug, PartialEq)]
pub struct SolverJob {
    pub index: usize,
    pub folder: PathBuf,
    pub config_file: PathBuf,
    pub point_cloud_file: PathBuf,
    /// Base name the solver appends `.stat` and `.disp` to.
    pub output_base: PathBuf,
    pub subvolume_size: u32,
    pub subvolume_points: u32,
    pub points_to_process: u32,
}

/// Create the folder of every job of `config` and write its files.
///
/// Job `n` pairs point cloud `n / len(subvolume_points)` with
/// points-per-subvolume value `n % len(subvolume_points)`.
///
/// # Errors
///
/// Returns error if the point clouds and subvolume sizes do not pair up, a
/// job folder already exists or a file cannot be written
pub fn prepare_jobs(config: &RunConfig) -> Result<Vec<SolverJob>> {
    if config.roi_files.len() != config.subvolume_sizes.len() {
        return Err(DvcError::configuration(format!(
            "{} point clouds for {} subvolume sizes",
            config.roi_files.len(),
            config.subvolume_sizes.len()
        )));
    }
    if config.subvolume_points.is_empty() {
        return Err(DvcError::configuration("no points-per-subvolume values"));
    }

    let mut jobs = Vec::with_capacity(config.job_count());
    for (roi_index, (roi_file, &subvolume_size)) in
        config.roi_files.iter().zip(&config.subvolume_sizes).enumerate()
    {
        for (subv_index, &subvolume_points) in config.subvolume_points.iter().enumerate() {
            let index = subv_index + roi_index * config.subvolume_points.len();
            let name = format!("{RESULT_FOLDER_PREFIX}{index}");
            let folder = config.run_folder.join(&name);
            fs::create_dir(&folder)?;

            let job = SolverJob {
                index,
                config_file: folder.join(JOB_CONFIG_FILE),
                point_cloud_file: folder.join(JOB_POINT_CLOUD_FILE),
                output_base: folder.join(&name),
                folder,
                subvolume_size,
                subvolume_points,
                points_to_process: config.points,
            };
            fs::copy(roi_file, &job.point_cloud_file)?;
            fs::write(&job.config_file, render_job_config(config, &job))?;
            jobs.push(job);
        }
    }
    log::info!("Prepared {} solver jobs in {}", jobs.len(), config.run_folder.display());
    Ok(jobs)
}

/// The solver's process control file for one job.
pub fn render_job_config(config: &RunConfig, job: &SolverJob) -> String {
    let starting_point = config
        .point0_world_coordinate
        .map(|[x, y, z]| format!("{x} {y} {z}"))
        .unwrap_or_else(|| "0 0 0".to_string());
    let [wide, high, tall] = config.dims;
    let entries: [(&str, String); 26] = [
        ("reference_filename", config.reference_file.display().to_string()),
        ("correlate_filename", config.correlate_file.display().to_string()),
        ("point_cloud_filename", job.point_cloud_file.display().to_string()),
        ("output_filename", job.output_base.display().to_string()),
        ("vol_bit_depth", config.vol_bit_depth.to_string()),
        ("vol_hdr_lngth", config.vol_hdr_lngth.to_string()),
        ("vol_wide", wide.to_string()),
        ("vol_high", high.to_string()),
        ("vol_tall", tall.to_string()),
        ("vol_endian", config.vol_endian.to_string()),
        ("subvol_geom", config.subvol_geom.to_string()),
        ("subvol_size", job.subvolume_size.to_string()),
        ("subvol_npts", job.subvolume_points.to_string()),
        ("subvol_thresh", "off".to_string()),
        ("gray_thresh_min", "27".to_string()),
        ("gray_thresh_max", "127".to_string()),
        ("min_vol_fract", "0.2".to_string()),
        ("disp_max", config.disp_max.to_string()),
        ("num_srch_dof", u8::from(config.dof).to_string()),
        ("obj_function", config.obj.to_string()),
        ("interp_type", config.interp_type.to_string()),
        ("rigid_trans", config.rigid_trans.clone()),
        ("basin_radius", "0.0".to_string()),
        ("subvol_aspect", "1.0 1.0 1.0".to_string()),
        ("num_points_to_process", job.points_to_process.to_string()),
        ("starting_point", starting_point),
    ];

    let mut text = String::from("# dvc process control file\n\n");
    for (key, value) in entries {
        let _ = writeln!(text, "{key}\t{value}");
    }
    text
}

#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Succeeded,
    Failed { code: Option<i32> },
    Cancelled,
    /// The solver rejected its input; holds the line it printed.
    InputError(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEvent {
    /// Zero-based index of the running job.
    pub job: usize,
    pub jobs: usize,
    /// Completed fraction of the running job, `0.0..=1.0`.
    pub fraction: f64,
    pub eta: Option<Duration>,
    pub line: String,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum ProgressLine {
    Points(u32),
    Percent(f64),
}

/// `"<done>/<total> ..."` or `"<percent>[%] ..."`.
fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let token = line.split_whitespace().next()?;
    if let Some((done, _)) = token.split_once('/') {
        return done.parse().ok().map(ProgressLine::Points);
    }
    let percent: f64 = token.strip_suffix('%').unwrap_or(token).parse().ok()?;
    (0.0..=100.0).contains(&percent).then_some(ProgressLine::Percent(percent))
}

fn progress_fraction(progress: ProgressLine, points_to_process: u32) -> f64 {
    let fraction = match progress {
        ProgressLine::Points(done) => f64::from(done) / f64::from(points_to_process.max(1)),
        ProgressLine::Percent(percent) => percent / 100.0,
    };
    fraction.clamp(0.0, 1.0)
}

fn estimate_remaining(elapsed: Duration, fraction: f64) -> Option<Duration> {
    (fraction > 0.0).then(|| elapsed.mul_f64((1.0 - fraction) / fraction))
}

/// Everything a finished run produced.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    /// Results of the jobs that succeeded, in job order.
    pub results: Vec<RunResult>,
}

/// Launches the external solver executable.
#[derive(Clone, Debug)]
pub struct DvcRunner {
    executable: PathBuf,
    omp_threads: usize,
}

impl Default for DvcRunner {
    fn default() -> Self {
        let executable = if cfg!(windows) { "dvc.exe" } else { "dvc" };
        Self::new(executable)
    }
}

impl DvcRunner {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            omp_threads: DEFAULT_OMP_THREADS,
        }
    }

    pub fn with_omp_threads(mut self, omp_threads: usize) -> Self {
        self.omp_threads = omp_threads.max(1);
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Prepare every job of `config` and run them in order, stopping at the
    /// first job that does not succeed.
    pub async fn run_all<P>(
        &self,
        config: &RunConfig,
        mut progress: P,
        mut cancel: oneshot::Receiver<()>,
    ) -> Result<RunSummary>
    where
        P: FnMut(ProgressEvent),
    {
        let jobs = prepare_jobs(config)?;
        let mut results = Vec::with_capacity(jobs.len());
        for job in &jobs {
            let outcome = self.run_job(job, jobs.len(), &mut progress, &mut cancel).await?;
            if outcome != RunOutcome::Succeeded {
                log::warn!("Job {} ended with {outcome:?}", job.index);
                return Ok(RunSummary { outcome, results });
            }
            results.push(ResultsModel::parse(&job.folder)?);
        }
        Ok(RunSummary {
            outcome: RunOutcome::Succeeded,
            results,
        })
    }

    /// Run one job, reporting progress parsed from the solver's stdout.
    ///
    /// # Errors
    ///
    /// Returns error if the solver cannot be started or its output cannot be
    /// read. A solver that exits with a failure is reported through
    /// [`RunOutcome`], not as an error.
    pub async fn run_job<P>(
        &self,
        job: &SolverJob,
        jobs: usize,
        progress: &mut P,
        cancel: &mut oneshot::Receiver<()>,
    ) -> Result<RunOutcome>
    where
        P: FnMut(ProgressEvent),
    {
        log::info!("Running solver job {}/{jobs}: {}", job.index + 1, job.config_file.display());
        let mut child = Command::new(&self.executable)
            .arg(&job.config_file)
            .env("OMP_NUM_THREADS", self.omp_threads.to_string())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| DvcError::Solver(format!("could not start {}: {err}", self.executable.display())))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DvcError::Solver("solver stdout was not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();
        let started = Instant::now();
        let mut stdout_open = true;
        let mut cancel_open = true;

        let status = loop {
            tokio::select! {
                line = lines.next_line(), if stdout_open => match line? {
                    Some(line) => {
                        if let Some(error) = self.inspect_line(line, job, jobs, started, progress) {
                            child.kill().await?;
                            return Ok(RunOutcome::InputError(error));
                        }
                    }
                    None => stdout_open = false,
                },
                signal = &mut *cancel, if cancel_open => match signal {
                    Ok(()) => {
                        log::info!("Cancelling solver job {}", job.index + 1);
                        child.kill().await?;
                        return Ok(RunOutcome::Cancelled);
                    }
                    Err(oneshot::Canceled) => cancel_open = false,
                },
                status = child.wait() => break status?,
            }
        };

        while let Some(line) = lines.next_line().await? {
            if let Some(error) = self.inspect_line(line, job, jobs, started, progress) {
                return Ok(RunOutcome::InputError(error));
            }
        }

        if status.success() {
            log::info!("Solver job {} finished in {:.1?}", job.index + 1, started.elapsed());
            Ok(RunOutcome::Succeeded)
        } else {
            log::warn!("Solver job {} exited with {status}", job.index + 1);
            Ok(RunOutcome::Failed { code: status.code() })
        }
    }

    /// Report a progress line; returns the line if it is an input error.
    fn inspect_line<P>(
        &self,
        line: String,
        job: &SolverJob,
        jobs: usize,
        started: Instant,
        progress: &mut P,
    ) -> Option<String>
    where
        P: FnMut(ProgressEvent),
    {
        log::debug!("dvc: {line}");
        if line.starts_with(INPUT_ERROR_PREFIX) {
            log::error!("Solver job {} rejected its input: {line}", job.index + 1);
            return Some(line);
        }
        if let Some(parsed) = parse_progress_line(&line) {
            let fraction = progress_fraction(parsed, job.points_to_process);
            progress(ProgressEvent {
                job: job.index,
                jobs,
                fraction,
                eta: estimate_remaining(started.elapsed(), fraction),
                line,
            });
        }
        None
    }
}
