use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use dvc_volume::{
    DvcError, Result,
    enums::Endianness,
    registration::AutomaticRegistrationConfig,
    results::{ResultsModel, RunResult},
    run_config::{PointCloudSource, RunConfig, RunMode, SweepRange},
    runner::{DvcRunner, RunOutcome},
    session::{SessionContext, SessionImage, SessionSettings},
    volume_loader::VolumeInfo,
};
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};
use futures::channel::oneshot;

#[derive(Parser)]
#[command(name = "dvc-volume")]
#[command(about = "Prepare, run and summarise Digital Volume Correlation runs")]
struct Cli {
    /// Log specification, e.g. "info" or "warn, dvc_volume=debug"
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ImageArgs {
    /// Reference image (.mha, .mhd or raw)
    #[arg(long)]
    reference: PathBuf,

    /// Correlate image, same size as the reference
    #[arg(long)]
    correlate: Option<PathBuf>,

    /// Dimensions of raw images, x y z
    #[arg(long, num_args = 3, value_names = ["X", "Y", "Z"])]
    dims: Option<Vec<usize>>,

    #[arg(long, default_value_t = 16)]
    bit_depth: u8,

    #[arg(long)]
    big_endian: bool,

    #[arg(long, default_value_t = 0)]
    header_length: usize,
}

#[derive(Args)]
struct SessionArgs {
    /// Session settings (JSON)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Point0 in world coordinates, overrides the settings
    #[arg(long, num_args = 3, value_names = ["X", "Y", "Z"], allow_negative_numbers = true)]
    point0: Option<Vec<f64>>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a point cloud inside a mask and write it as .roi
    Pointcloud {
        #[command(flatten)]
        images: ImageArgs,

        #[command(flatten)]
        session: SessionArgs,

        /// Mask drawn on the reference (.mha)
        #[arg(long)]
        mask: PathBuf,

        #[arg(short, long, default_value = "pointcloud.roi")]
        output: PathBuf,
    },

    /// Find the rigid offset between the images around point0
    Register {
        #[command(flatten)]
        images: ImageArgs,

        #[command(flatten)]
        session: SessionArgs,

        /// Write the central slice of the difference image as PNG
        #[arg(long)]
        difference_png: Option<PathBuf>,
    },

    /// Write the run configuration for a single or bulk run
    Config {
        #[command(flatten)]
        images: ImageArgs,

        #[command(flatten)]
        session: SessionArgs,

        /// New folder for the run
        #[arg(long)]
        run_folder: PathBuf,

        /// Mask to build point clouds in
        #[arg(long)]
        mask: Option<PathBuf>,

        /// Existing point cloud to use instead of building one
        #[arg(long)]
        pointcloud: Option<PathBuf>,

        /// Subvolume sizes to sweep, min max step
        #[arg(long, num_args = 3, value_names = ["MIN", "MAX", "STEP"])]
        bulk_sizes: Option<Vec<u32>>,

        /// Points per subvolume to sweep, min max step
        #[arg(long, num_args = 3, value_names = ["MIN", "MAX", "STEP"])]
        bulk_points: Option<Vec<u32>>,

        /// Register the images automatically before writing the configuration
        #[arg(long)]
        register: bool,
    },

    /// Prepare and run the solver jobs of a run configuration
    Run {
        /// The run's _run_config.json
        config: PathBuf,

        #[arg(long)]
        executable: Option<PathBuf>,

        /// OpenMP threads per solver process
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Summarise the results of a run folder
    Results { run_folder: PathBuf },
}

fn setup_logging(spec: &str) -> std::result::Result<LoggerHandle, flexi_logger::FlexiLoggerError> {
    Logger::try_with_env_or_str(spec)?
        .log_to_file(FileSpec::default().directory("logs"))
        .duplicate_to_stderr(Duplicate::All)
        .rotate(
            Criterion::Size(1024 * 1024),
            Naming::Timestamps,
            Cleanup::KeepLogFiles(5),
        )
        .start()
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _logger = match setup_logging(&cli.log_level) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("Logger initialization failed with {err}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Pointcloud {
            images,
            session,
            mask,
            output,
        } => pointcloud(&images, &session, &mask, &output),
        Commands::Register {
            images,
            session,
            difference_png,
        } => register(&images, &session, difference_png.as_deref()),
        Commands::Config {
            images,
            session,
            run_folder,
            mask,
            pointcloud,
            bulk_sizes,
            bulk_points,
            register,
        } => {
            let mode = run_mode(bulk_sizes, bulk_points);
            config(&images, &session, run_folder, mask, pointcloud, mode, register)
        }
        Commands::Run {
            config,
            executable,
            threads,
        } => run(&config, executable, threads).await,
        Commands::Results { run_folder } => results(&run_folder),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn triple<T: Copy>(values: &[T], what: &str) -> Result<[T; 3]> {
    <[T; 3]>::try_from(values).map_err(|_| DvcError::configuration(format!("{what} needs three values")))
}

fn open_session(images: &ImageArgs, args: &SessionArgs) -> Result<SessionContext> {
    let mut settings = match &args.settings {
        Some(path) => SessionSettings::load(path)?,
        None => SessionSettings::default(),
    };
    if let Some(point0) = &args.point0 {
        settings.point0 = Some(triple(point0, "--point0")?);
    }

    let raw_layout = match &images.dims {
        Some(dims) => Some((
            triple(dims, "--dims")?,
            VolumeInfo {
                bit_depth: images.bit_depth,
                endianness: if images.big_endian {
                    Endianness::Big
                } else {
                    Endianness::Little
                },
                header_length: images.header_length,
            },
        )),
        None => None,
    };
    let reference = SessionImage::load(&images.reference, raw_layout)?;
    let correlate = match &images.correlate {
        Some(path) => SessionImage::load(path, raw_layout)?,
        None => reference.clone(),
    };

    let mut session = SessionContext::new(settings)?;
    session.load_images(reference, correlate)?;
    Ok(session)
}

fn pointcloud(images: &ImageArgs, args: &SessionArgs, mask: &Path, output: &Path) -> Result<()> {
    let mut session = open_session(images, args)?;
    session.load_mask(mask)?;
    match session.build_pointcloud()?.into_cloud() {
        Some(cloud) => {
            cloud.save(output)?;
            println!("{} points written to {}", cloud.len(), output.display());
            Ok(())
        }
        None => Err(DvcError::EmptyPointCloud {
            subvol_size: session.settings().subvolume.size(),
        }),
    }
}

fn register(images: &ImageArgs, args: &SessionArgs, difference_png: Option<&Path>) -> Result<()> {
    let mut session = open_session(images, args)?;
    let result = session.register_automatically(AutomaticRegistrationConfig::default())?;
    println!(
        "{:?} after {} iterations, rigid_trans {}",
        result.outcome,
        result.iterations,
        session.registration().rigid_trans()
    );

    if let Some(path) = difference_png {
        let orientation = session.settings().orientation;
        let difference = session
            .registration()
            .difference()
            .ok_or_else(|| DvcError::InvalidState("no difference image".into()))?;
        let depth = difference.volume.geometry.dimensions[orientation.through_plane_axis()];
        let image = difference
            .volume
            .get_image_from_axis(depth / 2, orientation)
            .ok_or_else(|| DvcError::configuration("difference image is empty"))?;
        image.save(path)?;
        log::info!("Difference image written to {}", path.display());
    }
    Ok(())
}

fn run_mode(bulk_sizes: Option<Vec<u32>>, bulk_points: Option<Vec<u32>>) -> Option<(Vec<u32>, Vec<u32>)> {
    match (bulk_sizes, bulk_points) {
        (None, None) => None,
        (sizes, points) => Some((sizes.unwrap_or_default(), points.unwrap_or_default())),
    }
}

fn sweep(values: &[u32], single: u32, what: &str) -> Result<SweepRange> {
    if values.is_empty() {
        return Ok(SweepRange::single(single));
    }
    let [min, max, step] = triple(values, what)?;
    Ok(SweepRange::new(min, max, step))
}

fn config(
    images: &ImageArgs,
    args: &SessionArgs,
    run_folder: PathBuf,
    mask: Option<PathBuf>,
    pointcloud: Option<PathBuf>,
    bulk: Option<(Vec<u32>, Vec<u32>)>,
    register: bool,
) -> Result<()> {
    let mut session = open_session(images, args)?;
    if let Some(mask) = &mask {
        session.load_mask(mask)?;
    }
    if register {
        session.register_automatically(AutomaticRegistrationConfig::default())?;
    }

    let settings = session.settings();
    let mode = match bulk {
        None => RunMode::Single {
            subvolume_points: settings.subvolume_points,
        },
        Some((sizes, points)) => RunMode::Bulk {
            subvolume_sizes: sweep(&sizes, settings.subvolume.size(), "--bulk-sizes")?,
            subvolume_points: sweep(&points, settings.subvolume_points, "--bulk-points")?,
        },
    };
    let source = match pointcloud {
        Some(path) => PointCloudSource::Loaded(path),
        None => PointCloudSource::Generated,
    };

    let config = session.create_run_config(run_folder, &mode, &source)?;
    println!(
        "{} jobs configured in {}, rigid_trans {}",
        config.job_count(),
        config.run_folder.display(),
        config.rigid_trans
    );
    Ok(())
}

async fn run(config_file: &Path, executable: Option<PathBuf>, threads: Option<usize>) -> Result<()> {
    let config = RunConfig::load(config_file)?;
    let mut runner = executable.map(DvcRunner::new).unwrap_or_default();
    if let Some(threads) = threads {
        runner = runner.with_omp_threads(threads);
    }

    let (sender, cancel) = oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = sender.send(());
        }
    });

    let summary = runner
        .run_all(
            &config,
            |event| {
                let eta = event
                    .eta
                    .map(|eta| format!(", {}s left", eta.as_secs()))
                    .unwrap_or_default();
                log::info!(
                    "Job {}/{}: {:.0}%{eta}",
                    event.job + 1,
                    event.jobs,
                    event.fraction * 100.0
                );
            },
            cancel,
        )
        .await?;

    for result in &summary.results {
        print_result(result);
    }
    match summary.outcome {
        RunOutcome::Succeeded => Ok(()),
        outcome => Err(DvcError::Solver(format!("run ended with {outcome:?}"))),
    }
}

fn results(run_folder: &Path) -> Result<()> {
    let results = ResultsModel::parse_folder(run_folder)?;
    if results.is_empty() {
        log::warn!("No results found in {}", run_folder.display());
    }
    for result in &results {
        print_result(result);
    }
    Ok(())
}

fn print_result(result: &RunResult) {
    println!("{} ({}, {} points)", result.title(), result.name, result.records.len());
    for summary in result.column_summaries() {
        println!("  {:<22} mean {:>12.5}  std {:>12.5}", summary.title, summary.mean, summary.std_dev);
    }
}
