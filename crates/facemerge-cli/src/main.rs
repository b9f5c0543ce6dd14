use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use facemerge_core::{
    build_mask, result_file_name, FaceMerger, LandmarkExtractor, MergeOptions, OnnxLandmarkDetector,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "facemerge", about = "Merge a face from one photo onto another")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge the face in SOURCE onto the face in TARGET
    Merge {
        source: PathBuf,
        target: PathBuf,
        /// Result file, or a directory to write `result_<source>_on_<target>.png` into
        output: PathBuf,
        /// Send the request to a running facemerged instead of merging in-process
        #[arg(long)]
        daemon: bool,
        /// Warped-mask binarization threshold. In-process only; the daemon
        /// reads FACEMERGE_MASK_THRESHOLD
        #[arg(long, default_value_t = 10, conflicts_with = "daemon")]
        mask_threshold: u8,
        #[command(flatten)]
        models: ModelArgs,
    },
    /// Print the landmark groups of the first face in an image as JSON
    Landmarks {
        image: PathBuf,
        #[command(flatten)]
        models: ModelArgs,
    },
    /// Write the face-region mask of an image
    Mask {
        image: PathBuf,
        output: PathBuf,
        #[command(flatten)]
        models: ModelArgs,
    },
    /// Show daemon status
    Status,
}

#[derive(Args)]
struct ModelArgs {
    /// Directory holding the ONNX models (default: $FACEMERGE_MODEL_DIR or ~/.local/share/facemerge/models)
    #[arg(long)]
    model_dir: Option<PathBuf>,
    /// SCRFD detection model (overrides --model-dir)
    #[arg(long)]
    detector_model: Option<PathBuf>,
    /// 68-point landmark model (overrides --model-dir)
    #[arg(long)]
    landmark_model: Option<PathBuf>,
    /// ONNX Runtime intra-op threads
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl ModelArgs {
    fn load(&self) -> Result<OnnxLandmarkDetector> {
        let dir = self.model_dir.clone().unwrap_or_else(facemerge_core::default_model_dir);
        let detector = self
            .detector_model
            .clone()
            .unwrap_or_else(|| dir.join(facemerge_core::DETECTOR_MODEL_FILE));
        let landmarks = self
            .landmark_model
            .clone()
            .unwrap_or_else(|| dir.join(facemerge_core::LANDMARK_MODEL_FILE));
        OnnxLandmarkDetector::load(&detector, &landmarks, self.threads)
            .with_context(|| format!("loading models from {}", dir.display()))
    }
}

// `#[zbus::proxy]` generates `FaceMergeProxy` for the facemerged session-bus service.
#[zbus::proxy(
    interface = "org.facemerge.FaceMerge1",
    default_service = "org.facemerge.FaceMerge1",
    default_path = "/org/facemerge/FaceMerge1"
)]
trait FaceMerge {
    async fn merge(&self, source: &str, target: &str, result: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

/// Client-side ceiling for a daemon call; the daemon applies its own limit.
const DAEMON_CALL_TIMEOUT: Duration = Duration::from_secs(120);

async fn daemon_proxy() -> Result<FaceMergeProxy<'static>> {
    let conn = zbus::connection::Builder::session()?
        .method_timeout(DAEMON_CALL_TIMEOUT)
        .build()
        .await
        .context("connecting to the session bus")?;
    Ok(FaceMergeProxy::new(&conn).await?)
}

/// Resolve the result path; a directory output gets the conventional file name.
fn resolve_output(source: &Path, target: &Path, output: &Path) -> PathBuf {
    if output.is_dir() {
        output.join(result_file_name(source, target))
    } else {
        output.to_path_buf()
    }
}

/// The daemon runs with its own working directory, so relative paths are
/// anchored to ours before they are sent.
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("path is not valid UTF-8: {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Merge {
            source,
            target,
            output,
            daemon,
            mask_threshold,
            models,
        } => {
            let result = resolve_output(&source, &target, &output);
            if daemon {
                let (source, target, result) = (absolute(&source)?, absolute(&target)?, absolute(&result)?);
                let proxy = daemon_proxy().await?;
                let written = proxy
                    .merge(path_str(&source)?, path_str(&target)?, path_str(&result)?)
                    .await
                    .context("facemerged merge failed")?;
                println!("{written}");
            } else {
                let detector = models.load()?;
                let options = MergeOptions {
                    mask_threshold,
                    ..MergeOptions::default()
                };
                let mut merger = FaceMerger::with_options(detector, options);
                let written = merger.merge(&source, &target, &result)?;
                println!("{}", written.display());
            }
        }
        Commands::Landmarks { image, models } => {
            let picture = image::open(&image)
                .with_context(|| format!("opening {}", image.display()))?
                .to_rgb8();
            let mut extractor = LandmarkExtractor::new(models.load()?);
            match extractor.extract(&picture)? {
                Some(landmarks) => println!("{}", serde_json::to_string_pretty(&landmarks)?),
                None => bail!("no face detected in {}", image.display()),
            }
        }
        Commands::Mask { image, output, models } => {
            let picture = image::open(&image)
                .with_context(|| format!("opening {}", image.display()))?
                .to_rgb8();
            let mut extractor = LandmarkExtractor::new(models.load()?);
            let Some(landmarks) = extractor.extract(&picture)? else {
                bail!("no face detected in {}", image.display());
            };
            let Some(face) = build_mask(&picture, &landmarks) else {
                bail!("face in {} has no mask points", image.display());
            };
            face.mask
                .save(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            tracing::info!(hull = face.hull.len(), output = %output.display(), "mask written");
            println!("{}", output.display());
        }
        Commands::Status => match daemon_proxy().await {
            Ok(proxy) => match proxy.status().await {
                Ok(status) => println!("{status}"),
                Err(e) => println!("facemerged: not running ({e})"),
            },
            Err(e) => println!("facemerged: not connected ({e})"),
        },
    }

    Ok(())
}
