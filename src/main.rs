//! twincam: camera frames straight onto a display plane, no copies

use std::io;
use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use twincam::capture::{CaptureDevice, SyntheticCamera, V4l2Camera};
use twincam::display::{ConnectorId, DisplayDevice, DisplayPlane, KmsCard, VirtualCard};
use twincam::pipeline::{HandoffPipeline, PipelineStats};
use twincam::utils::{self, Proposal};
use twincam::{CaptureBackend, Config, DisplayBackend};

#[derive(Debug, Parser)]
#[command(name = "twincam", version, about)]
struct Cli {
    /// Print display connectors, pipes and planes, then exit
    #[arg(short = 'l', long)]
    list_displays: bool,

    /// Print capture devices and their formats, then exit
    #[arg(short = 'c', long)]
    list_cameras: bool,

    /// Configuration file (default: ./twincam.toml if present)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Use the test-pattern camera instead of V4L2
    #[arg(long)]
    synthetic: bool,

    /// Use the in-memory display instead of KMS
    #[arg(long)]
    virtual_display: bool,

    /// Stop after this many captured frames
    #[arg(long, value_name = "N")]
    frames: Option<u64>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if self.synthetic {
            config.capture.backend = CaptureBackend::Synthetic;
        }
        if self.virtual_display {
            config.display.backend = DisplayBackend::Virtual;
        }
        if self.frames.is_some() {
            config.pipeline.frame_limit = self.frames;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            std::process::exit(-1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("twincam=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let mut config = Config::load(cli.config.as_deref()).wrap_err("loading configuration")?;
    cli.apply(&mut config);

    if cli.list_displays || cli.list_cameras {
        let mut out = io::stdout().lock();
        if cli.list_displays {
            match config.display.backend {
                DisplayBackend::Kms => utils::list_kms(&mut out, &config.display.card)
                    .wrap_err_with(|| format!("listing {}", config.display.card.display()))?,
                DisplayBackend::Virtual => {
                    utils::list_displays(&mut out, &open_virtual(&config, false)?)?
                }
            }
        }
        if cli.list_cameras {
            let proposal = Proposal {
                width: config.capture.width,
                height: config.capture.height,
                format: config.capture.format,
                fps: config.capture.fps,
            };
            utils::list_cameras(&mut out, proposal).wrap_err("listing cameras")?;
        }
        return Ok(());
    }

    info!(capture = ?config.capture.backend, display = ?config.display.backend, "twincam launching");

    let stats = match (config.capture.backend, config.display.backend) {
        (CaptureBackend::V4l2, DisplayBackend::Kms) => {
            run_pipeline(open_v4l2(&config)?, open_kms(&config)?, &config).await?
        }
        (CaptureBackend::V4l2, DisplayBackend::Virtual) => {
            run_pipeline(open_v4l2(&config)?, open_virtual(&config, true)?, &config).await?
        }
        (CaptureBackend::Synthetic, DisplayBackend::Kms) => {
            run_pipeline(open_synthetic(&config)?, open_kms(&config)?, &config).await?
        }
        (CaptureBackend::Synthetic, DisplayBackend::Virtual) => {
            run_pipeline(open_synthetic(&config)?, open_virtual(&config, true)?, &config).await?
        }
    };

    info!(
        frames = stats.completions,
        commits = stats.commits,
        rejected = stats.rejected,
        superseded = stats.superseded,
        "twincam shutting down"
    );
    Ok(())
}

fn open_v4l2(config: &Config) -> Result<V4l2Camera> {
    let capture = &config.capture;
    let path = match &capture.device {
        Some(path) => path.clone(),
        None => utils::auto_detect_device(capture.format).wrap_err("finding a camera")?,
    };
    V4l2Camera::open(&path, capture.width, capture.height, capture.format, capture.fps)
        .wrap_err_with(|| format!("opening camera {}", path.display()))
}

fn open_synthetic(config: &Config) -> Result<SyntheticCamera> {
    let capture = &config.capture;
    let camera = SyntheticCamera::new(
        capture.width,
        capture.height,
        capture.format,
        Some(capture.fps),
    );
    match &capture.pattern {
        Some(path) => camera
            .with_pattern_image(path)
            .wrap_err_with(|| format!("loading pattern {}", path.display())),
        None => Ok(camera),
    }
}

fn open_kms(config: &Config) -> Result<KmsCard> {
    KmsCard::open(&config.display.card)
        .wrap_err_with(|| format!("opening card {}", config.display.card.display()))
}

fn open_virtual(config: &Config, clocked: bool) -> Result<VirtualCard> {
    let display = &config.display;
    let card = if clocked {
        VirtualCard::new(display.width, display.height, display.refresh_hz)
            .wrap_err("starting virtual display")?
    } else {
        VirtualCard::manual(display.width, display.height)
    };
    Ok(card.with_max_scale(display.max_scale))
}

async fn run_pipeline<C, D>(camera: C, device: D, config: &Config) -> Result<PipelineStats>
where
    C: CaptureDevice,
    D: DisplayDevice,
{
    let wanted = config.display.connector.map(ConnectorId);
    let (connector, pipe) =
        utils::select_output(&device, wanted).wrap_err("selecting display output")?;
    let plane = DisplayPlane::bind(device, connector, pipe).wrap_err("binding display plane")?;
    info!(%connector, %pipe, plane = %plane.plane(), "output selected");

    let mut pipeline = HandoffPipeline::setup(camera, plane, config.pipeline_options())
        .wrap_err("setting up handoff pipeline")?;

    let handle = pipeline.handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupted, stopping");
                handle.stop();
            }
            Err(err) => warn!(%err, "cannot listen for ctrl-c"),
        }
    });

    pipeline.run().await.wrap_err("handoff pipeline failed")
}
