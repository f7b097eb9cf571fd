//! synccam: synchronized multi-camera capture and recording

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use tokio::task::block_in_place;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use synccam::camera::{detect_devices, run_camera_worker, CameraWorkerDescriptor};
use synccam::group::IpcMessage;
use synccam::recording::RecordingRequest;
use synccam::{Config, SyncContext};

#[derive(Parser)]
#[command(name = "synccam", version, about = "Synchronized multi-camera capture")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a camera group, optionally recording it
    Run {
        /// TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Record for this many seconds, then exit
        #[arg(long)]
        record_seconds: Option<u64>,
        /// Stop triggering after this many multi-frames
        #[arg(long)]
        frames: Option<u64>,
        /// Recording name, defaults to a timestamp
        #[arg(long)]
        name: Option<String>,
    },
    /// List V4L2 capture devices
    Detect,
    /// Run one camera worker (spawned by `run`)
    #[command(hide = true)]
    CameraWorker { descriptor: String },
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()),
    );
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    match cli.command {
        Command::CameraWorker { descriptor } => {
            init_tracing("synccam=info");
            let descriptor: CameraWorkerDescriptor =
                serde_json::from_str(&descriptor).wrap_err("invalid camera worker descriptor")?;
            run_camera_worker(&descriptor)?;
            Ok(())
        }
        Command::Detect => {
            init_tracing("synccam=info");
            let devices = detect_devices();
            if devices.is_empty() {
                println!("no capture devices found");
            }
            for device in devices {
                let formats: Vec<String> = device.formats.iter().map(ToString::to_string).collect();
                println!("{}\t{}\t{}\t{}", device.path, device.card, device.driver, formats.join(","));
            }
            Ok(())
        }
        Command::Run {
            config,
            record_seconds,
            frames,
            name,
        } => {
            let mut config = Config::load(config.as_deref()).wrap_err("loading config")?;
            if frames.is_some() {
                config.pipeline.max_multi_frames = frames;
            }
            init_tracing(&config.logging.filter);

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .thread_name("synccam-cli")
                .build()?;
            runtime.block_on(run(config, record_seconds, name))
        }
    }
}

fn log_message(message: &IpcMessage) {
    match message {
        IpcMessage::ConfigUpdate { config } => info!(
            camera_id = %config.camera_id,
            width = config.resolution.width,
            height = config.resolution.height,
            framerate = config.framerate,
            "camera config"
        ),
        IpcMessage::RecordingInfo(info) => {
            info!(name = %info.recording_name, folder = %info.recording_folder.display(), "recording")
        }
        IpcMessage::FramerateSample(sample) => info!(
            multi_frame = sample.multi_frame_number,
            framerate = sample.mean_framerate,
            "framerate"
        ),
        IpcMessage::StateSnapshot(state) => tracing::debug!(?state, "state"),
    }
}

async fn run(config: Config, record_seconds: Option<u64>, name: Option<String>) -> Result<()> {
    info!("synccam launching...");
    let cameras = config.camera_map();
    let mut context = SyncContext::new(config)?;
    block_in_place(|| context.create_camera_group(cameras)).wrap_err("starting camera group")?;
    let messages = context.messages();

    let mut deadline = None;
    if let Some(seconds) = record_seconds {
        let request = RecordingRequest {
            recording_name: name,
            ..Default::default()
        };
        block_in_place(|| context.start_recording(request))?;
        deadline = Some(Instant::now() + Duration::from_secs(seconds));
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut result = Ok(());

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("ctrl-c received");
                break;
            }
            Ok(message) = messages.recv_async() => log_message(&message),
            _ = ticker.tick() => {
                if let Err(e) = block_in_place(|| context.pump()) {
                    error!("camera group failed: {}", e);
                    result = Err(e.into());
                    break;
                }
                let state = context.state_snapshot();
                info!(loop_count = state.loop_count, recording = state.recording.is_some(), "status");

                let finished = context.camera_group().map_or(true, |group| group.frame_loop_finished());
                let expired = deadline.is_some_and(|deadline| Instant::now() >= deadline);
                if state.recording.is_some() && (expired || finished) {
                    let summary = block_in_place(|| context.stop_recording())?;
                    println!(
                        "recorded {} multi-frames to {}",
                        summary.frame_count,
                        summary.info.recording_folder.display()
                    );
                    break;
                }
                if state.recording.is_none() && finished {
                    break;
                }
            }
        }
    }

    if let Err(e) = block_in_place(|| context.shutdown()) {
        warn!("shutdown: {}", e);
    }
    info!("synccam shutting down");
    result
}
