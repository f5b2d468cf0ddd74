use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use voicelayer_core::{
    remote::Connection, AppConfig, CaptureBackend, CatalogKey, Connector, ControlLoop,
    CpalCapture, DiscoveryMode, DiscoveryScope, LevelReading, LoopState, LoopStatus,
    ObsConnector, SourceRegistry, VoiceLayerError,
};

const LEVEL_POLL: Duration = Duration::from_millis(50);
const METER_WIDTH: usize = 40;

fn main() -> voicelayer_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = cli.load_config()?;

    match cli.command {
        Commands::Devices => list_devices(),
        Commands::Scenes => list_scenes(&config),
        Commands::Discover { scene, group } => run_discover(&config, scene, group),
        Commands::Run(overrides) => run_loop(overrides.apply(config)),
    }
}

fn list_devices() -> voicelayer_core::Result<()> {
    let devices = CpalCapture.input_devices();
    if devices.is_empty() {
        tracing::warn!("no capture devices found");
    }
    for name in devices {
        println!("{name}");
    }
    Ok(())
}

fn list_scenes(config: &AppConfig) -> voicelayer_core::Result<()> {
    let connector = ObsConnector::new(config.obs.clone());
    let mut connection = Connection::open(&connector)?;
    let client = connection.client();
    for scene in client.list_scenes() {
        println!("{scene}");
        for group in client.list_groups_in_scene(&scene) {
            println!("  {group}");
        }
    }
    Ok(())
}

fn run_discover(
    config: &AppConfig,
    scene: Option<String>,
    group: Option<String>,
) -> voicelayer_core::Result<()> {
    let scope = match (scene, group) {
        (Some(scene), Some(group)) => DiscoveryScope::Group(CatalogKey::new(&scene, &group)),
        (Some(scene), None) => DiscoveryScope::Scene(scene),
        _ => DiscoveryScope::AllScenes,
    };
    tracing::info!(?scope, "running discovery");

    let registry = SourceRegistry::new(config.name_pattern()?);
    let connector = ObsConnector::new(config.obs.clone());
    let report = registry.discover_with(&connector, scope, DiscoveryMode::Refresh)?;

    for group in &report.groups {
        if group.failed > 0 {
            println!("{}: {} sources, {} probes failed", group.key, group.found, group.failed);
        } else {
            println!("{}: {} sources", group.key, group.found);
        }
    }
    if report.total_failed() > 0 {
        tracing::warn!(
            failed = report.total_failed(),
            "some probes failed, results may be incomplete"
        );
    }
    Ok(())
}

fn run_loop(config: AppConfig) -> voicelayer_core::Result<()> {
    let loop_config = config.loop_config()?;
    let connector: Arc<dyn Connector> = Arc::new(ObsConnector::new(config.obs.clone()));
    let registry = Arc::new(SourceRegistry::new(config.name_pattern()?));

    let failed = Arc::new(AtomicBool::new(false));
    let failure = Arc::new(Mutex::new(None::<String>));
    let failed_flag = failed.clone();
    let failure_slot = failure.clone();
    let mut control = ControlLoop::new(connector, Arc::new(CpalCapture), registry).with_status(
        move |status| match status {
            LoopStatus::Error(msg) => {
                tracing::error!(%msg, "control loop failed");
                if let Ok(mut slot) = failure_slot.lock() {
                    slot.get_or_insert(msg);
                }
                failed_flag.store(true, Ordering::Release);
            }
            other => tracing::info!(status = ?other, "control loop"),
        },
    );

    let report = control.discover(
        DiscoveryScope::Group(loop_config.key.clone()),
        DiscoveryMode::UseCache,
    )?;
    tracing::info!(
        key = %loop_config.key,
        found = report.total_found(),
        failed = report.total_failed(),
        "discovery finished"
    );

    control.start(&loop_config)?;
    let quit = spawn_enter_listener();
    eprintln!("running, press Enter to stop");

    let levels = control.levels();
    while !quit.load(Ordering::Acquire)
        && !failed.load(Ordering::Acquire)
        && control.state() == LoopState::Running
    {
        thread::sleep(LEVEL_POLL);
        if let Some(reading) = levels.latest() {
            draw_meter(&reading);
        }
    }
    eprintln!();

    control.stop();
    let reason = failure.lock().ok().and_then(|mut slot| slot.take());
    exit_status(reason)
}

/// A run that ended on a worker error must not exit successfully.
fn exit_status(failure: Option<String>) -> voicelayer_core::Result<()> {
    match failure {
        Some(reason) => Err(VoiceLayerError::msg(format!(
            "control loop stopped on error: {reason}"
        ))),
        None => Ok(()),
    }
}

fn spawn_enter_listener() -> Arc<AtomicBool> {
    let quit = Arc::new(AtomicBool::new(false));
    let flag = quit.clone();
    let spawned = thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            let mut line = String::new();
            let _ = io::stdin().lock().read_line(&mut line);
            flag.store(true, Ordering::Release);
        });
    if let Err(err) = spawned {
        tracing::warn!(%err, "could not watch stdin, stop with Ctrl-C");
    }
    quit
}

fn draw_meter(reading: &LevelReading) {
    let filled = (reading.meter * METER_WIDTH as f64).round() as usize;
    let bar = format!("{}{}", "#".repeat(filled), " ".repeat(METER_WIDTH - filled.min(METER_WIDTH)));
    let mut stderr = io::stderr().lock();
    let _ = write!(stderr, "\r{:>8.1} [{bar}] {:?}   ", reading.rms, reading.zone);
    let _ = stderr.flush();
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Drive OBS image layers from microphone loudness", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// OBS websocket host.
    #[arg(long, global = true)]
    host: Option<String>,

    /// OBS websocket port.
    #[arg(long, global = true)]
    port: Option<u16>,

    /// OBS websocket password.
    #[arg(long, global = true, env = "OBS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn load_config(&self) -> voicelayer_core::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::default(),
        };
        if let Some(host) = &self.host {
            config.obs.host = host.clone();
        }
        if let Some(port) = self.port {
            config.obs.port = port;
        }
        if let Some(password) = &self.password {
            config.obs.password = password.clone();
        }
        Ok(config)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the available capture devices.
    Devices,
    /// List scenes and the groups inside each.
    Scenes,
    /// Probe groups for numbered image sources and print what was found.
    Discover {
        /// Limit discovery to one scene.
        #[arg(long)]
        scene: Option<String>,
        /// Limit discovery to one group of `--scene`.
        #[arg(long, requires = "scene")]
        group: Option<String>,
    },
    /// Start switching layers until Enter is pressed.
    Run(RunOverrides),
}

#[derive(Args, Debug)]
struct RunOverrides {
    #[arg(long)]
    scene: Option<String>,
    #[arg(long)]
    group: Option<String>,
    /// Capture device name, `default` for the host default input.
    #[arg(long)]
    device: Option<String>,
    #[arg(long)]
    min: Option<f64>,
    #[arg(long)]
    max: Option<f64>,
}

impl RunOverrides {
    fn apply(self, mut config: AppConfig) -> AppConfig {
        if let Some(scene) = self.scene {
            config.overlay.scene = scene;
        }
        if let Some(group) = self.group {
            config.overlay.group = group;
        }
        if let Some(device) = self.device {
            config.audio.device = device;
        }
        if let Some(min) = self.min {
            config.audio.threshold_min = min;
        }
        if let Some(max) = self.max {
            config.audio.threshold_max = max;
        }
        config
    }
}
