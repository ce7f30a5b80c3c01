use clap::Parser;
use color_eyre::eyre::{self, Result, WrapErr};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::{future::pending, sync::Mutex, time::Instant};
use tokio::sync::{mpsc, watch};
use tracing::{self as log};

use launcher_link::{LinkSession, LinkState, Transport, TransportEvent};
use rallie_core::{
    homography::{HomographyEngine, ProjectionError},
    planner::{CommandPlanner, PlannerError, PositionSample},
    position_filter::PositionFilter,
    CalibrationStatus, ChangeDetector, CourtPoint, FloatType, LauncherStatus, OperatorCommand,
    PixelPoint, RallieConfig, SESSION_DIR_PREFIX, UNICAST_UDP_DEFAULT,
};
use writing_state::{Record, RecordMsg};

mod json_lines_writer;
mod serial_link;
mod udp_codec;
mod udp_handling;
mod writing_state;

const SESSION_DIRNAME_TEMPLATE: &str = "%Y%m%d_%H%M%S.%f";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Serial device of the radio bridge to the launcher. Overrides
    /// `link.port_path` from the configuration.
    #[arg(long)]
    port: Option<String>,

    /// The address to bind for the UDP listener
    #[arg(long, default_value = UNICAST_UDP_DEFAULT)]
    udp_addr: String,

    /// Filename of the configuration in YAML format
    #[arg(long)]
    config: Option<String>,

    /// If set, sessions and logs are saved to this directory.
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,
}

#[derive(Debug, clap::Subcommand, Default)]
enum Commands {
    /// Run the program (default command)
    #[default]
    Run,
    /// Show the configuration and then quit
    ShowConfig,
}

/// Datagrams from the vision source and the operator UI.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub(crate) enum UdpMsg {
    /// Player found at an image position. `timestamp` is in seconds on the
    /// vision source's clock.
    Detection {
        x: FloatType,
        y: FloatType,
        timestamp: FloatType,
    },
    NoDetection {
        timestamp: FloatType,
    },
    /// Image positions of the tapped court corners: net-left, net-right,
    /// baseline-right, baseline-left.
    CalibrationTaps([[FloatType; 2]; 4]),
    Operator(OperatorCommand),
}

/// Owns every piece of controller state. All events are handled here, one at
/// a time.
struct RallieCoordinator<T: Transport> {
    engine: HomographyEngine,
    filter: PositionFilter,
    planner: CommandPlanner,
    session: LinkSession<T>,
    calibration: CalibrationStatus,
    link_state: ChangeDetector<LinkState>,
    record_tx: mpsc::UnboundedSender<RecordMsg>,
    status_tx: watch::Sender<LauncherStatus>,
    detections: u64,
    misses: u64,
}

impl<T: Transport> RallieCoordinator<T> {
    fn new(
        config: &RallieConfig,
        session: LinkSession<T>,
        record_tx: mpsc::UnboundedSender<RecordMsg>,
        status_tx: watch::Sender<LauncherStatus>,
    ) -> Result<Self> {
        let planner = CommandPlanner::new(config.court, &config.planner)?;
        let link_state = ChangeDetector::new_with_initial_state(&session.state());
        let mut coordinator = Self {
            engine: HomographyEngine::new(config.court),
            filter: PositionFilter::new(config.filter),
            planner,
            session,
            calibration: CalibrationStatus::Uncalibrated,
            link_state,
            record_tx,
            status_tx,
            detections: 0,
            misses: 0,
        };
        if let Some(taps) = config.calibration.taps {
            log::info!("applying calibration taps from configuration");
            coordinator.on_calibration_taps(taps)?;
        }
        coordinator.after_event()?;
        Ok(coordinator)
    }

    fn record(&self, record: Record) -> Result<()> {
        self.record_tx
            .send(RecordMsg::Record(rallie_core::now(), record))?;
        Ok(())
    }

    fn status(&self) -> LauncherStatus {
        LauncherStatus {
            link_state: self.session.state(),
            planner: self.planner.snapshot(),
            calibration: self.calibration.clone(),
            position: self.filter.position(),
        }
    }

    /// Collect what changed while handling an event and publish it.
    fn after_event(&mut self) -> Result<()> {
        if let Some(outcome) = self.planner.poll_outcome() {
            self.record(Record::CommandResolved(outcome))?;
        }
        let state = self.session.state();
        if self.link_state.update(&state).is_some() {
            self.record(Record::LinkState(state))?;
        }
        self.status_tx.send_replace(self.status());
        Ok(())
    }

    fn on_udp_msg(
        &mut self,
        udp_msg: std::result::Result<(UdpMsg, std::net::SocketAddr), udp_codec::Error>,
        now: Instant,
    ) -> Result<()> {
        let (msg, src) = match udp_msg {
            Ok(ok) => ok,
            Err(e) => {
                log::warn!("dropping malformed UDP message: {e}");
                return Ok(());
            }
        };
        log::trace!("UDP message from {src}: {msg:?}");
        match msg {
            UdpMsg::Detection { x, y, timestamp } => {
                self.on_detection(PixelPoint::new(x, y), timestamp, now)?
            }
            UdpMsg::NoDetection { .. } => {
                self.misses += 1;
            }
            UdpMsg::CalibrationTaps(taps) => self.on_calibration_taps(taps)?,
            UdpMsg::Operator(cmd) => self.on_operator_command(cmd, now)?,
        }
        self.after_event()
    }

    fn on_detection(&mut self, pixel: PixelPoint, timestamp: FloatType, now: Instant) -> Result<()> {
        if !(pixel.x.is_finite() && pixel.y.is_finite() && timestamp.is_finite()) {
            log::warn!("dropping detection {pixel:?} at {timestamp}: not finite");
            return Ok(());
        }
        self.detections += 1;
        let raw = match self.engine.project_corrected(pixel) {
            Ok(raw) => raw,
            Err(ProjectionError::NotCalibrated) => {
                log::trace!("detection before calibration, ignoring");
                return Ok(());
            }
            Err(e) => {
                log::warn!("cannot project {pixel:?}: {e}");
                return Ok(());
            }
        };
        let Some(smoothed) = self.filter.update(raw, timestamp) else {
            return Ok(());
        };
        self.record(Record::Position {
            timestamp,
            raw,
            smoothed,
        })?;

        let sample = PositionSample {
            point: smoothed,
            timestamp,
        };
        if let Some(Ok(cmd)) = self
            .planner
            .on_position(sample, &mut self.session.sink_at(now))
        {
            self.record(Record::command_sent(&cmd))?;
        }
        Ok(())
    }

    fn on_calibration_taps(&mut self, taps: [[FloatType; 2]; 4]) -> Result<()> {
        let taps = taps.map(|[x, y]| PixelPoint::new(x, y));
        self.calibration = match self.engine.calibrate_from_taps(taps) {
            Ok(calib) => {
                // Old positions are in the previous court frame.
                self.filter.reset();
                CalibrationStatus::Calibrated {
                    residual_m: calib.residual_m,
                }
            }
            Err(e) => CalibrationStatus::Failed {
                reason: e.to_string(),
            },
        };
        self.record(Record::Calibration(self.calibration.clone()))
    }

    fn on_operator_command(&mut self, cmd: OperatorCommand, now: Instant) -> Result<()> {
        log::info!("operator command {cmd:?}");
        let applied = match cmd {
            OperatorCommand::SetMode(mode) => {
                self.planner.set_mode(mode);
                Ok(None)
            }
            OperatorCommand::SetSpeed(mph) => self.planner.set_speed(mph).map(|()| None),
            OperatorCommand::SetSpin(spin) => {
                self.planner.set_spin(spin);
                Ok(None)
            }
            OperatorCommand::SetLaunchInterval(secs) => {
                self.planner.set_launch_interval(secs).map(|()| None)
            }
            OperatorCommand::SetActive(active) => {
                self.planner.set_active(active);
                Ok(None)
            }
            OperatorCommand::ManualShot { x, y } => self
                .planner
                .manual_shot(CourtPoint::new(x, y), &mut self.session.sink_at(now))
                .map(Some),
            OperatorCommand::Stop => self
                .planner
                .stop(&mut self.session.sink_at(now))
                .map(Some)
                .map_err(PlannerError::from),
        };
        match applied {
            Ok(Some(sent)) => self.record(Record::command_sent(&sent))?,
            Ok(None) => {}
            Err(e) => log::warn!("operator command refused: {e}"),
        }
        Ok(())
    }

    fn on_transport_event(&mut self, event: TransportEvent, now: Instant) -> Result<()> {
        log::trace!("transport event {event:?}");
        self.session.handle_event(event, now);
        self.after_event()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.session.next_deadline()
    }

    fn on_ack_deadline(&mut self, now: Instant) -> Result<()> {
        self.session.poll_timeout(now);
        self.after_event()
    }

    /// Scan again if the link is down.
    fn on_reconnect_tick(&mut self) -> Result<()> {
        if self.session.state() == LinkState::Disconnected {
            if let Err(e) = self.session.start() {
                log::warn!("cannot start scan: {e}");
            }
        }
        self.after_event()
    }

    fn on_slow_tick(&mut self) {
        let status = self.status();
        log::info!(
            "link {}, {:?} mode, active {}, {} detections, {} misses, {} commands sent, position {:?}",
            status.link_state,
            status.planner.mode,
            status.planner.active,
            self.detections,
            self.misses,
            status.planner.commands_sent,
            status.position.map(|p| (p.x, p.y)),
        );
        self.detections = 0;
        self.misses = 0;
    }

    fn shutdown(&mut self) -> Result<()> {
        self.session.shutdown();
        self.after_event()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => pending().await,
    }
}

fn load_config(cli: &Cli) -> Result<RallieConfig> {
    let mut config: RallieConfig = if let Some(config_fname) = &cli.config {
        log::info!("Reading configuration from: {config_fname}");
        let cfg_buf = std::fs::read_to_string(config_fname)
            .with_context(|| format!("opening file {config_fname}"))?;
        serde_yaml::from_str(&cfg_buf)
            .with_context(|| format!("while parsing YAML in file {config_fname}"))?
    } else {
        log::info!("Loading default configuration.");
        RallieConfig::default()
    };
    if let Some(port) = &cli.port {
        config.link.port_path = Some(port.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    if std::env::var_os("RUST_LOG").is_none() {
        let envstr = format!("{}=info,info", env!("CARGO_PKG_NAME")).replace('-', "_");
        std::env::set_var("RUST_LOG", envstr);
    }

    let cli = Cli::parse();
    let log_dir = match cli.data_dir.as_ref() {
        Some(dd) => dd.clone(),
        None => home::home_dir().ok_or_else(|| eyre::eyre!("no home directory"))?,
    };
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("While creating directory {}", log_dir.display()))?;

    // Enable logging to console and to disk using tracing.
    {
        use time::{format_description::well_known::Iso8601, UtcOffset};
        use tracing_subscriber::{
            fmt::{self, time::OffsetTime},
            layer::SubscriberExt,
        };

        let log_file_name = chrono::Local::now()
            .format(".rallie-%Y%m%d_%H%M%S.%f.log")
            .to_string();
        let full_log_file_name = log_dir.join(&log_file_name);

        // Create a fixed offset time formatter based on the timezone at the
        // time this line of code runs.
        let timer = OffsetTime::new(
            UtcOffset::from_whole_seconds(chrono::Local::now().offset().local_minus_utc())?,
            Iso8601::DEFAULT,
        );

        let file = std::fs::File::create(&full_log_file_name)
            .with_context(|| format!("While creating file {}", full_log_file_name.display()))?;
        let file_layer = fmt::layer()
            .with_timer(timer.clone())
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_file(true)
            .with_line_number(true);
        let console_layer = fmt::layer()
            .with_timer(timer)
            .with_file(true)
            .with_line_number(true);
        let collector = tracing_subscriber::registry()
            .with(file_layer)
            .with(console_layer)
            .with(tracing_subscriber::filter::EnvFilter::from_default_env());
        tracing::subscriber::set_global_default(collector)?;
        std::panic::set_hook(Box::new(tracing_panic::panic_hook));
    }

    let config = load_config(&cli)?;
    let cfg_pretty = serde_yaml::to_string(&config)?;
    log::info!("configuration:\n{cfg_pretty}");

    // Validate after display so that errors are shown after the config.
    config.validate()?;

    match cli.command {
        Some(Commands::ShowConfig) => {
            return Ok(());
        }
        Some(Commands::Run) | None => {} // continue
    };

    let port_path = config
        .link
        .port_path
        .clone()
        .ok_or_else(|| eyre::eyre!("no launcher serial port given (use --port)"))?;

    let (record_tx, record_rx) = mpsc::unbounded_channel();
    let write_closer = writing_state::WriteCloser::new(record_tx.clone());

    let session_output = cli.data_dir.as_ref().map(|dd| {
        let stamp = rallie_core::now();
        let dirname = format!(
            "{SESSION_DIR_PREFIX}{}",
            stamp.format(SESSION_DIRNAME_TEMPLATE)
        );
        (stamp, dd.join(dirname))
    });
    let mut saver_handle =
        tokio::task::spawn_blocking(move || writing_state::writer_task_main(record_rx, session_output));

    let (transport_events_tx, mut transport_events_rx) = mpsc::channel(32);
    let (transport, link_task) =
        serial_link::serial_transport(port_path, config.link.baud_rate, transport_events_tx);
    let mut link_handle = tokio::spawn(link_task);
    let session = LinkSession::new(transport, config.link.ack_timeout());

    let mut udp_framed_recv = udp_handling::setup_udp(&cli.udp_addr).await?;

    let (status_tx, _status_rx) = watch::channel(LauncherStatus {
        link_state: session.state(),
        planner: CommandPlanner::new(config.court, &config.planner)?.snapshot(),
        calibration: CalibrationStatus::Uncalibrated,
        position: None,
    });

    let mut coordinator = RallieCoordinator::new(&config, session, record_tx, status_tx)?;

    let mut reconnect_tick = tokio::time::interval(config.link.reconnect_interval());
    reconnect_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut slow_tick = tokio::time::interval(std::time::Duration::from_millis(1000));
    slow_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    // Main loop.
    loop {
        let deadline = coordinator.next_deadline();
        // Wait for any of a number of things to happen
        tokio::select! {
            saver_result = &mut saver_handle => {
                saver_result??;
                break;
            }
            link_result = &mut link_handle => {
                link_result??;
                break;
            }
            udp_msg = udp_framed_recv.next() => {
                let udp_msg = udp_msg.ok_or_else(|| eyre::eyre!("UDP channel closed"))?;
                coordinator.on_udp_msg(udp_msg, Instant::now())?;
            }
            event = transport_events_rx.recv() => {
                let event = event.ok_or_else(|| eyre::eyre!("transport event channel closed"))?;
                coordinator.on_transport_event(event, Instant::now())?;
            }
            _ = sleep_until(deadline) => {
                coordinator.on_ack_deadline(Instant::now())?;
            }
            _ = reconnect_tick.tick() => {
                coordinator.on_reconnect_tick()?;
            }
            _ = slow_tick.tick() => {
                coordinator.on_slow_tick();
            }
            result = &mut ctrl_c => {
                result?;
                log::info!("interrupted, stopping");
                break;
            }
        };
    }

    coordinator.shutdown()?;
    drop(coordinator);
    drop(write_closer);
    if !saver_handle.is_finished() {
        saver_handle.await??;
    }
    Ok(())
}
