use std::net::SocketAddrV4;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use image::RgbaImage;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::activation::{ActivationController, ConnectReason, Directive, DisconnectReason};
use crate::config::Configuration;
use crate::connection::{Connection, ConnectionState, parse_octets};
use crate::error::CaptureError;
use crate::events::{ControlCommand, ControlReply, ControlRequest, StatusSnapshot};
use crate::platform::foreground::ForegroundSource;
use crate::platform::screen::ScreenSource;
use crate::processing::color::{ColorReducer, Reduction};
use crate::protocol::{DeviceCommand, brightness_level};
use crate::schedule::{Location, SunScheduler};

/// Consecutive capture failures before the log escalates to a warning.
const CAPTURE_FAILURE_WARN_AFTER: u32 = 25;

#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    /// Freezes the clock used for the night window.
    pub now_override: Option<DateTime<Utc>>,
    /// Engage manual mode as soon as the loop starts.
    pub engage_manual: bool,
}

enum Event {
    Control(ControlRequest),
    NightCheck,
    FullscreenPoll,
    Sample,
    Recompute,
}

struct Timers {
    sampling: Interval,
    fullscreen: Interval,
    night: Interval,
    recompute: Pin<Box<Sleep>>,
}

fn delayed_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Owns the controller, the connection and the sun scheduler.
///
/// All mutation happens on the task that drives [`Runtime::run`]; the
/// presentation layer only sees the watch channels.
pub struct Runtime {
    cfg: Configuration,
    controller: ActivationController,
    connection: Connection,
    scheduler: SunScheduler,
    screen: Arc<Mutex<Box<dyn ScreenSource>>>,
    reducer: Arc<Mutex<ColorReducer>>,
    foreground: Box<dyn ForegroundSource>,
    timers: Timers,
    options: RuntimeOptions,
    capture_failures: u32,
    status_tx: watch::Sender<StatusSnapshot>,
    preview_tx: watch::Sender<Option<Arc<RgbaImage>>>,
}

impl Runtime {
    pub fn new(
        cfg: Configuration,
        screen: Box<dyn ScreenSource>,
        foreground: Box<dyn ForegroundSource>,
        options: RuntimeOptions,
    ) -> Self {
        let now = options.now_override.unwrap_or_else(Utc::now);
        let scheduler = SunScheduler::new(
            cfg.schedule.location(),
            cfg.schedule.resolved_timezone(),
            now,
        );
        let night = !cfg.schedule.night_only || scheduler.is_night(now);
        let controller = ActivationController::new(cfg.detection.mode, night);
        let reducer = ColorReducer::new(cfg.sampling.reducer_options(), cfg.sampling.seed);

        let timers = Timers {
            sampling: delayed_interval(cfg.sampling.interval),
            fullscreen: delayed_interval(cfg.detection.poll_interval),
            night: delayed_interval(cfg.schedule.check_interval),
            recompute: Box::pin(tokio::time::sleep_until(recompute_deadline(&scheduler, now))),
        };

        let connection = Connection::new();
        let snapshot = build_snapshot(&cfg, &controller, &connection, &scheduler);
        Self {
            cfg,
            controller,
            connection,
            scheduler,
            screen: Arc::new(Mutex::new(screen)),
            reducer: Arc::new(Mutex::new(reducer)),
            foreground,
            timers,
            options,
            capture_failures: 0,
            status_tx: watch::channel(snapshot).0,
            preview_tx: watch::channel(None).0,
        }
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_preview(&self) -> watch::Receiver<Option<Arc<RgbaImage>>> {
        self.preview_tx.subscribe()
    }

    /// Ticks once per frame successfully written to the controller.
    pub fn subscribe_activity(&self) -> watch::Receiver<u64> {
        self.connection.subscribe_activity()
    }

    #[instrument(name = "runtime", skip_all)]
    pub async fn run(
        mut self,
        mut control_rx: mpsc::Receiver<ControlRequest>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!(
            mode = %self.controller.mode(),
            state = ?self.controller.state(),
            night = self.controller.night_active(),
            "runtime started"
        );
        if self.options.engage_manual {
            let directive = self.controller.set_manual(true);
            self.execute(directive).await;
        }
        self.publish_status();

        let mut control_open = true;
        loop {
            let sampling = self.connection.is_connected();
            let polling = self.controller.polling_armed();
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                request = control_rx.recv(), if control_open => match request {
                    Some(request) => Event::Control(request),
                    None => {
                        debug!("control channel closed");
                        control_open = false;
                        continue;
                    }
                },
                _ = self.timers.night.tick() => Event::NightCheck,
                _ = &mut self.timers.recompute => Event::Recompute,
                _ = self.timers.fullscreen.tick(), if polling => Event::FullscreenPoll,
                _ = self.timers.sampling.tick(), if sampling => Event::Sample,
            };

            match event {
                Event::Control(request) => self.handle_control(request).await,
                Event::NightCheck => self.check_night().await,
                Event::FullscreenPoll => self.poll_fullscreen().await,
                Event::Sample => self.sample_once().await,
                Event::Recompute => {
                    let now = self.now();
                    self.scheduler.recompute(now);
                    self.reschedule_recompute(now);
                    self.check_night().await;
                }
            }
            self.publish_status();
        }

        let directive = self.controller.shutdown();
        self.execute(directive).await;
        self.connection.disconnect().await;
        self.publish_status();
        info!("runtime stopped");
        Ok(())
    }

    fn now(&self) -> DateTime<Utc> {
        self.options.now_override.unwrap_or_else(Utc::now)
    }

    fn night_now(&self) -> bool {
        !self.cfg.schedule.night_only || self.scheduler.is_night(self.now())
    }

    async fn check_night(&mut self) {
        let night = self.night_now();
        let directive = self.controller.observe_night(night);
        self.execute(directive).await;
    }

    async fn poll_fullscreen(&mut self) {
        let window = self.foreground.inspect();
        debug!(
            fullscreen = window.fullscreen,
            title = window.title.as_deref().unwrap_or(""),
            "foreground polled"
        );
        let directive = self
            .controller
            .observe_fullscreen(window.fullscreen, window.title.as_deref());
        self.execute(directive).await;
    }

    async fn sample_once(&mut self) {
        let screen = Arc::clone(&self.screen);
        let reducer = Arc::clone(&self.reducer);
        let outcome = tokio::task::spawn_blocking(move || -> Result<Reduction, CaptureError> {
            let frame = screen
                .lock()
                .map_err(|_| CaptureError::Task("screen source poisoned".into()))?
                .capture()?;
            let reduction = reducer
                .lock()
                .map_err(|_| CaptureError::Task("reducer poisoned".into()))?
                .reduce(&frame)?;
            Ok(reduction)
        })
        .await
        .unwrap_or_else(|err| Err(CaptureError::Task(err.to_string())));

        let reduction = match outcome {
            Ok(reduction) => {
                self.capture_failures = 0;
                reduction
            }
            Err(err) => {
                self.capture_failures += 1;
                if self.capture_failures == CAPTURE_FAILURE_WARN_AFTER {
                    warn!(
                        failures = self.capture_failures,
                        "screen sampling keeps failing: {err}"
                    );
                } else {
                    debug!(failures = self.capture_failures, "sampling tick skipped: {err}");
                }
                return;
            }
        };

        // Activation may have been torn down while the capture was in flight.
        if !self.connection.is_connected() {
            return;
        }
        let command = reduction.sample.to_command();
        if self.send(&command).await {
            self.preview_tx.send_replace(Some(Arc::new(reduction.preview)));
        }
    }

    /// Returns `false` when the write failed and the session was torn down.
    async fn send(&mut self, command: &DeviceCommand) -> bool {
        match self.connection.send(command).await {
            Ok(()) => true,
            Err(err) => {
                warn!(opcode = command.opcode(), "send failed: {err}");
                self.connection.disconnect().await;
                self.controller.connection_lost(err.to_string());
                false
            }
        }
    }

    async fn execute(&mut self, directive: Directive) {
        match directive {
            Directive::Stay => {}
            Directive::Connect(reason) => self.connect(reason).await,
            Directive::Disconnect(reason) => self.disconnect(reason).await,
        }
    }

    async fn connect(&mut self, reason: ConnectReason) {
        let Some(endpoint) = self.cfg.device.endpoint() else {
            warn!(?reason, "activation requested but no controller address is configured");
            self.controller
                .connect_failed(reason, "No controller address configured.");
            return;
        };
        match self
            .connection
            .connect(endpoint, self.cfg.device.connect_timeout)
            .await
        {
            Ok(()) => {
                self.controller.connect_succeeded(reason);
                self.timers.sampling.reset();
                self.capture_failures = 0;
                let level = brightness_level(self.cfg.brightness_percent);
                if self.send(&DeviceCommand::SetBrightness(level)).await {
                    info!(?reason, %endpoint, brightness = level, "activation engaged");
                }
            }
            Err(err) => {
                warn!(?reason, %endpoint, "activation failed: {err}");
                self.controller.connect_failed(reason, err.to_string());
            }
        }
    }

    async fn disconnect(&mut self, reason: DisconnectReason) {
        self.connection.disconnect().await;
        self.controller.disconnected();
        info!(?reason, "activation released");
    }

    async fn handle_control(&mut self, request: ControlRequest) {
        let ControlRequest { command, reply } = request;
        debug!(?command, "control command received");
        let outcome = self.apply(command).await;
        self.publish_status();
        let response = match outcome {
            Ok(()) => ControlReply::success(&self.status_tx.borrow()),
            Err(err) => {
                warn!("control command rejected: {err:#}");
                ControlReply::failure(format!("{err:#}"))
            }
        };
        if let Some(reply) = reply {
            let _ = reply.send(response);
        }
    }

    async fn apply(&mut self, command: ControlCommand) -> Result<()> {
        match command {
            ControlCommand::ToggleManual => {
                let directive = self.controller.toggle_manual();
                self.execute(directive).await;
            }
            ControlCommand::SetManual { engaged } => {
                let directive = self.controller.set_manual(engaged);
                self.execute(directive).await;
            }
            ControlCommand::SetDetectionMode { mode } => {
                let directive = self.controller.set_mode(mode);
                self.execute(directive).await;
            }
            ControlCommand::SetOutputMode { mode } => {
                self.cfg.sampling.output_mode = mode;
                self.with_reducer(|reducer| reducer.set_output_mode(mode))?;
            }
            ControlCommand::SetSamplingInterval { interval } => {
                anyhow::ensure!(!interval.is_zero(), "sampling interval must be positive");
                self.cfg.sampling.interval = interval;
                self.timers.sampling = delayed_interval(interval);
                self.timers.sampling.reset();
            }
            ControlCommand::SetSaturation { factor } => {
                anyhow::ensure!(
                    factor.is_finite() && factor >= 0.0,
                    "saturation factor must be non-negative"
                );
                self.cfg.sampling.saturation_factor = factor;
                self.with_reducer(|reducer| reducer.set_saturation_factor(factor))?;
            }
            ControlCommand::SetBrightness { percent } => {
                anyhow::ensure!(
                    percent.is_finite() && (0.0..=100.0).contains(&percent),
                    "brightness must be within 0-100"
                );
                self.cfg.brightness_percent = percent;
                if self.connection.is_connected() {
                    self.send(&DeviceCommand::SetBrightness(brightness_level(percent)))
                        .await;
                }
            }
            ControlCommand::SetEndpoint { octets, port } => {
                anyhow::ensure!(
                    !self.connection.is_connected(),
                    "endpoint cannot change while connected"
                );
                let address = parse_octets(&octets)?;
                self.cfg.device.address = Some(address);
                if let Some(port) = port {
                    anyhow::ensure!(port > 0, "port must be non-zero");
                    self.cfg.device.port = port;
                }
                info!(endpoint = %SocketAddrV4::new(address, self.cfg.device.port), "controller endpoint updated");
            }
            ControlCommand::SetLocation {
                latitude,
                longitude,
            } => {
                let location = Location {
                    latitude,
                    longitude,
                };
                anyhow::ensure!(location.is_valid(), "location out of range: {location}");
                self.cfg.schedule.latitude = latitude;
                self.cfg.schedule.longitude = longitude;
                let now = self.now();
                self.scheduler.set_location(location, now);
                self.reschedule_recompute(now);
                self.check_night().await;
            }
            ControlCommand::SetTimezone { timezone } => {
                self.cfg.schedule.timezone = timezone;
                let now = self.now();
                self.scheduler
                    .set_timezone(self.cfg.schedule.resolved_timezone(), now);
                self.reschedule_recompute(now);
                self.check_night().await;
            }
            ControlCommand::SetNightOnly { enabled } => {
                self.cfg.schedule.night_only = enabled;
                self.check_night().await;
            }
            ControlCommand::Status => {}
        }
        Ok(())
    }

    fn with_reducer(&self, update: impl FnOnce(&mut ColorReducer)) -> Result<()> {
        let mut reducer = self
            .reducer
            .lock()
            .map_err(|_| anyhow::anyhow!("reducer poisoned"))?;
        update(&mut reducer);
        Ok(())
    }

    fn reschedule_recompute(&mut self, now: DateTime<Utc>) {
        let deadline = recompute_deadline(&self.scheduler, now);
        self.timers.recompute.as_mut().reset(deadline);
    }

    fn publish_status(&self) {
        let snapshot = build_snapshot(
            &self.cfg,
            &self.controller,
            &self.connection,
            &self.scheduler,
        );
        self.status_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

fn recompute_deadline(scheduler: &SunScheduler, now: DateTime<Utc>) -> Instant {
    let next = scheduler.next_recompute_at(now).with_timezone(&Utc);
    let wait = (next - now).to_std().unwrap_or_default();
    debug!(next = %next, wait = ?wait, "next sun recompute scheduled");
    Instant::now() + wait
}

fn build_snapshot(
    cfg: &Configuration,
    controller: &ActivationController,
    connection: &Connection,
    scheduler: &SunScheduler,
) -> StatusSnapshot {
    let window = scheduler.window();
    StatusSnapshot {
        state: controller.state(),
        indicator: controller.indicator(),
        detection_mode: controller.mode(),
        output_mode: cfg.sampling.output_mode,
        connected: connection.is_connected(),
        night_active: controller.night_active(),
        night_only: cfg.schedule.night_only,
        fullscreen_detected: controller.fullscreen_detected(),
        status: controller.status().to_string(),
        attached_window: controller.attached_window().map(str::to_owned),
        endpoint: cfg.device.endpoint().map(|addr| addr.to_string()),
        peer: match connection.state() {
            ConnectionState::Connected { peer } => Some(peer.to_string()),
            ConnectionState::Disconnected => None,
        },
        brightness_percent: cfg.brightness_percent,
        sunrise: window.sunrise.to_rfc3339(),
        sunset: window.sunset.to_rfc3339(),
        timezone: scheduler.timezone().to_string(),
    }
}
