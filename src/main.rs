use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use humantime::parse_rfc3339;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

use wscast::config::Configuration;
use wscast::events::{ControlCommand, ControlRequest};
use wscast::platform::foreground::system_foreground;
use wscast::platform::screen::{PrimaryMonitor, ScreenSource};
use wscast::processing::color::{ColorReducer, ColorSample};
use wscast::schedule::SunScheduler;
use wscast::tasks;
use wscast::tasks::runtime::{Runtime, RuntimeOptions};

#[derive(Debug, Parser)]
#[command(
    name = "wscast",
    version,
    about = "Mirror the screen's dominant colors onto a network LED strip"
)]
struct Args {
    /// Path to YAML config
    #[arg(value_name = "CONFIG")]
    config: PathBuf,
    /// Freeze the clock used for the night window at this RFC 3339 instant
    #[arg(long = "now", value_name = "RFC3339")]
    now: Option<String>,
    /// Log today's sunrise/sunset and the next recompute at startup
    #[arg(long = "verbose-sun")]
    verbose_sun: bool,
    /// Capture and reduce a single frame, log the colors and exit
    #[arg(long = "capture-test")]
    capture_test: bool,
    /// Engage manual mode immediately
    #[arg(long)]
    manual: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // init tracing (RUST_LOG controls level, default = info)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let Args {
        config,
        now,
        verbose_sun,
        capture_test,
        manual,
    } = Args::parse();

    let now_override: Option<DateTime<Utc>> = match now {
        Some(ts) => Some(parse_rfc3339(&ts).context("failed to parse --now")?.into()),
        None => None,
    };

    let cfg = Configuration::from_yaml_file(&config)
        .with_context(|| format!("failed to load configuration from {}", config.display()))?
        .validated()
        .context("invalid configuration values")?;
    tracing::info!(
        "Loaded configuration from {}:\n{:#?}",
        config.display(),
        cfg
    );

    if verbose_sun {
        log_sun_timeline(&cfg, now_override.unwrap_or_else(Utc::now));
    }

    if capture_test {
        return run_capture_test(&cfg).await;
    }

    let (control_tx, control_rx) = mpsc::channel::<ControlRequest>(16); // Control socket/signals -> Runtime
    let cancel = CancellationToken::new();

    // Ctrl-D/Ctrl-C stop the runtime
    if io::stdin().is_terminal() {
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let mut sink = Vec::new();
            match io::stdin().read_to_end(&mut sink) {
                Ok(_) => tracing::info!("stdin closed; initiating shutdown"),
                Err(err) => tracing::warn!("stdin watcher failed: {err}"),
            }
            cancel.cancel();
        });
    } else {
        tracing::debug!("stdin is not a terminal; skipping shutdown watcher");
    }

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("ctrl-c handler failed: {err}");
                return;
            }
            tracing::info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    #[cfg(unix)]
    {
        let cancel = cancel.clone();
        let control = control_tx.clone();
        tokio::spawn(async move {
            match signal(SignalKind::user_defined1()) {
                Ok(mut sigusr1) => loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        received = sigusr1.recv() => {
                            if received.is_none() {
                                break;
                            }
                            tracing::info!("SIGUSR1 received; toggling manual mode");
                            let request = ControlRequest::fire_and_forget(ControlCommand::ToggleManual);
                            if let Err(err) = control.send(request).await {
                                tracing::warn!("failed to forward manual toggle request: {err}");
                                break;
                            }
                        }
                    }
                },
                Err(err) => tracing::warn!("failed to register SIGUSR1 handler: {err}"),
            }
        });
    }

    let runtime = Runtime::new(
        cfg.clone(),
        Box::new(PrimaryMonitor),
        system_foreground(),
        RuntimeOptions {
            now_override,
            engage_manual: manual,
        },
    );

    let mut tasks = JoinSet::new();

    // Status (notifications + preview file)
    tasks.spawn({
        let status_rx = runtime.subscribe_status();
        let preview_rx = runtime.subscribe_preview();
        let activity_rx = runtime.subscribe_activity();
        let preview_path = cfg.preview_path.clone();
        let cancel = cancel.clone();
        async move {
            tasks::status::run(status_rx, preview_rx, activity_rx, preview_path, cancel)
                .await
                .context("status task failed")
        }
    });

    // Control socket
    tasks.spawn({
        let path = cfg.control_socket_path.clone();
        let control_tx = control_tx.clone();
        let cancel = cancel.clone();
        async move {
            tasks::control::run(path, control_tx, cancel)
                .await
                .context("control task failed")
        }
    });
    drop(control_tx);

    // Runtime (owns the controller connection)
    tasks.spawn({
        let cancel = cancel.clone();
        async move {
            let result = runtime
                .run(control_rx, cancel.clone())
                .await
                .context("runtime task failed");
            // Nothing left to present once the runtime is gone
            cancel.cancel();
            result
        }
    });

    // Drain JoinSet (wait for all tasks to complete)
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("task error: {e:?}"),
            Err(e) => tracing::error!("join error: {e}"),
        }
    }

    Ok(())
}

fn log_sun_timeline(cfg: &Configuration, now: DateTime<Utc>) {
    let scheduler = SunScheduler::new(
        cfg.schedule.location(),
        cfg.schedule.resolved_timezone(),
        now,
    );
    let state = if scheduler.is_night(now) { "night" } else { "day" };
    tracing::info!(
        timezone = %scheduler.timezone(),
        state,
        night_only = cfg.schedule.night_only,
        local_time = %now.with_timezone(&scheduler.timezone()).to_rfc3339(),
        "sun schedule snapshot"
    );
    tracing::info!(
        next_recompute = %scheduler.next_recompute_at(now).to_rfc3339(),
        "sun window recompute planned"
    );
}

async fn run_capture_test(cfg: &Configuration) -> Result<()> {
    let options = cfg.sampling.reducer_options();
    let seed = cfg.sampling.seed;
    let reduction = tokio::task::spawn_blocking(move || -> Result<_> {
        let frame = PrimaryMonitor.capture().context("screen capture failed")?;
        tracing::info!(width = frame.width(), height = frame.height(), "frame captured");
        let reduction = ColorReducer::new(options, seed)
            .reduce(&frame)
            .context("color reduction failed")?;
        Ok(reduction)
    })
    .await
    .context("capture-test worker panicked")??;

    match &reduction.sample {
        ColorSample::Static(color) => tracing::info!(?color, "static color"),
        ColorSample::Regional(colors) => {
            for (band, color) in colors.iter().enumerate() {
                tracing::info!(band, ?color, "region color");
            }
        }
    }

    if let Some(path) = cfg.preview_path.clone() {
        let preview = reduction.preview;
        tokio::task::spawn_blocking(move || tasks::status::write_preview(&path, &preview))
            .await
            .context("preview writer panicked")??;
        tracing::info!("palette preview written");
    }
    Ok(())
}
