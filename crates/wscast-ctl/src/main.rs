use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono_tz::Tz;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use wscast::activation::DetectionMode;
use wscast::config::DEFAULT_CONTROL_SOCKET_PATH;
use wscast::events::{ControlCommand, ControlReply};
use wscast::processing::color::OutputMode;

#[derive(Debug, Parser)]
#[command(name = "wscast-ctl", about = "Send runtime commands to a running wscast")]
struct Args {
    /// wscast control socket.
    #[arg(long, default_value = DEFAULT_CONTROL_SOCKET_PATH)]
    socket: PathBuf,

    /// Seconds to wait for the reply.
    #[arg(long, default_value_t = 5)]
    timeout_secs: u64,

    /// Logging level (error|warn|info|debug|trace).
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Flip manual mode on or off.
    Toggle,
    /// Engage or release manual mode explicitly.
    Manual { state: Switch },
    /// Select the detection mode.
    Mode { mode: ModeArg },
    /// Select static or per-region output.
    Output { mode: OutputArg },
    /// Sampling period, e.g. `200ms`.
    Interval { interval: humantime::Duration },
    /// Saturation multiplier applied before clustering.
    Saturation { factor: f32 },
    /// Strip brightness in percent.
    Brightness { percent: f32 },
    /// Controller address as four octets.
    Endpoint {
        #[arg(num_args = 4, value_names = ["A", "B", "C", "D"])]
        octets: Vec<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Location used for sunrise/sunset.
    Location {
        #[arg(allow_negative_numbers = true)]
        latitude: f64,
        #[arg(allow_negative_numbers = true)]
        longitude: f64,
    },
    /// Pin a timezone; omit to follow the host again.
    Timezone { timezone: Option<String> },
    /// Restrict fullscreen detection to the night window.
    NightOnly { state: Switch },
    /// Print the current runtime status.
    Status,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

impl Switch {
    fn enabled(self) -> bool {
        matches!(self, Self::On)
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Off,
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputArg {
    Static,
    Regional,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let command = to_control_command(&args.command)?;
    let reply = send(&args.socket, &command, Duration::from_secs(args.timeout_secs))?;
    if let Some(status) = &reply.status {
        println!("{}", serde_json::to_string_pretty(status)?);
    }
    if !reply.ok {
        bail!(
            "{}",
            reply.error.unwrap_or_else(|| "command rejected".to_string())
        );
    }
    Ok(())
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::builder()
        .parse(level)
        .with_context(|| format!("invalid log level '{level}'"))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn to_control_command(command: &Command) -> Result<ControlCommand> {
    Ok(match command {
        Command::Toggle => ControlCommand::ToggleManual,
        Command::Manual { state } => ControlCommand::SetManual {
            engaged: state.enabled(),
        },
        Command::Mode { mode } => ControlCommand::SetDetectionMode {
            mode: match mode {
                ModeArg::Off => DetectionMode::Off,
                ModeArg::Auto => DetectionMode::Auto,
                ModeArg::Manual => DetectionMode::Manual,
            },
        },
        Command::Output { mode } => ControlCommand::SetOutputMode {
            mode: match mode {
                OutputArg::Static => OutputMode::Static,
                OutputArg::Regional => OutputMode::Regional,
            },
        },
        Command::Interval { interval } => ControlCommand::SetSamplingInterval {
            interval: **interval,
        },
        Command::Saturation { factor } => ControlCommand::SetSaturation { factor: *factor },
        Command::Brightness { percent } => ControlCommand::SetBrightness { percent: *percent },
        Command::Endpoint { octets, port } => ControlCommand::SetEndpoint {
            octets: octets.clone(),
            port: *port,
        },
        Command::Location {
            latitude,
            longitude,
        } => ControlCommand::SetLocation {
            latitude: *latitude,
            longitude: *longitude,
        },
        Command::Timezone { timezone } => ControlCommand::SetTimezone {
            timezone: timezone
                .as_deref()
                .map(|name| {
                    name.parse::<Tz>()
                        .map_err(|err| anyhow::anyhow!("unknown timezone '{name}': {err}"))
                })
                .transpose()?,
        },
        Command::NightOnly { state } => ControlCommand::SetNightOnly {
            enabled: state.enabled(),
        },
        Command::Status => ControlCommand::Status,
    })
}

fn send(socket: &Path, command: &ControlCommand, timeout: Duration) -> Result<ControlReply> {
    let mut stream = UnixStream::connect(socket).with_context(|| {
        format!(
            "failed to connect to control socket at {}",
            socket.display()
        )
    })?;
    stream
        .set_read_timeout(Some(timeout))
        .context("failed to set reply timeout")?;

    let mut line = serde_json::to_vec(command).context("failed to encode command")?;
    line.push(b'\n');
    debug!(request = %String::from_utf8_lossy(&line).trim_end(), "sending control request");
    stream
        .write_all(&line)
        .context("failed to send control command")?;

    let mut reply = String::new();
    BufReader::new(&stream)
        .read_line(&mut reply)
        .context("failed to read control reply")?;
    if reply.trim().is_empty() {
        bail!("control socket closed without replying");
    }
    serde_json::from_str(&reply).context("malformed control reply")
}
