//! portbind CLI - Command-line interface
//!
//! Discover devices by PID, talk to them and watch their replies.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::bounded;
use portbind::cli::{format_body, format_report, print_exit_codes};
use portbind::config::{self, ConfigError};
use portbind::core::discovery::DiscoverySettings;
use portbind::core::probe::ProbeError;
use portbind::core::protocol::FrameError;
use portbind::core::transport::{list_ports, TransportError};
use portbind::core::worker::WorkerError;
use portbind::{
    AppConfig, BindError, BoundDevice, DeviceLink, DeviceSpec, DiscoveryCache, DiscoveryError,
    Error, ExitCodes, Liveness, OutputFormat, Pid, SerialProvider, ToExitCode,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// portbind CLI
#[derive(Parser, Debug)]
#[command(
    name = "portbind",
    version,
    about = "Find serial devices by the identity they report",
    long_about = None
)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "PORTBIND_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports
    ListPorts {
        /// Show detailed info
        #[arg(short, long)]
        detailed: bool,
    },

    /// Probe every port and print the PID to port mapping
    Discover {
        #[command(flatten)]
        probe: ProbeArgs,
    },

    /// Send one frame to a device
    Send {
        #[command(flatten)]
        target: TargetArgs,

        /// Opcode (decimal or 0x-hex)
        #[arg(short, long, value_parser = parse_byte)]
        opcode: u8,

        /// Body as hex
        #[arg(short = 'D', long, default_value = "")]
        data: String,

        /// Wait for and print the reply
        #[arg(short, long)]
        expect_reply: bool,

        #[command(flatten)]
        probe: ProbeArgs,
    },

    /// Poll a device until Ctrl-C
    Watch {
        #[command(flatten)]
        target: TargetArgs,

        /// Opcode to poll (decimal or 0x-hex)
        #[arg(short, long, value_parser = parse_byte)]
        opcode: u8,

        /// Body as hex
        #[arg(short = 'D', long, default_value = "")]
        data: String,

        /// Poll interval in milliseconds
        #[arg(short, long, default_value = "500")]
        interval_ms: u64,

        #[command(flatten)]
        probe: ProbeArgs,
    },

    /// Manage the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Print the exit code table
    ExitCodes,
}

#[derive(Args, Debug)]
struct ProbeArgs {
    /// Baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Probe timeout in milliseconds
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    /// Only probe ports containing this text
    #[arg(long)]
    include: Vec<String>,

    /// Never probe ports containing this text
    #[arg(long)]
    exclude: Vec<String>,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct TargetArgs {
    /// Device PID (decimal or 0x-hex)
    #[arg(short, long)]
    pid: Option<Pid>,

    /// Device name from the config file
    #[arg(long)]
    device: Option<String>,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective config
    Show,
    /// Print the config file path
    Path,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(digits) => u8::from_str_radix(digits, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid byte '{s}': {e}"))
}

fn init_tracing(cli: &Cli) {
    let default = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    // Machine-readable runs get machine-readable logs
    if cli.format == OutputFormat::Json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    let result = match &cli.command {
        Commands::ListPorts { detailed } => list_serial_ports(&cli, *detailed),
        Commands::Discover { probe } => discover(&cli, probe).await,
        Commands::Send {
            target,
            opcode,
            data,
            expect_reply,
            probe,
        } => send(&cli, target, *opcode, data, *expect_reply, probe).await,
        Commands::Watch {
            target,
            opcode,
            data,
            interval_ms,
            probe,
        } => watch(&cli, target, *opcode, data, *interval_ms, probe).await,
        Commands::Config { action } => handle_config(&cli, action),
        Commands::ExitCodes => {
            print_exit_codes();
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    macro_rules! code_of {
        ($cause:expr, $($ty:ty),+) => {
            $(if let Some(e) = $cause.downcast_ref::<$ty>() {
                return e.exit_code();
            })+
        };
    }

    for cause in err.chain() {
        code_of!(
            cause,
            Error,
            BindError,
            DiscoveryError,
            ProbeError,
            FrameError,
            TransportError,
            WorkerError,
            ConfigError
        );
        if cause.is::<hex::FromHexError>() {
            return ExitCodes::INVALID_ARGS;
        }
    }
    ExitCodes::ERROR
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    Ok(config)
}

fn discovery_settings(config: &AppConfig, probe: &ProbeArgs) -> DiscoverySettings {
    let mut settings = config.discovery_settings();
    if let Some(baud) = probe.baud {
        settings.baud_rate = baud;
    }
    if let Some(timeout_ms) = probe.timeout_ms {
        settings.timeout = Duration::from_millis(timeout_ms);
    }
    settings.include.extend(probe.include.iter().cloned());
    settings.exclude.extend(probe.exclude.iter().cloned());
    settings
}

fn device_spec(config: &AppConfig, target: &TargetArgs, probe: &ProbeArgs) -> anyhow::Result<DeviceSpec> {
    let spec = match (&target.pid, &target.device) {
        (_, Some(name)) => config.device(name)?,
        (Some(pid), None) => DeviceSpec::new(format!("pid-{pid}"), pid.clone())
            .baud_rate(config.serial.baud_rate)
            .timeout(Duration::from_millis(config.serial.timeout_ms)),
        (None, None) => bail!("either --pid or --device is required"),
    };
    let spec = match probe.baud {
        Some(baud) => spec.baud_rate(baud),
        None => spec,
    };
    Ok(spec)
}

fn list_serial_ports(cli: &Cli, detailed: bool) -> anyhow::Result<()> {
    let ports = list_ports()?;

    if ports.is_empty() {
        if !cli.quiet {
            println!("No serial ports found.");
        }
        return Ok(());
    }

    match cli.format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = ports
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "name": p.port_name,
                        "type": format!("{:?}", p.port_type)
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        _ => {
            if detailed {
                println!("Available Serial Ports:");
                println!("{:-<60}", "");
                for port in &ports {
                    println!("  {} [{:?}]", port.port_name, port.port_type);
                }
            } else {
                for port in &ports {
                    println!("{}", port.port_name);
                }
            }
        }
    }

    Ok(())
}

/// Discovery cache over the system's serial ports
fn serial_cache(config: &AppConfig, liveness: &Liveness) -> Arc<DiscoveryCache> {
    let provider = SerialProvider::with_template(config.serial_template());
    Arc::new(DiscoveryCache::new(Arc::new(provider), liveness.child()))
}

async fn discover(cli: &Cli, probe: &ProbeArgs) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    let settings = discovery_settings(&config, probe);
    let cache = serial_cache(&config, &Liveness::new());

    if !cli.quiet {
        eprintln!(
            "Probing ports at {} baud ({} ms timeout)...",
            settings.baud_rate,
            settings.timeout.as_millis()
        );
    }
    let report = cache.refresh_async(settings).await?;
    println!("{}", format_report(&report, cli.format));
    Ok(())
}

async fn send(
    cli: &Cli,
    target: &TargetArgs,
    opcode: u8,
    data: &str,
    expect_reply: bool,
    probe: &ProbeArgs,
) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    let settings = discovery_settings(&config, probe);
    let spec = device_spec(&config, target, probe)?;
    let body = hex::decode(data.replace(' ', "")).context("invalid --data")?;

    let liveness = Liveness::new();
    let cache = serial_cache(&config, &liveness);
    cache.refresh_async(settings).await?;

    if !cli.quiet {
        eprintln!("Sending opcode {:#04x} ({} byte body) to PID {}...", opcode, body.len(), spec.pid());
    }

    let (tx, rx) = bounded(1);
    let device = BoundDevice::bind(spec, &cache, liveness.child(), move |link: &mut DeviceLink| {
        let result = if expect_reply {
            link.request(opcode, &body).map(Some)
        } else {
            link.send(opcode, &body).map(|()| None)
        };
        let _ = tx.send(result);
        false
    })?;
    debug!("Bound to {}", device.port());

    let reason = tokio::task::spawn_blocking(move || device.join()).await??;
    debug!("Device loop ended: {}", reason);

    match rx.try_recv() {
        Ok(Ok(Some(reply))) => println!("{}", format_body(&reply, cli.format)),
        Ok(Ok(None)) => {}
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => bail!("device loop ended without sending"),
    }
    Ok(())
}

async fn watch(
    cli: &Cli,
    target: &TargetArgs,
    opcode: u8,
    data: &str,
    interval_ms: u64,
    probe: &ProbeArgs,
) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    let settings = discovery_settings(&config, probe);
    let spec = device_spec(&config, target, probe)?.interval(Duration::from_millis(interval_ms));
    let body = hex::decode(data.replace(' ', "")).context("invalid --data")?;

    let liveness = Liveness::new();
    let shutdown = liveness.clone();
    ctrlc::set_handler(move || shutdown.shutdown()).context("could not install Ctrl-C handler")?;

    let cache = serial_cache(&config, &liveness);
    cache.refresh_async(settings).await?;

    let format = cli.format;
    let device = BoundDevice::bind(spec, &cache, liveness.child(), move |link: &mut DeviceLink| {
        match link.request(opcode, &body) {
            Ok(reply) => println!("{}", format_body(&reply, format)),
            Err(FrameError::NoResponse) => debug!("{}: no reply", link.port()),
            Err(e) => {
                error!("{}: {}", link.port(), e);
                return link.is_connected();
            }
        }
        true
    })?;

    if !cli.quiet {
        eprintln!("Watching {} on {}. Press Ctrl+C to exit.", device.name(), device.port());
    }
    let reason = tokio::task::spawn_blocking(move || device.join()).await??;
    info!("Stopped watching: {}", reason);
    Ok(())
}

fn handle_config(cli: &Cli, action: &ConfigAction) -> anyhow::Result<()> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => config::config_path()?,
    };

    match action {
        ConfigAction::Show => {
            let config = load_config(cli)?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
                _ => print!("{}", toml::to_string_pretty(&config)?),
            }
        }
        ConfigAction::Path => println!("{}", path.display()),
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            let config = AppConfig::default();
            match &cli.config {
                Some(custom) => {
                    if let Some(dir) = custom.parent() {
                        std::fs::create_dir_all(dir)?;
                    }
                    config.save_to(custom)?;
                }
                None => config.save()?,
            }
            if !cli.quiet {
                println!("Wrote {}", path.display());
            }
        }
    }
    Ok(())
}
