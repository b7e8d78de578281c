//! volmon CLI - inspect and watch removable and network volumes.
//!
//! `watch` runs the full engine: it tracks hotplug and mount table changes,
//! applies the automount policy and prints every volume event as a JSON line.
//! The other commands take a one-shot snapshot and never run a mount command.

mod signals;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use snafu::{ResultExt, Snafu};
use tracing::info;
use volmon_core::{
    HandlerAction, Monitor, PathLocator, RecordingRunner, Settings, ShellRunner, VolumeEvent,
    VolumeRegistry, netmount,
};

/// volmon CLI tool.
#[derive(Parser)]
#[command(name = "volmon")]
#[command(about = "Track and automount removable and network volumes", long_about = None)]
struct Cli {
    /// Settings file to use instead of the default location.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the current volumes.
    List {
        /// Include volumes hidden by the visibility settings.
        #[arg(long)]
        all: bool,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Track volumes until interrupted, printing events as JSON lines.
    Watch {
        /// Do not automount anything.
        #[arg(long)]
        no_automount: bool,
    },
    /// Print the command that would run for a volume, without running it.
    Resolve {
        /// Device file, mount point, URL or unique id.
        device: String,
        action: Action,
    },
    /// Split a network URL into its parts.
    Split { url: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum Action {
    Mount,
    Unmount,
    Info,
}

impl From<Action> for HandlerAction {
    fn from(action: Action) -> Self {
        match action {
            Action::Mount => HandlerAction::Mount,
            Action::Unmount => HandlerAction::Unmount,
            Action::Info => HandlerAction::Properties,
        }
    }
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("{source}"))]
    Core { source: volmon_core::Error },

    #[snafu(display("failed to encode JSON: {source}"))]
    Json { source: serde_json::Error },
}

type CliResult<T> = Result<T, CliError>;

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::List { all, json } => list(cli.config, all, json),
        Commands::Watch { no_automount } => watch(cli.config, !no_automount),
        Commands::Resolve { device, action } => resolve(cli.config, &device, action.into()),
        Commands::Split { url } => split(&url),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_settings(path: Option<PathBuf>) -> CliResult<Settings> {
    match path {
        Some(path) => Settings::load(&path),
        None => Settings::load_default(),
    }
    .context(CoreSnafu)
}

/// A registry that records commands instead of running them.
fn snapshot(config: Option<PathBuf>) -> CliResult<VolumeRegistry> {
    let settings = load_settings(config)?;
    let mut registry =
        VolumeRegistry::new(settings, Box::new(RecordingRunner::new()), Box::new(PathLocator));
    registry.init(false).context(CoreSnafu)?;
    Ok(registry)
}

fn list(config: Option<PathBuf>, all: bool, json: bool) -> CliResult<()> {
    let registry = snapshot(config)?;
    let volumes: Vec<_> = if all {
        registry.volumes().iter().collect()
    } else {
        registry.visible_volumes()
    };

    if json {
        let out = serde_json::to_string_pretty(&volumes).context(JsonSnafu)?;
        println!("{}", out);
        return Ok(());
    }

    for volume in volumes {
        let mount_point = volume
            .mount_point
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}\t{}\t{}\t{}",
            volume.device_file,
            mount_point,
            volume.fs_type.as_deref().unwrap_or("-"),
            volume.disp_name
        );
    }
    Ok(())
}

fn watch(config: Option<PathBuf>, automount: bool) -> CliResult<()> {
    let settings = load_settings(config)?;
    let runner = ShellRunner::new(settings.terminal.clone());
    let mut registry = VolumeRegistry::new(settings, Box::new(runner), Box::new(PathLocator));

    registry.subscribe(|event: &VolumeEvent| match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => eprintln!("Failed to encode event: {}", e),
    });
    registry.init(automount).context(CoreSnafu)?;

    let mut monitor = Monitor::open(registry.mount_table().path()).context(CoreSnafu)?;
    let stop = signals::install();
    info!("watching volumes, automount {}", if automount { "on" } else { "off" });
    let result = monitor.run(&mut registry, stop).context(CoreSnafu);

    registry.shutdown();
    result
}

fn resolve(config: Option<PathBuf>, device: &str, action: HandlerAction) -> CliResult<()> {
    let registry = snapshot(config)?;
    let resolved = registry
        .resolve_command(device, action)
        .context(CoreSnafu)?;

    println!("{}", resolved.command);
    if resolved.in_terminal {
        eprintln!("(runs in terminal, handler {})", resolved.handler);
    } else {
        eprintln!("(handler {})", resolved.handler);
    }
    Ok(())
}

fn split(url: &str) -> CliResult<()> {
    let net = netmount::split(url).context(CoreSnafu)?;
    let out = serde_json::to_string_pretty(&net).context(JsonSnafu)?;
    println!("{}", out);
    Ok(())
}
