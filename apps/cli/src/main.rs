use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use usbmgr_core::{
    KNOWN_DEVICES, NusbBackend, RegistryConfig, SessionRegistry, TracingObserver, UsbModule,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "USB instrument manager (nusb backend)", long_about = None)]
struct Args {
    /// Registry configuration (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the built-in device table
    Known,
    /// List known devices found at startup
    List,
    /// Rescan the bus for known devices
    Scan,
    /// Send a command and print the answer
    Query {
        /// Device name, as printed by `list`
        #[arg(long)]
        device: String,

        /// Command text, sent with the terminator appended
        #[arg(long)]
        command: String,

        /// Terminator for command and answer (escapes: \r \n \t \\)
        #[arg(long, default_value = "\\r")]
        terminator: String,

        /// Longest accepted answer in bytes
        #[arg(long, default_value_t = 256)]
        max_len: usize,

        /// Overall answer timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Write the effective configuration as TOML
    DumpConfig {
        /// Output file
        path: PathBuf,
    },
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => RegistryConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RegistryConfig::default(),
    };

    match args.command {
        Command::Known => {
            for descriptor in KNOWN_DEVICES.iter().chain(config.extra_devices.iter()) {
                println!("{descriptor}");
            }
        }
        Command::DumpConfig { path } => {
            config.save_to_file(&path)?;
            info!(path = %path.display(), "Configuration written");
        }
        Command::List => {
            let module = load_module(&config)?;
            for device in module.available_devices() {
                println!("{}\t{}", device.name, device.description);
            }
        }
        Command::Scan => {
            let module = load_module(&config)?;
            for name in module.registry().rescan()? {
                println!("{name}");
            }
        }
        Command::Query {
            device,
            command,
            terminator,
            max_len,
            timeout_ms,
        } => {
            if let Some(ms) = timeout_ms {
                config.receive_timeout_ms = ms;
            }
            let terminator = unescape(&terminator);
            let registry = SessionRegistry::from_config(
                Arc::new(NusbBackend::new()),
                &config,
                Arc::new(TracingObserver),
            )?;
            let handle = registry.acquire(&device)?;
            handle.purge()?;
            let answer = handle.query(&command, &terminator, max_len)?;
            println!("{answer}");
            info!(device = %device, "Query complete");
        }
    }

    Ok(())
}

fn load_module(config: &RegistryConfig) -> Result<UsbModule> {
    Ok(UsbModule::initialize(
        Arc::new(NusbBackend::new()),
        config,
        Arc::new(TracingObserver),
    )?)
}

/// Expand `\r`, `\n`, `\t` and `\\` typed on the command line.
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
