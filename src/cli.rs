//! CLI entry point for the compliance transcription server.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "copernicus-audit")]
#[command(about = "Compliance transcription and audit server", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a config.toml, overriding the default project-dirs location.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    Serve {
        /// Override the configured bind host.
        #[arg(long)]
        host: Option<String>,
        /// Override the configured bind port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Inspect the effective configuration.
    Config {
        /// Print the resolved configuration as TOML.
        #[arg(long)]
        show: bool,
        /// Print the path the configuration was (or would be) loaded from.
        #[arg(long)]
        path: bool,
    },
    /// Check that uploads storage is writable and collaborator endpoints
    /// are configured sanely.
    Doctor,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.clone())?;
    init_logging(&config);

    match cli.command.unwrap_or(Commands::Serve { host: None, port: None }) {
        Commands::Serve { host, port } => {
            let mut config = config;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            print_banner(&config);
            crate::server::serve(config).await
        }
        Commands::Config { show, path } => {
            if path {
                println!("{}", crate::config::config_path()?.display());
            }
            if show || !path {
                println!("{}", toml::to_string_pretty(&config)?);
            }
            Ok(())
        }
        Commands::Doctor => run_doctor(&config).await,
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.logging.filter.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_banner(config: &Config) {
    println!("{}", crate::info());
    println!("listening on {}:{}", config.server.host, config.server.port);
}

async fn run_doctor(config: &Config) -> Result<()> {
    println!("uploads_dir: {}", config.persistence.uploads_dir.display());
    match crate::persistence::PersistenceService::new(&config.persistence.uploads_dir) {
        Ok(_) => println!("  [ok] writable"),
        Err(e) => println!("  [fail] {e}"),
    }

    println!("llm backend: {}", config.llm.base_url);
    check_reachable(&config.llm.base_url).await;

    println!("asr adapter ({}): {}", config.asr.mode, config.asr.base_url);
    check_reachable(&config.asr.base_url).await;

    if config.ocr.enabled {
        println!("ocr adapter: {}", config.ocr.base_url);
        check_reachable(&config.ocr.base_url).await;
    } else {
        println!("ocr adapter: disabled");
    }

    if config.face_detect.enabled {
        println!("face-detect adapter: {}", config.face_detect.base_url);
        check_reachable(&config.face_detect.base_url).await;
    } else {
        println!("face-detect adapter: disabled");
    }

    if config.csc.enabled {
        println!("csc adapter: {}", config.csc.base_url);
        check_reachable(&config.csc.base_url).await;
    } else {
        println!("csc adapter: disabled");
    }

    match which_ffmpeg(&config.video.ffmpeg_path) {
        Some(path) => println!("ffmpeg: found at {}", path.display()),
        None => println!("ffmpeg: not found on PATH ({})", config.video.ffmpeg_path),
    }

    Ok(())
}

async fn check_reachable(base_url: &str) {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(2))
        .build()
        .expect("reqwest client");
    match client.get(base_url).send().await {
        Ok(_) => println!("  [ok] reachable"),
        Err(e) => println!("  [warn] unreachable: {e}"),
    }
}

fn which_ffmpeg(configured: &str) -> Option<PathBuf> {
    let path = PathBuf::from(configured);
    if path.is_absolute() {
        return path.exists().then_some(path);
    }
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(configured))
            .find(|candidate| candidate.exists())
    })
}
