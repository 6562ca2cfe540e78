//! gridpool CLI - Selenium endpoint pool orchestrator.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use gridpool::app::App;
use gridpool::config::{self, ProviderConfig};

#[derive(Parser)]
#[command(name = "gridpool")]
#[command(about = "Selenium endpoint pool orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "gridpool.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover platforms and serve the pool until interrupted
    Serve,

    /// Discover platforms, print them, and exit
    Platforms,

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Backend type (docker, kvm, openstack)
        #[arg(short, long, default_value = "docker")]
        backend: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Serve => serve(&cli.config).await,
        Commands::Platforms => platforms(&cli.config).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { backend } => init_config(&backend),
    }
}

async fn serve(config_path: &Path) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    info!("Loaded configuration from {}", config_path.display());

    let app = App::start(config).await?;
    info!("pool is up; waiting for shutdown signal");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    app.stop().await;
    Ok(())
}

async fn platforms(config_path: &Path) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let app = App::start(config).await?;
    for name in app.catalog().names() {
        let limit = app.catalog().get_limit(&name);
        println!("{} (limit: {})", name, limit);
    }
    app.stop().await;
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Selenium port: {}", config.pool.selenium_port);
            println!("  Agent port: {}", config.pool.agent_port);
            println!("  Ping timeout: {}s", config.pool.ping_timeout_secs);
            println!("  Session timeout: {}s", config.pool.session_timeout_secs);
            println!("  Get VM timeout: {}s", config.pool.get_vm_timeout_secs);

            for provider in &config.provider {
                let name = match provider {
                    ProviderConfig::Docker(_) => "docker",
                    ProviderConfig::Kvm(_) => "kvm",
                    ProviderConfig::Openstack(_) => "openstack",
                };
                println!("  Provider: {}", name);
            }
            println!("  Artifacts dir: {}", config.artifacts.dir.display());

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(backend: &str) -> Result<()> {
    let provider_config = match backend {
        "docker" => {
            r#"[[provider]]
type = "docker"
max_count = 10
preloaded = { "ubuntu-14.04-x64" = 1 }

[[provider.images]]
name = "ubuntu-14.04-x64"
image = "selenium/standalone-chrome:3.14"
browsers = { chrome = "58.333" }"#
        }
        "kvm" => {
            r#"[[provider]]
type = "kvm"
origins_dir = "/var/lib/libvirt/origins"
connection_uri = "qemu:///system"
ssh_user = "root"
max_count = 4

[provider.platforms."ubuntu-14.04-x64"]
chrome = "58.333""#
        }
        "openstack" => {
            r#"[[provider]]
type = "openstack"
flavor = "m1.medium"
image_prefix = "selenium-"
max_count = 8"#
        }
        _ => {
            eprintln!("Unknown backend: {}. Use: docker, kvm, openstack", backend);
            std::process::exit(1);
        }
    };

    let config = format!(
        r#"# gridpool configuration file

[pool]
selenium_port = 4455
agent_port = 9000
ping_timeout_secs = 180
session_timeout_secs = 360
get_vm_timeout_secs = 180
make_request_attempts = 3
preloader_frequency_secs = 3

{}

[artifacts]
dir = "artifacts"
workers = 4
wait_timeout_secs = 120
"#,
        provider_config
    );

    let path = Path::new("gridpool.toml");
    if path.exists() {
        eprintln!("gridpool.toml already exists, refusing to overwrite");
        std::process::exit(1);
    }
    std::fs::write(path, config).context("Failed to write gridpool.toml")?;
    println!("Wrote gridpool.toml");
    Ok(())
}
