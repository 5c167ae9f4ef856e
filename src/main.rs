use anyhow::{Context, Result};
use clap::Parser;
use cuewatch::auth::{CredentialManager, FileTokenStore};
use cuewatch::camera::{capture_device, enumerate_devices};
use cuewatch::{CuewatchApp, CuewatchConfig};
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser, Debug)]
#[command(name = "cuewatch")]
#[command(about = "Watches a video feed for match cues and runs stream predictions")]
#[command(version)]
#[command(long_about = "Cuewatch grabs frames from a capture device, matches them against \
reference images for the start, win and lose screens of a game, and opens, resolves or \
cancels a two-outcome prediction on the streaming service as rounds begin and end.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "cuewatch.toml", help = "Path to TOML configuration file")]
    config: String,

    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    #[arg(long, help = "Validate configuration file and exit without starting the system")]
    validate_config: bool,

    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    #[arg(long, value_name = "DIR", help = "Also write a daily-rotated log file into DIR")]
    log_dir: Option<String>,

    #[arg(long, help = "List available capture devices and exit")]
    list_devices: bool,

    #[arg(long, help = "Sign in to the streaming service through the browser and exit")]
    login: bool,

    #[arg(long, help = "Revoke and forget the stored session and exit")]
    logout: bool,

    #[arg(long, help = "Disable keyboard controls")]
    no_keyboard: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    let log_guard = init_logging(&args)?;

    info!("Starting cuewatch v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = CuewatchConfig::load_from_file(&args.config).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    match config.validate() {
        Ok(()) if args.validate_config => {
            info!("Configuration validation successful");
            println!("✓ Configuration is valid");
            return Ok(());
        }
        Ok(()) => {}
        Err(e) => {
            error!("Configuration validation failed: {}", e);
            eprintln!("✗ Configuration validation failed: {}", e);
            std::process::exit(1);
        }
    }

    if args.list_devices {
        return list_devices(&config).await;
    }

    if args.login || args.logout {
        let credentials = credential_manager(&config)?;
        if args.logout {
            credentials.logout().await;
            println!("Signed out");
        }
        if args.login {
            login(&credentials).await?;
        }
        return Ok(());
    }

    let mut app = CuewatchApp::new(config).map_err(|e| {
        error!("Failed to create application: {}", e);
        e
    })?;
    app.set_keyboard_enabled(!args.no_keyboard && std::io::stdin().is_terminal());

    app.initialize().await?;
    app.start().await.map_err(|e| {
        error!("Failed to start system: {}", e);
        e
    })?;

    let exit_code = app.run().await.map_err(|e| {
        error!("System error during execution: {}", e);
        e
    })?;

    info!("Cuewatch exited with code: {}", exit_code);
    drop(log_guard);
    std::process::exit(exit_code);
}

fn credential_manager(config: &CuewatchConfig) -> Result<CredentialManager> {
    let store = Arc::new(FileTokenStore::new(&config.auth.token_path));
    CredentialManager::new(
        &config.auth,
        &config.prediction.api_base_url,
        Duration::from_secs(config.prediction.request_timeout_seconds),
        store,
    )
    .context("Set auth.client_id and auth.client_secret (or CUEWATCH_AUTH__CLIENT_ID / CUEWATCH_AUTH__CLIENT_SECRET)")
}

async fn login(credentials: &CredentialManager) -> Result<()> {
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let identity = credentials
        .authenticate_interactive(&cancel, |url| {
            println!("Open this URL in a browser to sign in:\n\n  {}\n", url);
        })
        .await?;

    println!("✓ Signed in as {} ({})", identity.login, identity.user_id);
    Ok(())
}

async fn list_devices(config: &CuewatchConfig) -> Result<()> {
    let device = capture_device(config.camera.backend)?;
    let devices = enumerate_devices(device, config.camera.probe_limit).await;

    if devices.is_empty() {
        println!("No capture devices found");
    }
    for info in devices {
        println!("{:>3}  {}  {}x{}", info.index, info.name, info.width, info.height);
    }
    Ok(())
}

fn init_logging(args: &Args) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cuewatch={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    let (file_layer, guard) = match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "cuewatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(file_layer)
        .with(env_filter)
        .init();

    Ok(guard)
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    let defaults = toml::to_string_pretty(&CuewatchConfig::default())?;

    println!("# Cuewatch Configuration File");
    println!("# Client credentials are best supplied through CUEWATCH_AUTH__CLIENT_ID and");
    println!("# CUEWATCH_AUTH__CLIENT_SECRET rather than this file.");
    println!();
    println!("{}", defaults);
    println!("# Triggers are listed as [[triggers]] tables, for example:");
    println!("# [[triggers]]");
    println!("# kind = \"start\"");
    println!("# roi = {{ x = 40, y = 600, width = 320, height = 80 }}");
    println!("# threshold = 0.8");
    println!("# reference = \"cues/start.png\"");
    Ok(())
}
