//! tcp-redirect: transparent TCP redirect inbound
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! ./tcp-redirect
//!
//! # Run with custom configuration
//! ./tcp-redirect -c /path/to/config.json
//!
//! # Run with environment overrides
//! TCP_REDIRECT_LOG_LEVEL=debug ./tcp-redirect
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use tcp_redirect::config::{load_config_with_env, Config};
use tcp_redirect::redirect::RedirectListenerBuilder;
use tcp_redirect::tunnel::DirectTunnel;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/tcp-redirect/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("tcp-redirect v{}", tcp_redirect::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"tcp-redirect v{}

Transparent TCP redirect inbound (iptables REDIRECT + SO_ORIGINAL_DST).

USAGE:
    tcp-redirect [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/tcp-redirect/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    TCP_REDIRECT_LISTEN_ADDR         Override listen address
    TCP_REDIRECT_LOG_LEVEL           Override log level (trace, debug, info, warn, error)
    TCP_REDIRECT_IDLE_TIMEOUT_SECS   Override session idle timeout
    TCP_REDIRECT_ROUTING_MARK        Override upstream SO_MARK (decimal or 0x hex)

EXAMPLE:
    iptables -t nat -A OUTPUT -p tcp -m mark --mark 0xff -j RETURN
    iptables -t nat -A OUTPUT -p tcp -d 127.0.0.0/8 -j RETURN
    iptables -t nat -A OUTPUT -p tcp -j REDIRECT --to-ports 7892

    TCP_REDIRECT_ROUTING_MARK=0xff tcp-redirect -c /etc/tcp-redirect/config.json
"#,
        tcp_redirect::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        tcp_redirect::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration from {:?}: {}",
            args.config_path,
            e
        )
    })?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("tcp-redirect v{}", tcp_redirect::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let tunnel = Arc::new(DirectTunnel::from_config(&config.session));

    let listener = RedirectListenerBuilder::from_config(&config, tunnel)
        .on_connect(|client, dst| {
            info!(%client, %dst, "TCP redirect request");
        })
        .on_error(|client, dst, err| match err {
            None => info!(%client, %dst, "TCP redirect closed"),
            Some(e) => warn!(%client, %dst, error = %e, "TCP redirect error"),
        })
        .bind()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create redirect listener: {}", e))?;

    let result = tokio::select! {
        result = listener.serve() => result,
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
            Ok(())
        }
        () = wait_for_sigterm() => {
            info!("Received SIGTERM, shutting down");
            Ok(())
        }
    };

    result.map_err(|e| anyhow::anyhow!("Accept loop error: {}", e))
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
