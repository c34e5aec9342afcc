use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{error, info};
use path_proxy::config::Config;
use path_proxy::logging::{CustomLogger, init_fallback, parse_log_format, parse_log_level};
use path_proxy::server::ProxyServer;
use std::path::Path;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "Path-prefix CORS proxy: GET /https://api.example.com/x forwards to https://api.example.com/x"
)]
struct Args {
    #[clap(long, env = "HOST", value_name = "HOST", help = "Address or hostname to listen on (default: 0.0.0.0)")]
    host: Option<String>,

    #[clap(short, long, env = "PORT", value_name = "PORT", help = "Port to listen on (default: 8787)")]
    port: Option<u16>,

    #[clap(
        long,
        env = "ALLOWED_ORIGINS",
        value_name = "LIST",
        help = "Comma-separated origins allowed to use the proxy, or * for all"
    )]
    allowed_origins: Option<String>,

    #[clap(
        long,
        env = "UPSTREAM_REJECT_UNAUTHORIZED",
        value_name = "BOOL",
        help = "Set to false to accept invalid upstream TLS certificates"
    )]
    upstream_reject_unauthorized: Option<String>,

    #[clap(long, env = "TLS_KEY_PATH", value_name = "FILE", help = "Private key file path for HTTPS")]
    private_key: Option<String>,

    #[clap(long, env = "TLS_CERT_PATH", value_name = "FILE", help = "Certificate file path for HTTPS")]
    certificate: Option<String>,

    #[clap(long, env = "TLS_CA_PATH", value_name = "FILE", help = "CA bundle appended to the served certificate chain")]
    ca_certificate: Option<String>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        Config::default()
            .to_file(config_file)
            .with_context(|| format!("Failed to write {}", config_file))?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let config = load_config(&args)?;
    init_logging(&args, &config)?;
    config.validate().context("Invalid configuration")?;

    info!("Starting path proxy...");
    let server = ProxyServer::new(&config).context("Failed to create proxy server")?;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("Server error: {}", e);
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        result = server_handle => {
            if let Err(e) = result {
                error!("Server task error: {}", e);
            }
        }
    }

    info!("Proxy server stopped");
    Ok(())
}

/// File values first, then flags and environment variables on top.
fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(config_file) => {
            if !Path::new(config_file).exists() {
                bail!("Configuration file not found: {}", config_file);
            }
            Config::from_file(config_file)?
        }
        None => Config::default(),
    };

    config.set_listen_addr(args.host.as_deref(), args.port)?;
    if let Some(origins) = &args.allowed_origins {
        config.allowed_origins = Config::parse_origins(origins);
    }
    if let Some(value) = &args.upstream_reject_unauthorized {
        config.upstream_reject_unauthorized = !value.trim().eq_ignore_ascii_case("false");
    }
    if args.private_key.is_some() {
        config.private_key = args.private_key.clone();
    }
    if args.certificate.is_some() {
        config.certificate = args.certificate.clone();
    }
    if args.ca_certificate.is_some() {
        config.ca_certificate = args.ca_certificate.clone();
    }

    Ok(config)
}

fn init_logging(args: &Args, config: &Config) -> Result<()> {
    match &config.logging {
        Some(logging) => {
            let mut logging = logging.clone();
            if let Some(level) = &args.log_level {
                logging.level = Some(parse_log_level(level).map_err(|e| anyhow::anyhow!("{}", e))?);
            }
            if let Some(format) = &args.log_format {
                logging.format = Some(parse_log_format(format).map_err(|e| anyhow::anyhow!("{}", e))?);
            }
            CustomLogger::init(logging).map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
        }
        None => init_fallback(args.log_level.as_deref(), args.log_format.as_deref())
            .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e)),
    }
}
