use clap::Parser;
use gcloud_auth_proxy::config::{Args, Config, LogFormat};
use gcloud_auth_proxy::{server, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.log_format);

    let config = Config::from_args(args).unwrap_or_else(|e| {
        error!(error = %e, "Invalid configuration");
        std::process::exit(2);
    });

    let shutdown = CancellationToken::new();
    signal::cancel_on_signal(shutdown.clone());

    info!(mode = ?config.proxy_mode(), "Starting gcloud-auth-proxy");

    if let Err(e) = server::run(config, shutdown).await {
        error!(error = ?e, "Server exited with error");
        std::process::exit(1);
    }
}
