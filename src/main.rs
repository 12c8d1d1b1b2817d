use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use warden_gateway::gateway::{GatewayConfig, LogFormat, Supervisor};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = match GatewayConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            init_tracing(LogFormat::default());
            error!(error = %e, "invalid configuration");
            return Err(e.into());
        }
    };
    init_tracing(config.log_format);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        facility = %config.facility,
        listen = %config.listen_addr,
        metrics = %config.metrics_addr(),
        "starting wardend"
    );

    if let Err(e) = Supervisor::new(config).run().await {
        error!(error = %e, "wardend stopped with error");
        return Err(e.into());
    }
    Ok(())
}
