mod config;

use clap::{Args, Parser};
use config::{CommonConfig, Config, LoggingConfig, MetricsConfig};
use gateway::config::ConfigError;
use gateway::{AggregationGateway, Domain, GatewayError, VehicleQuery};
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "safety-data", about = "Vehicle safety data aggregation gateway")]
enum CliCommand {
    /// Look up one domain's records for a vehicle and print them as JSON
    Lookup(LookupArgs),
    /// Load and validate a config file
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Args)]
struct LookupArgs {
    #[arg(long, required_unless_present = "env", conflicts_with = "env")]
    config: Option<PathBuf>,
    /// Read the gateway config from UPSTREAM_* and CACHE_* variables
    #[arg(long)]
    env: bool,
    #[arg(long)]
    domain: Domain,
    #[arg(long)]
    vin: Option<String>,
    #[arg(long)]
    year: Option<u16>,
    #[arg(long)]
    make: Option<String>,
    #[arg(long)]
    model: Option<String>,
}

impl LookupArgs {
    fn load_config(&self) -> Result<Config, ConfigError> {
        match &self.config {
            Some(path) => Config::from_file(path),
            None => Config::from_env(),
        }
    }

    fn query(&self) -> VehicleQuery {
        VehicleQuery {
            vin: self.vin.clone(),
            year: self.year,
            make: self.make.clone(),
            model: self.model.clone(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("invalid sentry DSN: {0}")]
    SentryDsn(#[from] sentry::types::ParseDsnError),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("could not encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

fn main() -> Result<(), CliError> {
    let cli = CliCommand::parse();

    match cli {
        CliCommand::Lookup(args) => {
            let config = args.load_config()?;
            let _sentry = init_logging(&config.common)?;
            if let Some(metrics) = &config.common.metrics {
                init_metrics(metrics)?;
            }

            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            rt.block_on(lookup(config, &args))
        }
        CliCommand::CheckConfig { config } => {
            Config::from_file(&config)?;
            println!("{} is valid", config.display());
            Ok(())
        }
    }
}

async fn lookup(config: Config, args: &LookupArgs) -> Result<(), CliError> {
    let gateway = AggregationGateway::from_config(config.gateway);
    let result = gateway.get_vehicle_data(args.domain, &args.query()).await?;

    if result.degraded {
        tracing::warn!(domain = %args.domain, "upstream unavailable, result is degraded");
    }
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Installs the tracing subscriber. With a Sentry DSN configured, error
/// events are also reported to Sentry for as long as the returned guard lives.
fn init_logging(common: &CommonConfig) -> Result<Option<sentry::ClientInitGuard>, CliError> {
    let guard = common
        .logging
        .as_ref()
        .map(init_sentry)
        .transpose()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    Ok(guard)
}

fn init_sentry(logging: &LoggingConfig) -> Result<sentry::ClientInitGuard, CliError> {
    let dsn: sentry::types::Dsn = logging.sentry_dsn.parse()?;
    Ok(sentry::init(sentry::ClientOptions {
        dsn: Some(dsn),
        release: sentry::release_name!(),
        ..Default::default()
    }))
}

fn init_metrics(metrics: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(metrics.statsd_host.as_str(), metrics.statsd_port)
        .build(Some("safety_data"))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;

    shared::metrics_defs::describe_all(gateway::metrics_defs::ALL_METRICS);
    tracing::info!(
        host = %metrics.statsd_host,
        port = metrics.statsd_port,
        "statsd exporter installed"
    );
    Ok(())
}
