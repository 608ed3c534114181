use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};

use access_log_exporter::config::{Config, StartupFlags, DEFAULT_LISTEN_PORT, DEFAULT_NAMESPACE};
use access_log_exporter::template::DEFAULT_FORMAT;
use access_log_exporter::{app, logging};

#[derive(Parser)]
#[command(name = "access_log_exporter")]
#[command(about = "Exports Prometheus metrics from web server access logs")]
#[command(version)]
struct Cli {
    /// HTTP port to listen on
    #[arg(long, default_value_t = DEFAULT_LISTEN_PORT)]
    listen_port: u16,

    /// Log format of the access log (nginx log_format syntax)
    #[arg(long, default_value = DEFAULT_FORMAT)]
    format: String,

    /// Namespace used as the prefix of every metric name
    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// TOML configuration file; overrides every other flag but --enable-experimental
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Allow experimental configuration options
    #[arg(long)]
    enable_experimental: bool,

    /// Also write JSON logs to a daily rotated file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Access log files to follow
    filenames: Vec<PathBuf>,
}

impl From<&Cli> for StartupFlags {
    fn from(cli: &Cli) -> Self {
        Self {
            listen_port: cli.listen_port,
            format: cli.format.clone(),
            namespace: cli.namespace.clone(),
            config_file: cli.config_file.clone(),
            enable_experimental: cli.enable_experimental,
            filenames: cli.filenames.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match logging::init_logging(cli.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("could not initialize logging: {e}");
            return ExitCode::from(2);
        }
    };

    let config = match Config::load(&StartupFlags::from(&cli)) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "could not load configuration");
            return ExitCode::from(e.exit_code());
        }
    };

    if let (Some(warning), true) = (config.stability_warnings(), config.enable_experimental) {
        warn!(%warning, "experimental options enabled");
    }
    info!(
        namespaces = config.namespaces.len(),
        port = config.listen.port,
        "using configuration"
    );

    match app::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "exporter stopped with an error");
            ExitCode::from(e.exit_code())
        }
    }
}
