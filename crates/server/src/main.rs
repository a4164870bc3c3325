use anyhow::Result;
use clap::Parser;
use devflow_core::ExitStatus;
use std::path::PathBuf;

mod api;
mod app;
mod config;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "devflow")]
#[command(about = "Build, deploy and develop Kubernetes projects", long_about = None)]
pub struct Args {
    /// Pipeline to run
    #[arg(default_value = "dev")]
    pub pipeline: String,

    /// Path to configuration file
    #[arg(short, long, default_value = "devflow.toml", env = "DEVFLOW_CONFIG")]
    pub config: PathBuf,

    /// Host the inter-process API binds to
    #[arg(long)]
    pub host: Option<String>,

    /// Port of the inter-process API (0 picks a free one)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Namespace holding the ownership ConfigMap
    #[arg(short, long, env = "DEVFLOW_NAMESPACE")]
    pub namespace: Option<String>,

    /// Do not coordinate with other sessions through the cluster
    #[arg(long)]
    pub offline: bool,

    /// Override a pipeline flag, as name=value
    #[arg(long = "set-flag")]
    pub set_flag: Vec<String>,

    /// Refuse to hand dependencies over to other sessions
    #[arg(long)]
    pub no_takeover: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "devflow=info,tower_http=info".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    let config = ServerConfig::load(&args.config)?;

    if let Err(err) = app::run(&args, config).await {
        tracing::error!("{:#}", err);
        std::process::exit(ExitStatus::of(&err).unwrap_or(1));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["devflow"]).unwrap();

        assert_eq!(args.pipeline, "dev");
        assert!(!args.offline);
        assert!(args.set_flag.is_empty());
    }

    #[test]
    fn test_args_repeatable_flags() {
        let args = Args::try_parse_from([
            "devflow",
            "deploy",
            "--set-flag",
            "tier=gold",
            "--set-flag",
            "debug=true",
            "--offline",
            "--no-takeover",
            "--port",
            "8090",
        ])
        .unwrap();

        assert_eq!(args.pipeline, "deploy");
        assert_eq!(args.set_flag, vec!["tier=gold".to_string(), "debug=true".to_string()]);
        assert!(args.offline);
        assert!(args.no_takeover);
        assert_eq!(args.port, Some(8090));
    }
}
