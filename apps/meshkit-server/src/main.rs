mod demo;

use anyhow::{Context, Result};
use clap::Parser;
use meshkit::config::{ConfigLoader, EnvVars, YamlFile, resolve};
use meshkit::telemetry::{LoggingConfig, init_logging};
use meshkit_transport_grpc::TcpAgent;

use std::path::PathBuf;
use std::sync::Arc;

/// Environment overrides, e.g. `MESHKIT__MESH__AGENT__LISTEN_ADDR`.
const ENV_PREFIX: &str = "MESHKIT__";

/// meshkit server - runs the demo module behind a TCP agent
#[derive(Parser, Debug)]
#[command(name = "meshkit-server")]
#[command(about = "meshkit server - runs the demo module behind a TCP agent")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print effective configuration (JSON) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config
        && !path.is_file()
    {
        anyhow::bail!("config file does not exist: {}", path.display());
    }

    // Layered config: YAML (if provided) -> env (MESHKIT__*)
    let yaml = cli.config.as_ref().map(YamlFile::new);
    let env = EnvVars::new(ENV_PREFIX);
    let mut loaders: Vec<&dyn ConfigLoader> = Vec::new();
    if let Some(yaml) = &yaml {
        loaders.push(yaml);
    }
    loaders.push(&env);

    let root = resolve(&loaders)?;
    if cli.print_config {
        println!(
            "Effective configuration:\n{}",
            serde_json::to_string_pretty(root.value())?
        );
        return Ok(());
    }

    let mut logging: LoggingConfig = root.sub_config(&["logging"])?.extract_or_default()?;
    apply_verbosity(&mut logging, cli.verbose);
    init_logging(&logging)?;

    tracing::info!("meshkit-server starting");

    let mesh = meshkit::global();
    let agent = Arc::new(TcpAgent::new());
    mesh.register_agent(agent.clone())?;
    let audit = demo::register(mesh)?;

    mesh.start(&loaders).await?;
    if let Some(addr) = agent.bound_addr() {
        tracing::info!(%addr, services = audit.created(), "meshkit-server ready");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for the shutdown signal")?;
    tracing::info!("shutdown requested");

    mesh.shutdown();
    mesh.stopped().await;
    tracing::info!(calls = audit.calls(), "meshkit-server stopped");
    Ok(())
}

fn apply_verbosity(logging: &mut LoggingConfig, verbose: u8) {
    match verbose {
        0 => {}
        1 => "debug".clone_into(&mut logging.level),
        _ => "trace".clone_into(&mut logging.level),
    }
}
