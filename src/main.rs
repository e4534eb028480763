use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use trust_engine::config;
use trust_engine::orchestrator::{RequestContext, TrustOrchestrator};
use trust_engine::utils;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    component: Component,
}

#[derive(Subcommand)]
enum Component {
    /// Run the trust engine with background cache maintenance
    Engine,

    /// Run a single trust assessment and print the result
    Assess {
        /// User to assess
        #[arg(long)]
        user: String,

        /// Session identifier
        #[arg(long)]
        session: String,

        /// Device identifier
        #[arg(long)]
        device: String,

        /// Source address of the request
        #[arg(long)]
        ip: String,

        /// Resource being accessed
        #[arg(long, default_value = "/")]
        resource: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Initialize logging
    utils::logging::init_logger();

    // Parse command line arguments
    let cli = Cli::parse();

    // Load configuration
    let config = config::load_config()?;

    match cli.component {
        Component::Engine => {
            info!("Starting trust engine...");
            run_engine(config).await?;
        }
        Component::Assess {
            user,
            session,
            device,
            ip,
            resource,
        } => {
            let orchestrator = TrustOrchestrator::new(config);
            let context = RequestContext {
                session_id: session,
                device_id: device.clone(),
                device_fingerprint: device,
                ip,
                resource,
                ..Default::default()
            };
            let assessment = orchestrator.assess_trust(&user, &context).await;
            println!("{}", serde_json::to_string_pretty(&assessment)?);
        }
    }

    Ok(())
}

async fn run_engine(config: config::EngineConfig) -> Result<()> {
    let sweep_interval = config.cache_sweep_interval_secs.max(1);
    let orchestrator = TrustOrchestrator::new(config);

    let sweeper = orchestrator.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(sweep_interval));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = sweeper.sweep_caches();
            if evicted > 0 {
                info!("cache sweep evicted {} entries", evicted);
            }
        }
    });

    info!("Trust engine running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down trust engine");
    Ok(())
}
