use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use waybill_tracker::{
    config::Config,
    ledger::ShipmentLedger,
    mail::{ImapMailbox, SmtpNotifier},
    orchestrator::{Orchestrator, RunSettings},
    scheduler,
    strategy::{ChromeDriverProvider, DocumentStrategy},
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    let ledger = ShipmentLedger::open(&config.db_file).await?;
    info!(db = %config.db_file, "ledger opened");

    let orchestrator = Arc::new(Orchestrator::new(
        ledger,
        Box::new(ImapMailbox::from_config(&config)),
        Box::new(SmtpNotifier::from_config(&config)),
        Box::new(DocumentStrategy::from_config(&config)?),
        Box::new(ChromeDriverProvider::from_config(&config)),
        RunSettings::from_config(&config),
    ));

    match config.cron_schedule.as_deref() {
        Some(schedule) => scheduler::create_and_run_scheduler(schedule, orchestrator.clone()).await?,
        None => {
            scheduler::run_once(&orchestrator).await;
        }
    }

    orchestrator.ledger().close().await;
    Ok(())
}
