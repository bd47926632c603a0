use anyhow::{Context, Error};
use clap::Parser;
use log::info;
use ocvps_api::clients::NodeClients;
use ocvps_api::provisioner::VpsProvisioner;
use ocvps_api::settings::Settings;
use ocvps_api::worker::Reconciler;
use ocvps_db::{VpsDb, VpsDbMysql};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Parser)]
#[clap(about, version, author)]
struct Args {
    /// Run one reconciliation pass and exit
    #[clap(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let args = Args::parse();
    let settings = Arc::new(Settings::from_env()?);

    // Connect catalog and migrate
    let db_url = settings
        .database_url
        .clone()
        .context("DATABASE_URL is not set")?;
    let db = VpsDbMysql::new(&db_url).await?;
    db.migrate().await?;
    let db: Arc<dyn VpsDb> = Arc::new(db);

    let clients = Arc::new(NodeClients::new(settings.clone()));
    let provisioner = Arc::new(VpsProvisioner::new(db.clone(), clients.clone()));
    let reconciler = Arc::new(Reconciler::new(db, provisioner, clients));

    if args.once {
        reconciler.status_sync_tick().await?;
        reconciler.import_tick().await?;
        reconciler.lease_tick().await?;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = reconciler.spawn_all(shutdown_rx);
    info!("orchestrator running on {} nodes", settings.nodes().len());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown_tx.send(true)?;
    futures::future::join_all(handles).await;
    Ok(())
}
