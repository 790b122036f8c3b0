//! Process entry point: load `Settings`, construct the collaborators and
//! the `Registry`, start the `MaintenanceScheduler` and `NotificationBus`,
//! then wait for a shutdown signal and tear everything down in reverse
//! order (spec.md §1, §9; the HTTP/TLS listener and command dispatcher
//! that would sit in front of this are external and out of scope here).

use std::sync::Arc;

use anyhow::Result;
use jstorage_core::{Collaborators, SecureRandom, Settings, SystemClock};
use jstorage_crypt::{CryptTool, FixedPassword};
use jstorage_maintenance::MaintenanceScheduler;
use jstorage_notify::NotificationBus;
use jstorage_storage::Registry;
use tokio::signal;
use tracing::{error, info};

/// Environment variable an operator sets to bring `CryptTool` up with
/// at-rest encryption available. Absent means JStorage runs in plaintext
/// mode: no database can have `setEncryption(true)` called successfully
/// until a later restart supplies it (spec.md §4.9).
const CRYPT_PASSWORD_VAR: &str = "JSTORAGE_CRYPT_PASSWORD";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("jstorage=info".parse()?))
        .json()
        .init();

    info!("starting jstorage");

    let settings = Settings::load()?;
    let collaborators = Collaborators {
        clock: Arc::new(SystemClock),
        random: Arc::new(SecureRandom::default()),
    };
    let crypt = Arc::new(CryptTool::new());
    if let Ok(password) = std::env::var(CRYPT_PASSWORD_VAR) {
        let source = FixedPassword(password);
        match crypt.init_interactive(&settings.config_dir(), collaborators.random.as_ref(), &source).await {
            Ok(()) => info!("crypt tool ready; at-rest encryption available"),
            Err(e) => error!(error = %e, "crypt tool password rejected; starting without at-rest encryption"),
        }
    } else {
        info!(var = CRYPT_PASSWORD_VAR, "no crypt password supplied; starting without at-rest encryption");
    }

    let notify = NotificationBus::new(settings.notification_queue_bound);
    notify.start();

    let registry = Arc::new(Registry::new(settings, collaborators, crypt, notify));
    registry.setup().await?;
    info!(databases = registry.database_names().len(), "registry ready");

    let scheduler = Arc::new(MaintenanceScheduler::new(registry.clone()));
    scheduler.start();
    info!("maintenance scheduler running");

    match signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal, stopping jstorage"),
        Err(err) => error!(error = %err, "unable to listen for shutdown signal"),
    }

    scheduler.stop().await;
    if let Err(e) = registry.shutdown().await {
        error!(error = %e, "error during registry shutdown");
        return Err(e.into());
    }

    info!("jstorage stopped");
    Ok(())
}
