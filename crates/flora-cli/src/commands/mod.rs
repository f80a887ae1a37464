//! Command implementations for the CLI.

mod blink;
mod config;
mod history;
mod live;
mod scan;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use flora_core::events::EventReceiver;
use flora_core::{
    BtleTransport, ConnectionPool, ConnectionState, DeviceEvent, DeviceId, FileCheckpointStore,
    ReadingRepository,
};
use tokio::sync::broadcast::error::RecvError;

use crate::cli::{DeviceArgs, OutputFormat};
use crate::config::{Config, resolve_device};
use crate::style;

pub use blink::cmd_blink;
pub use config::cmd_config;
pub use history::cmd_history;
pub use live::cmd_live;
pub use scan::cmd_scan;

/// Settings shared by every command.
pub struct Context {
    pub config: Config,
    pub config_path: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub format: OutputFormat,
    pub quiet: bool,
}

impl Context {
    /// Whether progress indicators go to the terminal.
    pub fn show_progress(&self) -> bool {
        !self.quiet && self.format == OutputFormat::Text
    }
}

/// A pool holding one ready device.
pub struct Session {
    pub pool: ConnectionPool,
    pub device: DeviceId,
    pub timeout: Duration,
}

impl Session {
    /// Disconnect and stop the pool.
    pub async fn close(self) {
        if let Err(e) = self.pool.disconnect(&self.device).await {
            tracing::debug!("disconnect {}: {}", self.device, e);
        }
        self.pool.shutdown().await;
    }
}

/// Connect to the device named by `args` and wait until it is ready.
pub async fn connect(
    ctx: &Context,
    args: &DeviceArgs,
    repository: Arc<dyn ReadingRepository>,
) -> Result<Session> {
    let Some(identifier) = resolve_device(args.device.clone(), &ctx.config) else {
        bail!("No device specified. Pass an address, set FLORA_DEVICE, or set `device` in the config file.");
    };
    let device = DeviceId::new(identifier);
    let timeout = Duration::from_secs(args.timeout);

    let transport = BtleTransport::new()
        .await
        .context("Failed to open the Bluetooth adapter")?;
    let pool = ConnectionPool::builder(Arc::new(transport))
        .config(ctx.config.pool.clone())
        .checkpoint_store(Arc::new(FileCheckpointStore::new(&ctx.checkpoint_dir)))
        .repository(repository)
        .build()?;

    let spinner = ctx
        .show_progress()
        .then(|| style::spinner(format!("Connecting to {}...", device)));

    pool.connect(&device).await?;
    let state = pool
        .wait_for_state(&device, timeout, |s| s.is_ready() || s.is_failed())
        .await;

    if let Some(sp) = spinner {
        sp.finish_and_clear();
    }

    match state {
        Ok(ConnectionState::Ready) => Ok(Session {
            pool,
            device,
            timeout,
        }),
        Ok(other) => {
            pool.shutdown().await;
            bail!("Could not connect to {}: {}", device, other)
        }
        Err(e) => {
            pool.shutdown().await;
            Err(e).with_context(|| format!("Could not connect to {}", device))
        }
    }
}

/// Next event about `device`, waiting at most `timeout`.
pub async fn next_event(
    events: &mut EventReceiver,
    device: &DeviceId,
    timeout: Duration,
) -> Result<DeviceEvent> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if event.device() == device => return Ok(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("event stream lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => bail!("Connection pool stopped"),
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .with_context(|| format!("No response from {} within {:?}", device, timeout))?
}
