//! Blink command implementation.

use std::sync::Arc;

use anyhow::{Result, bail};
use flora_core::{DeviceEvent, NullRepository, OperationKind};

use super::{Context, Session, connect, next_event};
use crate::cli::DeviceArgs;

pub async fn cmd_blink(ctx: &Context, args: &DeviceArgs) -> Result<()> {
    let session = connect(ctx, args, Arc::new(NullRepository)).await?;
    let device = session.device.clone();
    let result = blink(&session).await;
    session.close().await;
    result?;

    if !ctx.quiet {
        eprintln!("Blinked {}", device);
    }
    Ok(())
}

async fn blink(session: &Session) -> Result<()> {
    let mut events = session.pool.subscribe();
    session.pool.blink(&session.device).await?;
    loop {
        match next_event(&mut events, &session.device, session.timeout).await? {
            DeviceEvent::OperationCompleted {
                operation: OperationKind::Blink,
                ..
            } => return Ok(()),
            DeviceEvent::OperationFailed {
                operation: OperationKind::Blink,
                error,
                ..
            } => bail!("Blink failed: {}", error),
            _ => {}
        }
    }
}
