//! Live command implementation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use flora_core::{DeviceEvent, FirmwareInfo, LiveSensorReading, NullRepository, OperationKind};

use super::{Context, Session, connect, next_event};
use crate::cli::{DeviceArgs, OutputFormat};
use crate::format::{LiveReport, format_live_json, format_live_text};

pub async fn cmd_live(ctx: &Context, args: &DeviceArgs, count: u32, interval: u64) -> Result<()> {
    let session = connect(ctx, args, Arc::new(NullRepository)).await?;
    let result = read_loop(ctx, &session, count.max(1), Duration::from_secs(interval)).await;
    session.close().await;
    result
}

async fn read_loop(ctx: &Context, session: &Session, count: u32, interval: Duration) -> Result<()> {
    for n in 0..count {
        if n > 0 {
            tokio::time::sleep(interval).await;
        }
        let (reading, status) = read_once(session).await?;
        let report = LiveReport {
            reading: &reading,
            status: status.as_ref(),
        };
        match ctx.format {
            OutputFormat::Json => println!("{}", format_live_json(&report)?),
            OutputFormat::Text => {
                if n > 0 {
                    println!();
                }
                print!("{}", format_live_text(&report));
            }
        }
    }
    Ok(())
}

async fn read_once(session: &Session) -> Result<(LiveSensorReading, Option<FirmwareInfo>)> {
    let mut events = session.pool.subscribe();
    session.pool.request_live_data(&session.device).await?;

    let mut reading = None;
    let mut status = None;
    loop {
        match next_event(&mut events, &session.device, session.timeout).await? {
            DeviceEvent::LiveReading { reading: r } => reading = Some(r),
            DeviceEvent::DeviceStatus { info, .. } => status = Some(info),
            DeviceEvent::OperationCompleted {
                operation: OperationKind::ReadLiveData,
                ..
            } => break,
            DeviceEvent::OperationFailed {
                operation: OperationKind::ReadLiveData,
                error,
                ..
            } => bail!("Live read failed: {}", error),
            DeviceEvent::StateChanged { to, .. } if !to.is_ready() => {
                bail!("Device went {} during the read", to)
            }
            _ => {}
        }
    }

    match reading {
        Some(reading) => Ok((reading, status)),
        None => bail!("Device completed the read without a reading"),
    }
}
