//! History command implementation.
//!
//! Ctrl-C cancels the download. The pool saves a checkpoint, so the next run
//! against the same checkpoint directory resumes where this one stopped.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use flora_core::{
    DeviceEvent, HistoricalSensorReading, NullRepository, OperationKind, ReadingRepository,
};
use indicatif::ProgressBar;

use super::{Context, Session, connect, next_event};
use crate::cli::{DeviceArgs, OutputFormat};
use crate::format::format_history_text;
use crate::repository::JsonLinesRepository;
use crate::style;

/// How a download ended.
#[derive(Debug)]
enum Outcome {
    Completed { total: u16, rejected: u32 },
    Interrupted { current: u16, total: u16 },
}

pub async fn cmd_history(ctx: &Context, args: &DeviceArgs, output: Option<PathBuf>) -> Result<()> {
    let repository: Arc<dyn ReadingRepository> = match (&output, ctx.format) {
        (Some(path), _) => Arc::new(
            JsonLinesRepository::append(path)
                .with_context(|| format!("Failed to open {}", path.display()))?,
        ),
        (None, OutputFormat::Json) => Arc::new(JsonLinesRepository::stdout()),
        (None, OutputFormat::Text) => Arc::new(NullRepository),
    };
    let table = output.is_none() && ctx.format == OutputFormat::Text;

    let session = connect(ctx, args, repository).await?;
    let pb = ctx.show_progress().then(style::history_progress_bar);
    let mut rows = Vec::new();
    let result = download(&session, pb.as_ref(), table.then_some(&mut rows)).await;
    session.close().await;

    match result {
        Ok(Outcome::Completed { total, rejected }) => {
            if let Some(pb) = &pb {
                pb.finish_and_clear();
            }
            if table {
                print!("{}", format_history_text(&rows));
            }
            if !ctx.quiet {
                eprintln!("Downloaded {} entries ({} rejected).", total, rejected);
            }
            Ok(())
        }
        Ok(Outcome::Interrupted { current, total }) => {
            if let Some(pb) = &pb {
                pb.abandon();
            }
            if table {
                print!("{}", format_history_text(&rows));
            }
            if !ctx.quiet {
                eprintln!(
                    "Stopped at entry {}/{}. Run the command again to resume.",
                    current, total
                );
            }
            Ok(())
        }
        Err(e) => {
            if let Some(pb) = &pb {
                pb.abandon();
            }
            Err(e)
        }
    }
}

async fn download(
    session: &Session,
    pb: Option<&ProgressBar>,
    mut rows: Option<&mut Vec<HistoricalSensorReading>>,
) -> Result<Outcome> {
    let device = &session.device;
    let mut events = session.pool.subscribe();
    session.pool.request_historical_data(device).await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancelled = false;

    loop {
        let event = tokio::select! {
            result = &mut ctrl_c, if !cancelled => {
                result.context("Failed to listen for Ctrl-C")?;
                cancelled = true;
                tracing::info!("cancelling history download of {}", device);
                session.pool.cancel(device).await?;
                continue;
            }
            event = next_event(&mut events, device, session.timeout) => event?,
        };

        match event {
            DeviceEvent::HistoryStarted {
                start_index,
                total_entries,
                resumed,
                ..
            } => {
                if let Some(pb) = pb {
                    pb.set_length(u64::from(total_entries));
                    pb.set_position(u64::from(start_index));
                    pb.set_message(if resumed { "resumed" } else { "" });
                }
            }
            DeviceEvent::HistoryProgress { current_index, .. } => {
                if let Some(pb) = pb {
                    pb.set_position(u64::from(current_index));
                }
            }
            DeviceEvent::HistoricalReading { reading } => {
                if let Some(rows) = rows.as_deref_mut() {
                    rows.push(reading);
                }
            }
            DeviceEvent::EntryRejected { index, error, .. } => {
                tracing::warn!("entry {} rejected: {}", index, error);
            }
            DeviceEvent::ReconnectScheduled { delay_ms, .. } => {
                if let Some(pb) = pb {
                    pb.set_message(format!("link lost, reconnecting in {} ms", delay_ms));
                }
            }
            DeviceEvent::StateChanged { to, .. } if to.is_ready() => {
                if let Some(pb) = pb {
                    pb.set_message("");
                }
            }
            DeviceEvent::StateChanged { to, .. } if to.is_failed() => {
                bail!("History download stopped: {}", to)
            }
            DeviceEvent::HistoryCompleted {
                total_entries,
                rejected,
                ..
            } => {
                return Ok(Outcome::Completed {
                    total: total_entries,
                    rejected,
                });
            }
            DeviceEvent::HistoryAborted {
                current_index,
                total_entries,
                reason,
                ..
            } => {
                if cancelled {
                    return Ok(Outcome::Interrupted {
                        current: current_index,
                        total: total_entries,
                    });
                }
                bail!(
                    "History download aborted at entry {}/{}: {}",
                    current_index,
                    total_entries,
                    reason
                );
            }
            DeviceEvent::OperationFailed {
                operation: OperationKind::ReadHistoryCount,
                error,
                ..
            } => {
                tracing::warn!("entry count read failed: {}", error);
            }
            _ => {}
        }
    }
}
