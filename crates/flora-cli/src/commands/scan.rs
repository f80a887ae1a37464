//! Scan command implementation.

use anyhow::{Context as _, Result};
use flora_core::{ScanOptions, scan};

use super::Context;
use crate::cli::OutputFormat;
use crate::format::{format_scan_json, format_scan_text};
use crate::style;

pub async fn cmd_scan(ctx: &Context, timeout: u64, all: bool) -> Result<()> {
    let spinner = ctx
        .show_progress()
        .then(|| style::spinner(format!("Scanning for {} seconds...", timeout)));

    let mut options = ScanOptions::new().duration_secs(timeout);
    if all {
        options = options.all_devices();
    }
    let devices = scan::scan_with_options(options)
        .await
        .context("Failed to scan for devices");

    if let Some(sp) = spinner {
        sp.finish_and_clear();
    }
    let devices = devices?;

    let content = match ctx.format {
        OutputFormat::Json => format_scan_json(&devices)?,
        OutputFormat::Text => format_scan_text(&devices),
    };
    print!("{}", content);
    if ctx.format == OutputFormat::Json {
        println!();
    }
    Ok(())
}
