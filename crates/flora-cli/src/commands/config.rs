//! Config command implementation.

use anyhow::{Result, bail};

use super::Context;

pub fn cmd_config(ctx: &Context, init: bool) -> Result<()> {
    if init {
        if ctx.config_path.exists() {
            bail!("{} already exists", ctx.config_path.display());
        }
        ctx.config.save(&ctx.config_path)?;
        if !ctx.quiet {
            eprintln!("Wrote {}", ctx.config_path.display());
        }
        return Ok(());
    }

    print!("{}", ctx.config.to_toml()?);
    Ok(())
}
