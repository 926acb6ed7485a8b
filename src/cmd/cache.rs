//! The `cache` subcommand.

use std::sync::Arc;

use clap::Subcommand;

use crate::{
    cache::{DEFAULT_CACHE_TTL, DirBackend, ResultCache},
    prelude::*,
    ui::Ui,
};

use super::CacheDirOpts;

/// Cache maintenance commands.
#[derive(Debug, Subcommand)]
pub enum CacheCmd {
    /// Remove all cached results.
    Clear(CacheDirOpts),
}

/// The `cache` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_cache(ui: &Ui, cmd: &CacheCmd) -> Result<()> {
    match cmd {
        CacheCmd::Clear(opts) => {
            let dir = opts.cache_dir()?;
            clear_cache(&dir).await;
            ui.display_message("🧹", &format!("Cleared cache in {}", dir.display()));
        }
    }
    Ok(())
}

/// Remove every cached result stored in `dir`.
async fn clear_cache(dir: &Path) {
    // Clearing ignores the TTL, so any value will do.
    let cache = ResultCache::new(Arc::new(DirBackend::new(dir)), DEFAULT_CACHE_TTL);
    cache.clear_all().await;
}
