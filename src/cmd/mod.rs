//! Command-line entry points.

use clap::Args;
use tokio::{fs::File, io::AsyncWrite};

use crate::prelude::*;

pub mod analyze;
pub mod cache;
pub mod schema;

/// Name of our directory inside the platform cache directory.
const CACHE_DIR_NAME: &str = "image-insight";

/// Where to keep cached results.
#[derive(Debug, Clone, Args)]
pub struct CacheDirOpts {
    /// Directory for cached results. Defaults to `image-insight` in the
    /// platform's cache directory.
    #[clap(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,
}

impl CacheDirOpts {
    /// The cache directory to use.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::cache_dir()
                .map(|dir| dir.join(CACHE_DIR_NAME))
                .ok_or_else(|| {
                    anyhow!("Could not find a cache directory; please use --cache-dir")
                }),
        }
    }
}

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}
