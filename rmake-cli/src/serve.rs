//! `rmake serve`: run the build daemon until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use rmake::{DaemonConfig, Server};
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Arguments for `rmake serve`.
#[derive(clap::Args)]
pub struct ServeArgs {
    /// Configuration file [default: <config dir>/rmake/rmaked.json].
    #[arg(short, long, env = "RMAKE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration.
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Parent directory for per-request working directories.
    #[arg(long)]
    scratch_root: Option<PathBuf>,
}

/// Default configuration path under the platform config directory.
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("rmake").join("rmaked.json"))
}

impl ServeArgs {
    pub async fn run(self) -> Result<()> {
        let path = match self.config {
            Some(path) => path,
            None => default_config_path().context("no platform config directory; pass --config")?,
        };
        let mut config = DaemonConfig::load(&path)
            .with_context(|| format!("loading configuration from {}", path.display()))?;
        if let Some(addr) = self.listen {
            config.listen = addr;
        }
        if let Some(root) = self.scratch_root {
            config.scratch_root = Some(root);
        }

        let server = Arc::new(Server::from_config(&config).context("invalid recipe")?);
        if server.recipes().is_empty() {
            warn!("no recipes configured, every make request will be refused");
        }
        if config.users.is_empty() {
            warn!("no users configured, nobody can authenticate");
        }

        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("binding {}", config.listen))?;

        tokio::select! {
            res = server.serve(listener) => res.context("accepting connections"),
            res = tokio::signal::ctrl_c() => {
                res.context("waiting for Ctrl-C")?;
                info!("interrupted, shutting down");
                Ok(())
            }
        }
    }
}
