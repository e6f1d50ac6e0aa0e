//! Running-server registry lookup.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::utils::{apply_creation_flags, paths_equal};

/// A running server's advertised identity, as written by
/// `jupyter notebook list --jsonlist`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub url: String,
    #[serde(default)]
    pub base_url: String,
    pub hostname: String,
    /// Directory the server serves; jupyter_server calls it `root_dir`.
    #[serde(alias = "root_dir")]
    pub notebook_dir: PathBuf,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl ServerDescriptor {
    /// Exact normalized-path equality; never prefix or fuzzy.
    pub fn serves(&self, directory: &Path) -> bool {
        paths_equal(&self.notebook_dir, directory)
    }
}

/// Lists the servers currently running. `Ok(None)` means listing is not
/// possible right now.
#[async_trait]
pub trait ServerEnumerator: Send + Sync {
    async fn list_servers(&self, cancel: &CancellationToken) -> Result<Option<Vec<ServerDescriptor>>>;
}

/// Lists servers through `python -m jupyter notebook list --jsonlist`.
pub struct JupyterServerEnumerator {
    python: PathBuf,
    timeout: Duration,
    /// Drop entries whose pid is no longer alive.
    skip_dead: bool,
}

impl JupyterServerEnumerator {
    pub fn new(python: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            python: python.into(),
            timeout,
            skip_dead: true,
        }
    }

    pub fn keep_stale_entries(mut self) -> Self {
        self.skip_dead = false;
        self
    }
}

#[async_trait]
impl ServerEnumerator for JupyterServerEnumerator {
    async fn list_servers(&self, cancel: &CancellationToken) -> Result<Option<Vec<ServerDescriptor>>> {
        let mut cmd = Command::new(&self.python);
        cmd.args(["-m", "jupyter", "notebook", "list", "--jsonlist"])
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);
        apply_creation_flags(&mut cmd);

        // dropping the output future kills the helper
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(anyhow::anyhow!("server listing cancelled"));
            }
            res = tokio::time::timeout(self.timeout, cmd.output()) => match res {
                Ok(output) => output,
                Err(_) => {
                    tracing::warn!("jupyter notebook list timed out after {:?}", self.timeout);
                    return Ok(None);
                }
            },
        };

        let output = match output {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!("Failed to run {}: {}", self.python.display(), e);
                return Ok(None);
            }
        };
        if !output.status.success() {
            tracing::warn!(
                "jupyter notebook list failed (exit {:?}): {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(None);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut servers = parse_server_list(&stdout)?;

        if self.skip_dead {
            let mut alive = Vec::with_capacity(servers.len());
            for server in servers {
                match server.pid {
                    Some(pid) if !crate::process_monitor::is_running_async(pid).await => {
                        tracing::debug!("Dropping stale server entry {} (pid {} gone)", server.url, pid);
                    }
                    _ => alive.push(server),
                }
            }
            servers = alive;
        }

        tracing::debug!("Found {} running servers", servers.len());
        Ok(Some(servers))
    }
}

/// Parse `--jsonlist` output (one array) or `--json` output (one object per
/// line).
pub fn parse_server_list(text: &str) -> Result<Vec<ServerDescriptor>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).context("invalid server list JSON");
    }
    trimmed
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::from_str(l).with_context(|| format!("invalid server entry: {}", l)))
        .collect()
}
