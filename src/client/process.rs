//! Spawning and supervising the tor binary.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ClientConfiguration;
use crate::locate::{find_binary, tor_candidates};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("tor binary not found. Install tor or set tor_binary in config")]
    BinaryNotFound,
    #[error("failed to spawn tor: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A launched tor process.
#[async_trait]
pub trait ClientProcess: Send + Sync {
    fn is_executing(&self) -> bool;

    /// Terminate the process and wait for it to exit.
    async fn cancel(&mut self);
}

/// Starts tor processes.
#[async_trait]
pub trait ClientLauncher: Send + Sync {
    async fn launch(
        &self,
        config: &ClientConfiguration,
    ) -> Result<Box<dyn ClientProcess>, LaunchError>;
}

/// Launches the system tor binary.
#[derive(Debug, Clone, Default)]
pub struct TorLauncher {
    binary: Option<PathBuf>,
}

impl TorLauncher {
    /// `binary` overrides the `PATH` search.
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self { binary }
    }

    pub fn find_tor_binary(&self) -> Option<PathBuf> {
        find_binary(self.binary.as_deref(), tor_candidates())
    }
}

#[async_trait]
impl ClientLauncher for TorLauncher {
    async fn launch(
        &self,
        config: &ClientConfiguration,
    ) -> Result<Box<dyn ClientProcess>, LaunchError> {
        let binary = self.find_tor_binary().ok_or(LaunchError::BinaryNotFound)?;
        let args = config.command_line();

        info!("Starting tor ({})", binary.display());
        debug!("tor {}", args.join(" "));

        let mut child = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr));
        }

        let pid = child.id();
        let executing = Arc::new(AtomicBool::new(true));
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let flag = executing.clone();

        // Dropping the sender also kills the child.
        let watcher = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => info!("tor exited with {}", status),
                    Err(e) => warn!("Failed to wait for tor: {}", e),
                },
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill tor: {}", e);
                    }
                }
            }
            flag.store(false, Ordering::SeqCst);
        });

        Ok(Box::new(TorProcess {
            pid,
            executing,
            kill: Some(kill_tx),
            watcher: Some(watcher),
        }))
    }
}

/// Handle to a tor child process.
pub struct TorProcess {
    pid: Option<u32>,
    executing: Arc<AtomicBool>,
    kill: Option<oneshot::Sender<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl TorProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[async_trait]
impl ClientProcess for TorProcess {
    fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    async fn cancel(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.await;
        }
        debug!("tor process {:?} stopped", self.pid);
    }
}

/// Tor log lines at warn or err severity.
fn is_warning(line: &str) -> bool {
    line.contains("[warn]") || line.contains("[err]")
}

async fn forward_output<R: AsyncRead + Unpin>(reader: R) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_warning(&line) {
            warn!("Tor: {}", line);
        } else {
            debug!("Tor: {}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_classification() {
        assert!(is_warning("Oct 14 12:00:00.000 [warn] Proxy Client: unable to connect"));
        assert!(is_warning("Oct 14 12:00:00.000 [err] Reading config failed"));
        assert!(!is_warning("Oct 14 12:00:00.000 [notice] Bootstrapped 5%"));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = crate::client::Directories::under(tmp.path());
        let config = crate::client::ClientConfigBuilder::new(&dirs).build().unwrap();
        let launcher = TorLauncher::new(Some(tmp.path().join("no-such-tor")));

        // Only meaningful where tor is not installed system-wide.
        if launcher.find_tor_binary().is_none() {
            assert!(matches!(
                launcher.launch(&config).await,
                Err(LaunchError::BinaryNotFound)
            ));
        }
    }
}
