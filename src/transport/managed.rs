//! Pluggable transport helpers run in managed client mode.
//!
//! The helper is configured through `TOR_PT_*` environment variables and
//! reports its SOCKS listener on stdout:
//!
//! ```text
//! VERSION 1
//! CMETHOD obfs4 socks5 127.0.0.1:41234
//! CMETHODS DONE
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{HelperKind, TransportError, TransportHelper};
use crate::provision::ensure_private_dir;

/// How long a helper gets to report its listener.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// One line of managed-proxy output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtMessage {
    Version(String),
    VersionError,
    Method { name: String, addr: SocketAddr },
    MethodError { name: String, message: String },
    MethodsDone,
    EnvError(String),
    Log(String),
    Other(String),
}

impl PtMessage {
    pub fn parse(line: &str) -> Result<Self, TransportError> {
        let line = line.trim_end();
        let (keyword, rest) = line.split_once(' ').unwrap_or((line, ""));
        let msg = match keyword {
            "VERSION" => PtMessage::Version(rest.to_string()),
            "VERSION-ERROR" => PtMessage::VersionError,
            "CMETHOD" => {
                let mut parts = rest.split_whitespace();
                let (Some(name), Some(_proto), Some(addr)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    return Err(TransportError::Malformed(line.to_string()));
                };
                let addr = addr
                    .parse()
                    .map_err(|_| TransportError::Malformed(line.to_string()))?;
                PtMessage::Method {
                    name: name.to_string(),
                    addr,
                }
            }
            "CMETHOD-ERROR" => {
                let (name, message) = rest.split_once(' ').unwrap_or((rest, ""));
                PtMessage::MethodError {
                    name: name.to_string(),
                    message: message.to_string(),
                }
            }
            "CMETHODS" if rest == "DONE" => PtMessage::MethodsDone,
            "ENV-ERROR" => PtMessage::EnvError(rest.to_string()),
            "LOG" | "STATUS" => PtMessage::Log(rest.to_string()),
            _ => PtMessage::Other(line.to_string()),
        };
        Ok(msg)
    }
}

/// Read helper output until the listener for `method` is reported.
async fn read_handshake<R>(lines: &mut Lines<R>, method: &str) -> Result<SocketAddr, TransportError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut addr = None;
    while let Some(line) = lines.next_line().await? {
        debug!("pt {}: {}", method, line);
        match PtMessage::parse(&line)? {
            PtMessage::Version(v) if v != "1" => return Err(TransportError::VersionMismatch),
            PtMessage::VersionError => return Err(TransportError::VersionMismatch),
            PtMessage::EnvError(message) => {
                return Err(TransportError::Method {
                    method: method.to_string(),
                    message,
                })
            }
            PtMessage::MethodError { name, message } if name == method => {
                return Err(TransportError::Method {
                    method: name,
                    message,
                })
            }
            PtMessage::Method { name, addr: a } if name == method => addr = Some(a),
            PtMessage::MethodsDone => {
                return addr.ok_or_else(|| TransportError::Method {
                    method: method.to_string(),
                    message: "no listener reported".to_string(),
                })
            }
            _ => {}
        }
    }
    Err(TransportError::Exited)
}

fn forward_output<R>(method: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("pt {}: {}", method, line);
        }
    });
}

/// A pluggable transport binary launched on demand.
pub struct ManagedTransport {
    kind: HelperKind,
    binary: Option<PathBuf>,
    state_dir: PathBuf,
    child: Mutex<Option<Child>>,
    port: AtomicU16,
}

impl ManagedTransport {
    /// `binary` is `None` when no executable was found; `start` then fails.
    pub fn new(kind: HelperKind, binary: Option<PathBuf>, state_dir: PathBuf) -> Self {
        Self {
            kind,
            binary,
            state_dir,
            child: Mutex::new(None),
            port: AtomicU16::new(0),
        }
    }

    async fn spawn(&self) -> Result<(Child, SocketAddr), TransportError> {
        let method = self.kind.method();
        let binary = self
            .binary
            .as_ref()
            .ok_or(TransportError::BinaryNotFound(method))?;
        ensure_private_dir(&self.state_dir)?;

        let mut child = Command::new(binary)
            .env("TOR_PT_MANAGED_TRANSPORT_VER", "1")
            .env("TOR_PT_CLIENT_TRANSPORTS", method)
            .env("TOR_PT_STATE_LOCATION", &self.state_dir)
            .env("TOR_PT_EXIT_ON_STDIN_CLOSE", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout: ChildStdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Malformed("helper stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            forward_output(method, stderr);
        }

        let mut lines = BufReader::new(stdout).lines();
        let addr = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut lines, method))
            .await
        {
            Ok(Ok(addr)) => addr,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(e);
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(TransportError::Timeout);
            }
        };

        forward_output(method, lines.into_inner());
        Ok((child, addr))
    }
}

#[async_trait]
impl TransportHelper for ManagedTransport {
    async fn start(&self) -> Result<(), TransportError> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return Ok(());
            }
            warn!("{} helper exited, restarting", self.kind.method());
        }

        let (child, addr) = self.spawn().await?;
        info!("{} helper listening on {}", self.kind.method(), addr);
        self.port.store(addr.port(), Ordering::SeqCst);
        *guard = Some(child);
        Ok(())
    }

    async fn stop(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            info!("Stopping {} helper", self.kind.method());
            if let Err(e) = child.kill().await {
                debug!("{} helper kill failed: {}", self.kind.method(), e);
            }
        }
        self.port.store(0, Ordering::SeqCst);
    }

    fn local_port(&self) -> Option<u16> {
        match self.port.load(Ordering::SeqCst) {
            0 => None,
            port => Some(port),
        }
    }

    fn is_running(&self) -> bool {
        self.local_port().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cmethod() {
        let msg = PtMessage::parse("CMETHOD obfs4 socks5 127.0.0.1:41234").unwrap();
        assert_eq!(
            msg,
            PtMessage::Method {
                name: "obfs4".into(),
                addr: "127.0.0.1:41234".parse().unwrap()
            }
        );
    }

    #[test]
    fn test_parse_cmethod_error() {
        let msg = PtMessage::parse("CMETHOD-ERROR snowflake no broker configured").unwrap();
        assert_eq!(
            msg,
            PtMessage::MethodError {
                name: "snowflake".into(),
                message: "no broker configured".into()
            }
        );
    }

    #[test]
    fn test_parse_malformed_cmethod() {
        assert!(PtMessage::parse("CMETHOD obfs4 socks5").is_err());
        assert!(PtMessage::parse("CMETHOD obfs4 socks5 nowhere").is_err());
    }

    #[test]
    fn test_parse_done_and_other() {
        assert_eq!(PtMessage::parse("CMETHODS DONE").unwrap(), PtMessage::MethodsDone);
        assert!(matches!(
            PtMessage::parse("something else").unwrap(),
            PtMessage::Other(_)
        ));
    }

    #[tokio::test]
    async fn test_handshake_reports_listener() {
        let output = b"VERSION 1\nLOG SEVERITY=notice MESSAGE=\"hi\"\nCMETHOD obfs4 socks5 127.0.0.1:5000\nCMETHODS DONE\n";
        let mut lines = BufReader::new(&output[..]).lines();
        let addr = read_handshake(&mut lines, "obfs4").await.unwrap();
        assert_eq!(addr.port(), 5000);
    }

    #[tokio::test]
    async fn test_handshake_version_mismatch() {
        let output = b"VERSION 2\n";
        let mut lines = BufReader::new(&output[..]).lines();
        assert!(matches!(
            read_handshake(&mut lines, "obfs4").await,
            Err(TransportError::VersionMismatch)
        ));
    }

    #[tokio::test]
    async fn test_handshake_eof() {
        let output = b"VERSION 1\n";
        let mut lines = BufReader::new(&output[..]).lines();
        assert!(matches!(
            read_handshake(&mut lines, "snowflake").await,
            Err(TransportError::Exited)
        ));
    }

    #[tokio::test]
    async fn test_start_without_binary_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let helper = ManagedTransport::new(HelperKind::Obfs4, None, tmp.path().join("pt"));
        assert!(matches!(
            helper.start().await,
            Err(TransportError::BinaryNotFound("obfs4"))
        ));
        assert!(!helper.is_running());
    }
}
