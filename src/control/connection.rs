//! Control protocol client over TCP.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::protocol::{self, Reply, ReplyAssembler};
use super::{
    Circuit, ControlChannel, ControlConnector, ControlError, ObserverId, StatusEvent,
    Subscription,
};
use crate::client::ClientConfiguration;

type PendingReply = oneshot::Sender<Result<Reply, ControlError>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Observers {
    next_id: AtomicU64,
    status: Mutex<HashMap<u64, mpsc::UnboundedSender<StatusEvent>>>,
    circuit: Mutex<HashMap<u64, mpsc::UnboundedSender<bool>>>,
}

impl Observers {
    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn dispatch(&self, reply: &Reply) {
        let Some(event) = protocol::parse_status_event(reply) else {
            debug!("Ignoring event: {}", reply.message());
            return;
        };
        let established = event.circuit_established();
        lock(&self.status).retain(|_, tx| tx.send(event.clone()).is_ok());
        if let Some(established) = established {
            lock(&self.circuit).retain(|_, tx| tx.send(established).is_ok());
        }
    }
}

struct Session {
    /// Held while writing a command and enqueueing its reply slot, so reply
    /// order matches command order.
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Arc<Mutex<VecDeque<PendingReply>>>,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

async fn read_loop(
    read: OwnedReadHalf,
    pending: Arc<Mutex<VecDeque<PendingReply>>>,
    observers: Arc<Observers>,
    alive: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(read).lines();
    let mut assembler = ReplyAssembler::default();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Control connection read failed: {}", e);
                break;
            }
        };
        match assembler.push(&line) {
            Ok(Some(reply)) if reply.is_event() => observers.dispatch(&reply),
            Ok(Some(reply)) => match lock(&pending).pop_front() {
                Some(tx) => {
                    let _ = tx.send(Ok(reply));
                }
                None => warn!("Unsolicited control reply: {}", reply.message()),
            },
            Ok(None) => {}
            Err(e) => {
                warn!("Control protocol error: {}", e);
                break;
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    for tx in lock(&pending).drain(..) {
        let _ = tx.send(Err(ControlError::Closed));
    }
    debug!("Control connection closed");
}

/// Read the `PORT=host:port` line tor writes for `ControlPortWriteToFile`.
pub(crate) async fn read_port_file(path: &Path) -> Result<SocketAddr, ControlError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|_| ControlError::PortFile(path.display().to_string()))?;
    contents
        .lines()
        .find_map(|line| line.trim().strip_prefix("PORT="))
        .and_then(|addr| addr.parse().ok())
        .ok_or_else(|| ControlError::PortFile(path.display().to_string()))
}

/// A control connection located through tor's control port file.
pub struct TorControlConnection {
    port_file: PathBuf,
    session: Mutex<Option<Arc<Session>>>,
    observers: Arc<Observers>,
}

impl TorControlConnection {
    pub fn new(port_file: impl Into<PathBuf>) -> Self {
        Self {
            port_file: port_file.into(),
            session: Mutex::new(None),
            observers: Arc::new(Observers::default()),
        }
    }

    fn session(&self) -> Result<Arc<Session>, ControlError> {
        lock(&self.session)
            .as_ref()
            .filter(|s| s.alive.load(Ordering::SeqCst))
            .cloned()
            .ok_or(ControlError::NotConnected)
    }

    async fn send(&self, command: &str) -> Result<Reply, ControlError> {
        let session = self.session()?;
        let rx = {
            let mut writer = session.writer.lock().await;
            let (tx, rx) = oneshot::channel();
            lock(&session.pending).push_back(tx);
            writer.write_all(command.as_bytes()).await?;
            writer.write_all(b"\r\n").await?;
            rx
        };
        rx.await.map_err(|_| ControlError::Closed)?
    }

    /// Send a command and require a 250 reply.
    async fn command(&self, command: &str) -> Result<Reply, ControlError> {
        debug!("control> {}", command);
        let reply = self.send(command).await?;
        debug!("control< {} {}", reply.code(), reply.message());
        reply.into_result()
    }
}

#[async_trait]
impl ControlChannel for TorControlConnection {
    async fn connect(&self) -> Result<(), ControlError> {
        if self.is_connected() {
            return Ok(());
        }
        let addr = read_port_file(&self.port_file).await?;
        debug!("Connecting to control port {}", addr);
        let stream = TcpStream::connect(addr).await?;
        let (read, write) = stream.into_split();

        let pending = Arc::new(Mutex::new(VecDeque::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(
            read,
            pending.clone(),
            self.observers.clone(),
            alive.clone(),
        ));

        let previous = lock(&self.session).replace(Arc::new(Session {
            writer: tokio::sync::Mutex::new(write),
            pending,
            alive,
            reader,
        }));
        if let Some(old) = previous {
            old.reader.abort();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session().is_ok()
    }

    async fn authenticate(&self, cookie: &[u8]) -> Result<(), ControlError> {
        debug!("control> AUTHENTICATE <cookie>");
        self.send(&format!("AUTHENTICATE {}", hex::encode(cookie)))
            .await?
            .into_result()?;
        self.command("SETEVENTS STATUS_CLIENT").await?;
        Ok(())
    }

    fn add_status_observer(&self) -> Subscription<StatusEvent> {
        let id = self.observers.next();
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.observers.status).insert(id, tx);
        Subscription {
            id: ObserverId(id),
            events: rx,
        }
    }

    fn add_circuit_observer(&self) -> Subscription<bool> {
        let id = self.observers.next();
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.observers.circuit).insert(id, tx);
        Subscription {
            id: ObserverId(id),
            events: rx,
        }
    }

    fn remove_observer(&self, id: ObserverId) {
        lock(&self.observers.status).remove(&id.0);
        lock(&self.observers.circuit).remove(&id.0);
    }

    async fn get_info(&self, keys: &[&str]) -> Result<Vec<String>, ControlError> {
        let reply = self.command(&format!("GETINFO {}", keys.join(" "))).await?;
        protocol::parse_get_info(&reply, keys)
    }

    async fn set_confs(&self, confs: &[(String, String)]) -> Result<(), ControlError> {
        if confs.is_empty() {
            return Ok(());
        }
        let assignments: Vec<String> = confs
            .iter()
            .map(|(key, value)| format!("{}={}", key, protocol::quote(value)))
            .collect();
        self.command(&format!("SETCONF {}", assignments.join(" ")))
            .await?;
        Ok(())
    }

    async fn reset_conf(&self, key: &str) -> Result<(), ControlError> {
        self.command(&format!("RESETCONF {}", key)).await?;
        Ok(())
    }

    async fn reset_connection(&self) -> Result<(), ControlError> {
        self.command("SIGNAL NEWNYM").await?;
        Ok(())
    }

    async fn disconnect(&self) {
        let session = lock(&self.session).take();
        if let Some(session) = session {
            session.alive.store(false, Ordering::SeqCst);
            let mut writer = session.writer.lock().await;
            let _ = writer.shutdown().await;
            session.reader.abort();
            for tx in lock(&session.pending).drain(..) {
                let _ = tx.send(Err(ControlError::Closed));
            }
        }
    }

    async fn get_circuits(&self) -> Result<Vec<Circuit>, ControlError> {
        let values = self.get_info(&["circuit-status"]).await?;
        Ok(values
            .first()
            .map(|block| protocol::parse_circuits(block))
            .unwrap_or_default())
    }

    async fn close_circuits(&self, circuits: &[Circuit]) -> Result<bool, ControlError> {
        let mut all_closed = true;
        for circuit in circuits {
            match self.command(&format!("CLOSECIRCUIT {}", circuit.id)).await {
                Ok(_) => {}
                Err(ControlError::Rejected { code, message }) => {
                    debug!("Circuit {} not closed ({}): {}", circuit.id, code, message);
                    all_closed = false;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(all_closed)
    }
}

/// Opens [`TorControlConnection`]s from a configuration's port file.
#[derive(Debug, Clone, Copy, Default)]
pub struct TorControlConnector;

impl ControlConnector for TorControlConnector {
    fn open(&self, config: &ClientConfiguration) -> Arc<dyn ControlChannel> {
        Arc::new(TorControlConnection::new(config.control_port_file.clone()))
    }
}
