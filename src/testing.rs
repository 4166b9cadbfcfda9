//! In-memory collaborators for unit tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::autoconf::{AutoConfError, AutoConfigure};
use crate::client::{ClientConfiguration, ClientLauncher, ClientProcess, LaunchError};
use crate::control::{
    Circuit, ControlChannel, ControlConnector, ControlError, ObserverId, StatusEvent,
    Subscription,
};
use crate::sibling::{SiblingDiscovery, SiblingError, SiblingInfo, SiblingStatus};
use crate::store::SettingsStore;
use crate::transport::{Transport, TransportError, TransportHelper};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Serve a single HTTP response on a fresh local port.
pub async fn serve_http_once(status: &'static str, body: &'static str) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            if let Some(end) = find_header_end(&request) {
                let length = content_length(&request[..end]);
                while request.len() < end + length {
                    let n = stream.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                }
                break;
            }
        }
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.ok();
    });
    addr
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn content_length(headers: &[u8]) -> usize {
    String::from_utf8_lossy(headers)
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())
                .flatten()
        })
        .unwrap_or(0)
}

pub struct FakeHelper {
    port: u16,
    running: AtomicBool,
    pub starts: AtomicUsize,
    pub fail: AtomicBool,
}

impl FakeHelper {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            running: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TransportHelper for FakeHelper {
    async fn start(&self) -> Result<(), TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Exited);
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn local_port(&self) -> Option<u16> {
        self.is_running().then_some(self.port)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Control channel that records every request.
#[derive(Default)]
pub struct FakeControl {
    connected: AtomicBool,
    calls: Mutex<Vec<String>>,
    info: Mutex<HashMap<String, String>>,
    circuits: Mutex<Vec<Circuit>>,
    next_id: AtomicU64,
    status: Mutex<HashMap<u64, mpsc::UnboundedSender<StatusEvent>>>,
    circuit: Mutex<HashMap<u64, mpsc::UnboundedSender<bool>>>,
    pub fail_connect: AtomicBool,
    pub fail_auth: AtomicBool,
}

impl FakeControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_info(&self, key: &str, value: &str) {
        lock(&self.info).insert(key.to_string(), value.to_string());
    }

    pub fn set_circuits(&self, circuits: Vec<Circuit>) {
        *lock(&self.circuits) = circuits;
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Number of recorded calls starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.status).len() + lock(&self.circuit).len()
    }

    pub fn has_circuit_observer(&self) -> bool {
        !lock(&self.circuit).is_empty()
    }

    pub fn emit_progress(&self, progress: u8) {
        let event = StatusEvent {
            kind: "STATUS_CLIENT".into(),
            severity: "NOTICE".into(),
            action: "BOOTSTRAP".into(),
            args: HashMap::from([("PROGRESS".to_string(), progress.to_string())]),
        };
        for tx in lock(&self.status).values() {
            let _ = tx.send(event.clone());
        }
    }

    pub fn emit_circuit(&self, established: bool) {
        for tx in lock(&self.circuit).values() {
            let _ = tx.send(established);
        }
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl ControlChannel for FakeControl {
    async fn connect(&self) -> Result<(), ControlError> {
        self.record("connect".into());
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ControlError::PortFile("control-port".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn authenticate(&self, cookie: &[u8]) -> Result<(), ControlError> {
        self.record(format!("AUTHENTICATE {}", hex::encode(cookie)));
        if self.fail_auth.load(Ordering::SeqCst) {
            return Err(ControlError::Rejected {
                code: 515,
                message: "Authentication failed".into(),
            });
        }
        Ok(())
    }

    fn add_status_observer(&self) -> Subscription<StatusEvent> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.status).insert(id, tx);
        Subscription {
            id: ObserverId(id),
            events: rx,
        }
    }

    fn add_circuit_observer(&self) -> Subscription<bool> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.circuit).insert(id, tx);
        Subscription {
            id: ObserverId(id),
            events: rx,
        }
    }

    fn remove_observer(&self, id: ObserverId) {
        lock(&self.status).remove(&id.0);
        lock(&self.circuit).remove(&id.0);
    }

    async fn get_info(&self, keys: &[&str]) -> Result<Vec<String>, ControlError> {
        self.record(format!("GETINFO {}", keys.join(" ")));
        let info = lock(&self.info);
        keys.iter()
            .map(|k| {
                info.get(*k)
                    .cloned()
                    .ok_or_else(|| ControlError::Rejected {
                        code: 552,
                        message: format!("Unrecognized key \"{}\"", k),
                    })
            })
            .collect()
    }

    async fn set_confs(&self, confs: &[(String, String)]) -> Result<(), ControlError> {
        let rendered: Vec<String> = confs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        self.record(format!("SETCONF {}", rendered.join(" ")));
        Ok(())
    }

    async fn reset_conf(&self, key: &str) -> Result<(), ControlError> {
        self.record(format!("RESETCONF {}", key));
        Ok(())
    }

    async fn reset_connection(&self) -> Result<(), ControlError> {
        self.record("SIGNAL NEWNYM".into());
        Ok(())
    }

    async fn disconnect(&self) {
        self.record("disconnect".into());
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn get_circuits(&self) -> Result<Vec<Circuit>, ControlError> {
        self.record("GETINFO circuit-status".into());
        Ok(lock(&self.circuits).clone())
    }

    async fn close_circuits(&self, circuits: &[Circuit]) -> Result<bool, ControlError> {
        for circuit in circuits {
            self.record(format!("CLOSECIRCUIT {}", circuit.id));
        }
        Ok(true)
    }
}

pub struct FakeConnector {
    control: Arc<FakeControl>,
    pub opened: AtomicUsize,
}

impl FakeConnector {
    pub fn new(control: Arc<FakeControl>) -> Self {
        Self {
            control,
            opened: AtomicUsize::new(0),
        }
    }
}

impl ControlConnector for FakeConnector {
    fn open(&self, _config: &ClientConfiguration) -> Arc<dyn ControlChannel> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.control.clone()
    }
}

/// Launcher that pretends to be tor: it takes the data directory lock and
/// writes an auth cookie.
#[derive(Default)]
pub struct FakeLauncher {
    pub launches: AtomicUsize,
    pub skip_cookie: AtomicBool,
    /// Milliseconds each launch takes.
    pub delay_ms: AtomicU64,
    processes: Mutex<Vec<Arc<AtomicBool>>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Number of launched processes still executing.
    pub fn running(&self) -> usize {
        lock(&self.processes)
            .iter()
            .filter(|p| p.load(Ordering::SeqCst))
            .count()
    }
}

#[async_trait]
impl ClientLauncher for FakeLauncher {
    async fn launch(
        &self,
        config: &ClientConfiguration,
    ) -> Result<Box<dyn ClientProcess>, LaunchError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        std::fs::create_dir_all(&config.data_dir)?;
        let lock_file = config.data_dir.join("lock");
        std::fs::write(&lock_file, b"")?;
        if !self.skip_cookie.load(Ordering::SeqCst) {
            std::fs::write(&config.cookie_file, [0xAB; 32])?;
        }

        let executing = Arc::new(AtomicBool::new(true));
        lock(&self.processes).push(executing.clone());
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(Box::new(FakeProcess {
            executing,
            lock_file,
        }))
    }
}

pub struct FakeProcess {
    executing: Arc<AtomicBool>,
    lock_file: PathBuf,
}

#[async_trait]
impl ClientProcess for FakeProcess {
    fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    async fn cancel(&mut self) {
        self.executing.store(false, Ordering::SeqCst);
        let _ = std::fs::remove_file(&self.lock_file);
    }
}

pub struct FakeSibling {
    installed: bool,
    status: SiblingStatus,
    bypass_port: Option<u16>,
    http_error: Option<u16>,
    delay: Duration,
}

impl FakeSibling {
    pub fn with_status(status: SiblingStatus, bypass_port: Option<u16>) -> Self {
        Self {
            installed: true,
            status,
            bypass_port,
            http_error: None,
            delay: Duration::ZERO,
        }
    }

    pub fn http_error(status: u16) -> Self {
        Self {
            http_error: Some(status),
            ..Self::with_status(SiblingStatus::Stopped, None)
        }
    }

    pub fn absent() -> Self {
        Self {
            installed: false,
            ..Self::with_status(SiblingStatus::Stopped, None)
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl SiblingDiscovery for FakeSibling {
    fn installed(&self) -> bool {
        self.installed
    }

    async fn info(&self) -> Result<SiblingInfo, SiblingError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(status) = self.http_error {
            return Err(SiblingError::Http { status });
        }
        Ok(SiblingInfo {
            status: self.status,
            bypass_port: self.bypass_port,
        })
    }
}

/// Auto-configuration that selects a fixed transport, or fails.
pub struct FakeAutoConf {
    result: Option<Transport>,
    pub calls: AtomicUsize,
}

impl FakeAutoConf {
    pub fn selecting(transport: Transport) -> Self {
        Self {
            result: Some(transport),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            result: None,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AutoConfigure for FakeAutoConf {
    async fn perform(&self, settings: &dyn SettingsStore) -> Result<(), AutoConfError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.result {
            Some(transport) => {
                settings.set_transport(transport);
                Ok(())
            }
            None => Err(AutoConfError::Service("unreachable".into())),
        }
    }
}
