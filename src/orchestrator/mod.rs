//! Connection orchestration.
//!
//! [`ConnectionOrchestrator`] drives one tor client from launch to a usable
//! SOCKS proxy. With smart connect enabled a [`StallGuard`] watches bootstrap
//! progress and walks the transport cascade whenever tor stops making
//! progress for too long.


use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::autoconf::AutoConfigure;
use crate::client::{
    ClientConfigBuilder, ClientConfiguration, ClientLauncher, ClientProcess, Directories,
};
use crate::control::protocol::unquote;
use crate::control::{
    Circuit, ControlChannel, ControlConnector, ControlError, ObserverId, StatusEvent,
    Subscription,
};
use crate::error::ConnectError;
use crate::network::{IpStatus, NetworkMonitor};
use crate::sibling::SiblingDetector;
use crate::stall::{next_transport, Liveness, StallGuard, StallOutcome, LIVENESS_GRACE, TICK};
use crate::store::SettingsStore;
use crate::transport::{Transport, TransportSet};

/// Time tor gets to write its control port file after launch.
pub const SETTLE_DELAY: Duration = Duration::from_millis(650);

/// Receives bootstrap percentages.
pub type ProgressCallback = Box<dyn Fn(u8) + Send + Sync>;

/// Options for [`ConnectionOrchestrator::start`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Ask the circumvention settings service for a transport first.
    pub auto_conf: bool,
    /// Fall through the transport cascade on stalls.
    pub smart_connect: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub settle_delay: Duration,
    pub stall_tick: Duration,
    pub liveness_grace: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            settle_delay: SETTLE_DELAY,
            stall_tick: TICK,
            liveness_grace: LIVENESS_GRACE,
        }
    }
}

/// Collaborators of a [`ConnectionOrchestrator`].
pub struct OrchestratorParts {
    pub settings: Arc<dyn SettingsStore>,
    pub transports: TransportSet,
    pub sibling: SiblingDetector,
    pub autoconf: Arc<dyn AutoConfigure>,
    pub launcher: Arc<dyn ClientLauncher>,
    pub connector: Arc<dyn ControlConnector>,
    pub monitor: Arc<dyn NetworkMonitor>,
    pub directories: Directories,
    pub timing: Timing,
}

/// Address of tor's SOCKS listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksEndpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for SocksEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parse the first address of a `net/listeners/socks` value.
pub fn parse_socks_listener(value: &str) -> Option<SocksEndpoint> {
    let first = unquote(value.split_whitespace().next()?);
    let (host, port) = first.rsplit_once(':')?;
    let port = port.parse::<u16>().ok().filter(|p| *p != 0)?;
    if host.is_empty() {
        return None;
    }
    Some(SocksEndpoint {
        host: host.to_string(),
        port,
    })
}

#[derive(Default)]
struct State {
    process: Option<Box<dyn ClientProcess>>,
    control: Option<Arc<dyn ControlChannel>>,
    config: Option<ClientConfiguration>,
    socks: Option<SocksEndpoint>,
    guard: Option<StallGuard>,
    progress_observer: Option<ObserverId>,
    circuit_observer: Option<ObserverId>,
    ip_status: IpStatus,
}

impl State {
    fn is_connected(&self) -> bool {
        self.process.as_ref().is_some_and(|p| p.is_executing())
            && self.config.as_ref().is_some_and(|c| c.is_locked())
            && self.control.as_ref().is_some_and(|c| c.is_connected())
    }
}

struct Inner {
    settings: Arc<dyn SettingsStore>,
    transports: TransportSet,
    sibling: SiblingDetector,
    autoconf: Arc<dyn AutoConfigure>,
    launcher: Arc<dyn ClientLauncher>,
    connector: Arc<dyn ControlConnector>,
    directories: Directories,
    timing: Timing,
    liveness: Arc<Liveness>,
    /// Bumped on every teardown. An in-flight start that sees a different
    /// value has been cancelled.
    epoch: watch::Sender<u64>,
    start_lock: tokio::sync::Mutex<()>,
    state: Mutex<State>,
}

/// Supervises one tor client and its transports.
pub struct ConnectionOrchestrator {
    inner: Arc<Inner>,
    _monitor: Arc<dyn NetworkMonitor>,
    ip_task: JoinHandle<()>,
}

impl ConnectionOrchestrator {
    /// Must be called inside a tokio runtime: IP status changes are watched
    /// by a background task for the lifetime of the orchestrator.
    pub fn new(parts: OrchestratorParts) -> Self {
        let mut ip_rx = parts.monitor.subscribe();
        let ip_status = *ip_rx.borrow_and_update();
        let (epoch, _) = watch::channel(0u64);

        let inner = Arc::new(Inner {
            settings: parts.settings,
            transports: parts.transports,
            sibling: parts.sibling,
            autoconf: parts.autoconf,
            launcher: parts.launcher,
            connector: parts.connector,
            directories: parts.directories,
            liveness: Arc::new(Liveness::new(parts.timing.liveness_grace)),
            timing: parts.timing,
            epoch,
            start_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(State {
                ip_status,
                ..State::default()
            }),
        });

        let weak = Arc::downgrade(&inner);
        let ip_task = tokio::spawn(async move {
            while ip_rx.changed().await.is_ok() {
                let status = *ip_rx.borrow_and_update();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.ip_status_changed(status).await;
            }
        });

        Self {
            inner,
            _monitor: parts.monitor,
            ip_task,
        }
    }

    /// Start tor and wait until a circuit is established.
    ///
    /// When already connected this only reapplies the transport settings.
    pub async fn start(
        &self,
        options: StartOptions,
        on_progress: Option<ProgressCallback>,
    ) -> Result<(), ConnectError> {
        let Ok(_running) = self.inner.start_lock.try_lock() else {
            return Err(ConnectError::StartInProgress);
        };
        if self.is_connected() {
            self.inner.reconfigure_bridges().await;
            return Ok(());
        }
        self.inner.start(options, on_progress).await
    }

    /// Tear everything down. Safe to call at any time, any number of times.
    pub async fn stop(&self) {
        self.inner.teardown().await;
    }

    /// Apply the stored transport to the running tor.
    pub async fn reconfigure_bridges(&self) {
        self.inner.reconfigure_bridges().await;
    }

    pub async fn get_circuits(&self) -> Result<Vec<Circuit>, ControlError> {
        self.inner.control()?.get_circuits().await
    }

    pub async fn close_circuits(&self, circuits: &[Circuit]) -> Result<bool, ControlError> {
        self.inner.control()?.close_circuits(circuits).await
    }

    /// Build the configuration a start would currently use.
    pub fn create_configuration(&self, bypass_port: Option<u16>) -> io::Result<ClientConfiguration> {
        self.inner.create_configuration(bypass_port)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock_state().is_connected()
    }

    pub fn socks_endpoint(&self) -> Option<SocksEndpoint> {
        self.inner.lock_state().socks.clone()
    }

    /// `socks5h://` URL of the SOCKS listener, resolving names through tor.
    pub fn socks_proxy_url(&self) -> Option<String> {
        self.socks_endpoint()
            .map(|e| format!("socks5h://{}:{}", e.host, e.port))
    }

    /// A proxy routing all reqwest traffic through tor, once connected.
    pub fn socks_proxy(&self) -> Result<Option<reqwest::Proxy>, reqwest::Error> {
        self.socks_proxy_url().map(reqwest::Proxy::all).transpose()
    }

    pub fn ip_status(&self) -> IpStatus {
        self.inner.lock_state().ip_status
    }

    pub fn transport(&self) -> Transport {
        self.inner.settings.transport()
    }

    pub fn custom_bridges(&self) -> Vec<String> {
        self.inner.settings.custom_bridges()
    }
}

impl Drop for ConnectionOrchestrator {
    fn drop(&mut self) {
        self.ip_task.abort();
    }
}

async fn next_status(sub: &mut Option<Subscription<StatusEvent>>) -> Option<StatusEvent> {
    match sub {
        Some(sub) => sub.events.recv().await,
        None => std::future::pending().await,
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_epoch(&self, epoch: u64) -> Result<(), ConnectError> {
        if *self.epoch.borrow() == epoch {
            Ok(())
        } else {
            Err(ConnectError::Cancelled)
        }
    }

    /// Run `f` on the state unless a teardown happened since `epoch`.
    ///
    /// Teardown bumps the epoch while holding the state lock, so nothing
    /// stored here can outlive a concurrent stop.
    fn with_live_state<R>(
        &self,
        epoch: u64,
        f: impl FnOnce(&mut State) -> R,
    ) -> Result<R, ConnectError> {
        let mut state = self.lock_state();
        self.ensure_epoch(epoch)?;
        Ok(f(&mut state))
    }

    /// Tear down after a failed start, unless a stop already did.
    async fn abort(&self, epoch: u64, error: ConnectError) -> ConnectError {
        if self.ensure_epoch(epoch).is_err() {
            return ConnectError::Cancelled;
        }
        warn!("Start failed: {}", error);
        self.teardown().await;
        error
    }

    fn control(&self) -> Result<Arc<dyn ControlChannel>, ControlError> {
        self.lock_state()
            .control
            .clone()
            .ok_or(ControlError::NotConnected)
    }

    fn connected_control(&self) -> Option<Arc<dyn ControlChannel>> {
        let state = self.lock_state();
        if state.is_connected() {
            state.control.clone()
        } else {
            None
        }
    }

    fn create_configuration(&self, bypass_port: Option<u16>) -> io::Result<ClientConfiguration> {
        let transport = self.settings.transport();
        let arguments = self
            .transports
            .arguments(transport, &self.settings.custom_bridges());
        let ip_status = self.lock_state().ip_status;

        ClientConfigBuilder::new(&self.directories)
            .transport(transport, arguments)
            .ip_status(ip_status)
            .bypass_port(bypass_port)
            .build()
    }

    async fn start(
        self: &Arc<Self>,
        options: StartOptions,
        on_progress: Option<ProgressCallback>,
    ) -> Result<(), ConnectError> {
        let mut epoch_rx = self.epoch.subscribe();
        let epoch = *epoch_rx.borrow_and_update();

        let sibling = self.sibling.evaluate().await;
        self.ensure_epoch(epoch)?;
        if sibling.running && sibling.bypass_port.is_none() {
            return Err(self.abort(epoch, ConnectError::SiblingRunningNoBypass).await);
        }
        if let Some(port) = sibling.bypass_port {
            info!("Routing tor through sibling bypass port {}", port);
        }

        self.lock_state().socks = None;

        if options.auto_conf {
            if let Err(e) = self.autoconf.perform(self.settings.as_ref()).await {
                warn!("Auto-configuration failed: {}", e);
                if options.smart_connect {
                    self.settings.set_transport(Transport::None);
                }
            }
            self.ensure_epoch(epoch)?;
        }

        let transport = self.settings.transport();
        info!("Connecting with transport {}", transport);
        if let Err(e) = self.transports.start(transport).await {
            return Err(self.abort(epoch, e.into()).await);
        }
        self.ensure_epoch(epoch)?;

        let config = match self.create_configuration(sibling.bypass_port) {
            Ok(config) => config,
            Err(e) => return Err(self.abort(epoch, e.into()).await),
        };

        self.teardown_client().await;
        let mut process = match self.launcher.launch(&config).await {
            Ok(process) => Some(process),
            Err(e) => return Err(self.abort(epoch, e.into()).await),
        };
        let stored = self.with_live_state(epoch, |state| {
            state.process = process.take();
            state.config = Some(config.clone());
        });
        if let Err(e) = stored {
            if let Some(mut process) = process {
                process.cancel().await;
            }
            return Err(e);
        }

        tokio::time::sleep(self.timing.settle_delay).await;

        let control = self.with_live_state(epoch, |state| {
            state
                .control
                .get_or_insert_with(|| self.connector.open(&config))
                .clone()
        })?;
        if !control.is_connected() {
            if let Err(e) = control.connect().await {
                return Err(self.abort(epoch, e.into()).await);
            }
            if self.ensure_epoch(epoch).is_err() {
                control.disconnect().await;
                return Err(ConnectError::Cancelled);
            }
        }

        let cookie = match config.read_cookie() {
            Ok(cookie) => cookie,
            Err(e) => {
                debug!("Cookie {}: {}", config.cookie_file.display(), e);
                return Err(self.abort(epoch, ConnectError::CookieUnreadable).await);
            }
        };
        if let Err(e) = control.authenticate(&cookie).await {
            return Err(self.abort(epoch, e.into()).await);
        }
        self.ensure_epoch(epoch)?;

        let (give_up_tx, mut give_up_rx) = mpsc::unbounded_channel();
        if options.smart_connect {
            self.liveness.connection_alive();
            let guard = self.spawn_guard(give_up_tx);
            self.with_live_state(epoch, |state| state.guard = Some(guard))?;
        } else {
            drop(give_up_tx);
        }

        let mut progress = if options.smart_connect || on_progress.is_some() {
            let sub = control.add_status_observer();
            let id = sub.id;
            self.with_live_state(epoch, |state| state.progress_observer = Some(id))?;
            Some(sub)
        } else {
            None
        };
        let mut circuit = control.add_circuit_observer();
        let circuit_id = circuit.id;
        self.with_live_state(epoch, |state| state.circuit_observer = Some(circuit_id))?;

        // The event may have fired before the observer existed.
        let mut established = match control.get_info(&["status/circuit-established"]).await {
            Ok(values) => values.first().is_some_and(|v| v == "1"),
            Err(e) => {
                debug!("status/circuit-established unavailable: {}", e);
                false
            }
        };
        self.ensure_epoch(epoch)?;

        let mut last_progress = 0u8;
        while !established {
            tokio::select! {
                biased;

                _ = epoch_rx.changed() => return Err(ConnectError::Cancelled),

                Some(()) = give_up_rx.recv() => {
                    return Err(self.abort(epoch, ConnectError::SmartConnectFailed).await);
                }

                event = next_status(&mut progress) => {
                    let Some(event) = event else {
                        progress = None;
                        continue;
                    };
                    let Some(value) = event.bootstrap_progress() else {
                        continue;
                    };
                    if value < last_progress {
                        continue;
                    }
                    if value > last_progress {
                        self.liveness.connection_alive();
                    }
                    last_progress = value;
                    debug!("Bootstrapped {}%", value);
                    if let Some(callback) = &on_progress {
                        callback(value);
                    }
                    if value >= 100 {
                        if let Some(sub) = progress.take() {
                            control.remove_observer(sub.id);
                        }
                        self.lock_state().progress_observer = None;
                    }
                }

                update = circuit.events.recv() => match update {
                    Some(true) => established = true,
                    Some(false) => debug!("Circuit not established yet"),
                    None => return Err(self.abort(epoch, ControlError::Closed.into()).await),
                },
            }
        }

        // A stall handler already running completes its reconfiguration; the
        // guard stays in state so a later stop can still abort it.
        let observers = {
            let mut state = self.lock_state();
            if let Some(guard) = &state.guard {
                guard.finish();
            }
            [state.progress_observer.take(), state.circuit_observer.take()]
        };
        for id in observers.into_iter().flatten() {
            control.remove_observer(id);
        }

        let listener = match control.get_info(&["net/listeners/socks"]).await {
            Ok(values) => values.into_iter().next(),
            Err(e) => return Err(self.abort(epoch, e.into()).await),
        };
        self.ensure_epoch(epoch)?;

        let Some(endpoint) = listener.as_deref().and_then(parse_socks_listener) else {
            warn!("Unusable SOCKS listener: {:?}", listener);
            return Err(self.abort(epoch, ConnectError::NoSocksAddr).await);
        };
        info!("Tor SOCKS proxy ready at {}", endpoint);
        self.lock_state().socks = Some(endpoint);
        Ok(())
    }

    fn spawn_guard(self: &Arc<Self>, give_up: mpsc::UnboundedSender<()>) -> StallGuard {
        let weak = Arc::downgrade(self);
        StallGuard::spawn(self.liveness.clone(), self.timing.stall_tick, move || {
            let weak = weak.clone();
            let give_up = give_up.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.handle_stall(&give_up).await,
                    None => StallOutcome::GiveUp,
                }
            }
        })
    }

    async fn handle_stall(&self, give_up: &mpsc::UnboundedSender<()>) -> StallOutcome {
        let current = self.settings.transport();
        let has_custom = !self.settings.custom_bridges().is_empty();
        let Some(next) = next_transport(current, has_custom) else {
            warn!("Bootstrap stalled on {}, no transports left", current);
            let _ = give_up.send(());
            return StallOutcome::GiveUp;
        };

        info!("Bootstrap stalled on {}, switching to {}", current, next);
        if current.helper() != next.helper() {
            self.transports.stop(current).await;
        }
        if let Err(e) = self.transports.start(next).await {
            warn!("Failed to start {} helper: {}", next, e);
        }
        self.settings.set_transport(next);
        self.liveness.connection_alive();
        self.reconfigure_bridges().await;
        StallOutcome::Continue
    }

    async fn reconfigure_bridges(&self) {
        let Some(control) = self.connected_control() else {
            debug!("Not connected, skipping bridge reconfiguration");
            return;
        };

        for key in ["UseBridges", "ClientTransportPlugin", "Bridge"] {
            if let Err(e) = control.reset_conf(key).await {
                warn!("Failed to reset {}: {}", key, e);
            }
        }

        let transport = self.settings.transport();
        self.transports.stop_others(transport).await;
        if transport == Transport::None {
            return;
        }
        if let Err(e) = self.transports.start(transport).await {
            warn!("Failed to start {} helper: {}", transport, e);
            return;
        }

        let mut confs = self
            .transports
            .config_options(transport, &self.settings.custom_bridges());
        confs.push(("UseBridges".to_string(), "1".to_string()));
        if let Err(e) = control.set_confs(&confs).await {
            warn!("Failed to apply {} bridges: {}", transport, e);
        }
    }

    async fn ip_status_changed(&self, status: IpStatus) {
        self.lock_state().ip_status = status;
        let Some(control) = self.connected_control() else {
            return;
        };

        let transport = self.settings.transport();
        let mut confs = self
            .transports
            .config_options(transport, &self.settings.custom_bridges());
        confs.extend(status.config_options());

        if let Err(e) = control.set_confs(&confs).await {
            warn!("Failed to apply IP status {}: {}", status, e);
            return;
        }
        if let Err(e) = control.reset_connection().await {
            warn!("Failed to request new circuits: {}", e);
        }
        match control.get_circuits().await {
            Ok(circuits) => {
                if let Err(e) = control.close_circuits(&circuits).await {
                    warn!("Failed to close circuits: {}", e);
                }
            }
            Err(e) => warn!("Failed to list circuits: {}", e),
        }
    }

    /// Drop the process and control channel of a previous start.
    async fn teardown_client(&self) {
        let (control, process) = {
            let mut state = self.lock_state();
            (state.control.take(), state.process.take())
        };
        if let Some(control) = control {
            control.disconnect().await;
        }
        if let Some(mut process) = process {
            process.cancel().await;
        }
    }

    async fn teardown(&self) {
        let (guard, control, observers, process) = {
            let mut state = self.lock_state();
            self.epoch.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
            state.config = None;
            state.socks = None;
            (
                state.guard.take(),
                state.control.take(),
                [state.progress_observer.take(), state.circuit_observer.take()],
                state.process.take(),
            )
        };

        if let Some(control) = &control {
            for id in observers.into_iter().flatten() {
                control.remove_observer(id);
            }
        }
        if let Some(guard) = guard {
            guard.stop();
        }
        self.transports.stop(self.settings.transport()).await;
        if let Some(control) = control {
            control.disconnect().await;
        }
        if let Some(mut process) = process {
            process.cancel().await;
            info!("Tor stopped");
        }
    }
}
