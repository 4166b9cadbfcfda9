//! IP stack capability monitoring.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Which IP families currently have a route off the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IpStatus {
    #[default]
    Unavailable,
    Ipv4Only,
    Ipv6Only,
    Ipv4AndIpv6,
}

impl IpStatus {
    pub fn from_flags(ipv4: bool, ipv6: bool) -> Self {
        match (ipv4, ipv6) {
            (true, true) => IpStatus::Ipv4AndIpv6,
            (true, false) => IpStatus::Ipv4Only,
            (false, true) => IpStatus::Ipv6Only,
            (false, false) => IpStatus::Unavailable,
        }
    }

    /// Tor options steering which address family is used for relays.
    pub fn config_options(&self) -> Vec<(String, String)> {
        let (use_v4, use_v6, prefer_v6) = match self {
            IpStatus::Ipv6Only => ("0", "1", "1"),
            IpStatus::Ipv4AndIpv6 => ("1", "1", "auto"),
            IpStatus::Ipv4Only | IpStatus::Unavailable => ("1", "0", "0"),
        };
        vec![
            ("ClientUseIPv4".to_string(), use_v4.to_string()),
            ("ClientUseIPv6".to_string(), use_v6.to_string()),
            ("ClientPreferIPv6ORPort".to_string(), prefer_v6.to_string()),
        ]
    }
}

impl std::fmt::Display for IpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpStatus::Unavailable => write!(f, "unavailable"),
            IpStatus::Ipv4Only => write!(f, "ipv4-only"),
            IpStatus::Ipv6Only => write!(f, "ipv6-only"),
            IpStatus::Ipv4AndIpv6 => write!(f, "ipv4+ipv6"),
        }
    }
}

/// Source of IP capability updates.
pub trait NetworkMonitor: Send + Sync {
    /// Receiver holding the current status and notified on every change.
    fn subscribe(&self) -> watch::Receiver<IpStatus>;
}

/// A monitor whose status only changes when told to.
pub struct StaticMonitor {
    tx: watch::Sender<IpStatus>,
}

impl StaticMonitor {
    pub fn new(status: IpStatus) -> Self {
        let (tx, _) = watch::channel(status);
        Self { tx }
    }

    pub fn set(&self, status: IpStatus) {
        self.tx.send_replace(status);
    }
}

impl NetworkMonitor for StaticMonitor {
    fn subscribe(&self) -> watch::Receiver<IpStatus> {
        self.tx.subscribe()
    }
}

const IPV4_PROBE: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53);
const IPV6_PROBE: SocketAddr = SocketAddr::new(
    IpAddr::V6(Ipv6Addr::new(0x2606, 0x4700, 0x4700, 0, 0, 0, 0, 0x1111)),
    53,
);

/// Polls the routing table by connecting unbound UDP sockets.
///
/// `connect` on a UDP socket only selects a route, nothing is sent.
pub struct RouteProbeMonitor {
    tx: watch::Sender<IpStatus>,
    task: tokio::task::JoinHandle<()>,
}

impl RouteProbeMonitor {
    /// Spawn the polling task. Must be called inside a tokio runtime.
    pub fn spawn(interval: Duration) -> Self {
        let (tx, _) = watch::channel(IpStatus::Unavailable);
        let sender = tx.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let status = probe().await;
                sender.send_if_modified(|current| {
                    if *current != status {
                        tracing::info!("IP status changed: {} -> {}", current, status);
                        *current = status;
                        true
                    } else {
                        false
                    }
                });
            }
        });
        Self { tx, task }
    }
}

impl Drop for RouteProbeMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl NetworkMonitor for RouteProbeMonitor {
    fn subscribe(&self) -> watch::Receiver<IpStatus> {
        self.tx.subscribe()
    }
}

async fn has_route(bind: SocketAddr, target: SocketAddr) -> bool {
    match UdpSocket::bind(bind).await {
        Ok(socket) => socket.connect(target).await.is_ok(),
        Err(_) => false,
    }
}

/// Probe both address families once.
pub async fn probe() -> IpStatus {
    let v4 = has_route((Ipv4Addr::UNSPECIFIED, 0).into(), IPV4_PROBE).await;
    let v6 = has_route((Ipv6Addr::UNSPECIFIED, 0).into(), IPV6_PROBE).await;
    IpStatus::from_flags(v4, v6)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_flags() {
        assert_eq!(IpStatus::from_flags(true, true), IpStatus::Ipv4AndIpv6);
        assert_eq!(IpStatus::from_flags(false, true), IpStatus::Ipv6Only);
        assert_eq!(IpStatus::from_flags(false, false), IpStatus::Unavailable);
    }

    #[test]
    fn test_ipv6_only_disables_ipv4() {
        let options = IpStatus::Ipv6Only.config_options();
        assert!(options.contains(&("ClientUseIPv4".into(), "0".into())));
        assert!(options.contains(&("ClientPreferIPv6ORPort".into(), "1".into())));
    }

    #[tokio::test]
    async fn test_static_monitor_notifies() {
        let monitor = StaticMonitor::new(IpStatus::Ipv4Only);
        let mut rx = monitor.subscribe();
        assert_eq!(*rx.borrow(), IpStatus::Ipv4Only);

        monitor.set(IpStatus::Ipv4AndIpv6);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), IpStatus::Ipv4AndIpv6);
    }
}
