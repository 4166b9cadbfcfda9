//! Launch configuration for the tor client.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use crate::network::IpStatus;
use crate::provision::ensure_private_dir;
use crate::transport::Transport;

/// File tor writes its control port address to.
const CONTROL_PORT_FILE: &str = "control-port";

/// Cookie file used for control port authentication.
const COOKIE_FILE: &str = "control_auth_cookie";

/// Lock file tor holds while it owns the data directory.
const LOCK_FILE: &str = "lock";

/// Well-known GeoIP database locations.
const GEOIP_CANDIDATES: &[&str] = &[
    "/usr/share/tor/geoip",
    "/usr/local/share/tor/geoip",
    "/opt/homebrew/share/tor/geoip",
];

#[cfg(windows)]
const NULL_DEVICE: &str = "NUL";
#[cfg(not(windows))]
const NULL_DEVICE: &str = "/dev/null";

/// Directories and data files handed to tor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directories {
    /// Tor's `DataDirectory`.
    pub data_dir: PathBuf,
    /// Onion service client authorization keys.
    pub client_auth_dir: PathBuf,
    pub geoip_file: Option<PathBuf>,
    pub geoip6_file: Option<PathBuf>,
}

impl Directories {
    /// Standard layout under `base`, with GeoIP files from the system tor
    /// package when installed.
    pub fn under(base: &Path) -> Self {
        let geoip_file = GEOIP_CANDIDATES
            .iter()
            .map(PathBuf::from)
            .find(|p| p.is_file());
        let geoip6_file = geoip_file
            .as_ref()
            .map(|p| p.with_file_name("geoip6"))
            .filter(|p| p.is_file());

        Self {
            data_dir: base.join("tor"),
            client_auth_dir: base.join("auth"),
            geoip_file,
            geoip6_file,
        }
    }
}

/// Everything needed to launch one tor process.
///
/// Built fresh for every start and not modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfiguration {
    pub data_dir: PathBuf,
    /// Where tor writes `PORT=host:port` for the control listener.
    pub control_port_file: PathBuf,
    pub cookie_authentication: bool,
    pub cookie_file: PathBuf,
    pub geoip_file: Option<PathBuf>,
    pub geoip6_file: Option<PathBuf>,
    pub client_auth_dir: PathBuf,
    /// Leading command line arguments, including the transport fragment.
    pub arguments: Vec<String>,
    /// Options passed as `--Key value`. Keys are unique.
    pub options: BTreeMap<String, String>,
    pub use_bridges: bool,
}

impl ClientConfiguration {
    /// Whether a tor process currently holds the data directory.
    pub fn is_locked(&self) -> bool {
        self.data_dir.join(LOCK_FILE).exists()
    }

    pub fn read_cookie(&self) -> io::Result<Vec<u8>> {
        std::fs::read(&self.cookie_file)
    }

    /// Full argument list for the tor binary.
    pub fn command_line(&self) -> Vec<String> {
        let mut args = self.arguments.clone();
        for (key, value) in &self.options {
            args.push(format!("--{}", key));
            args.push(value.clone());
        }
        args
    }
}

/// Assembles a [`ClientConfiguration`].
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder<'a> {
    directories: &'a Directories,
    transport: Transport,
    transport_arguments: Vec<String>,
    ip_status: IpStatus,
    bypass_port: Option<u16>,
}

impl<'a> ClientConfigBuilder<'a> {
    pub fn new(directories: &'a Directories) -> Self {
        Self {
            directories,
            transport: Transport::None,
            transport_arguments: Vec::new(),
            ip_status: IpStatus::default(),
            bypass_port: None,
        }
    }

    /// Transport in use and its command line fragment.
    pub fn transport(mut self, transport: Transport, arguments: Vec<String>) -> Self {
        self.transport = transport;
        self.transport_arguments = arguments;
        self
    }

    pub fn ip_status(mut self, status: IpStatus) -> Self {
        self.ip_status = status;
        self
    }

    /// Route tor's own traffic through a sibling's SOCKS port.
    pub fn bypass_port(mut self, port: Option<u16>) -> Self {
        self.bypass_port = port;
        self
    }

    /// Provision the directories and produce the configuration.
    pub fn build(self) -> io::Result<ClientConfiguration> {
        let dirs = self.directories;
        ensure_private_dir(&dirs.client_auth_dir)?;
        ensure_private_dir(&dirs.data_dir)?;

        let control_port_file = dirs.data_dir.join(CONTROL_PORT_FILE);
        let cookie_file = dirs.data_dir.join(COOKIE_FILE);
        let use_bridges = self.transport != Transport::None;

        let mut options = BTreeMap::new();
        let mut set = |key: &str, value: String| {
            options.insert(key.to_string(), value);
        };

        set("CookieAuthentication", "1".into());
        set("CookieAuthFile", path_str(&cookie_file));
        set("ControlPort", "auto".into());
        set("ControlPortWriteToFile", path_str(&control_port_file));
        set("AvoidDiskWrites", "1".into());
        set("SafeLogging", "1".into());
        set("SocksPort", "auto".into());
        set("ClientOnionAuthDir", path_str(&dirs.client_auth_dir));
        set("DataDirectory", path_str(&dirs.data_dir));
        set("UseBridges", (if use_bridges { "1" } else { "0" }).to_string());
        if let Some(geoip) = &dirs.geoip_file {
            set("GeoIPFile", path_str(geoip));
        }
        if let Some(geoip6) = &dirs.geoip6_file {
            set("GeoIPv6File", path_str(geoip6));
        }
        if cfg!(debug_assertions) {
            set("Log", "notice stdout".into());
        } else {
            set("Log", format!("err file {}", NULL_DEVICE));
        }
        if let Some(port) = self.bypass_port {
            set("Socks5Proxy", format!("127.0.0.1:{}", port));
        }
        for (key, value) in self.ip_status.config_options() {
            set(key.as_str(), value);
        }

        let mut arguments = vec!["--allow-missing-torrc".to_string()];
        arguments.extend(self.transport_arguments);

        Ok(ClientConfiguration {
            data_dir: dirs.data_dir.clone(),
            control_port_file,
            cookie_authentication: true,
            cookie_file,
            geoip_file: dirs.geoip_file.clone(),
            geoip6_file: dirs.geoip6_file.clone(),
            client_auth_dir: dirs.client_auth_dir.clone(),
            arguments,
            options,
            use_bridges,
        })
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
