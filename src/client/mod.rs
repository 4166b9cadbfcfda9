//! The tor client process: its configuration and its launcher.

mod config;
mod process;

pub use config::{ClientConfigBuilder, ClientConfiguration, Directories};
pub use process::{ClientLauncher, ClientProcess, LaunchError, TorLauncher, TorProcess};
