//! The `connect` command.

use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use onionlink::autoconf::MoatAutoConf;
use onionlink::client::TorLauncher;
use onionlink::config::Settings;
use onionlink::control::{Circuit, TorControlConnector};
use onionlink::network::{self, NetworkMonitor, RouteProbeMonitor, StaticMonitor};
use onionlink::orchestrator::ProgressCallback;
use onionlink::sibling::{LocalApiSibling, NoSibling, SiblingDetector, SiblingDiscovery};
use onionlink::store::FileSettingsStore;
use onionlink::transport::{HelperKind, ManagedTransport, TransportSet};
use onionlink::{
    ConnectError, ConnectionOrchestrator, OrchestratorParts, SettingsStore, StartOptions, Timing,
    Transport,
};

use crate::cli::icons::{bullet, dim_arrow, info, success, warn};

#[derive(Args, Debug)]
pub struct ConnectArgs {
    /// Ask the circumvention settings service which transport to use
    #[arg(long)]
    pub auto_conf: bool,

    /// Do not fall back to other transports when bootstrap stalls
    #[arg(long)]
    pub no_smart: bool,

    /// Store and use this transport
    #[arg(short, long, value_enum)]
    pub transport: Option<Transport>,

    /// List circuits once connected
    #[arg(long)]
    pub circuits: bool,
}

async fn build_orchestrator(
    settings: &Settings,
    store: Arc<FileSettingsStore>,
) -> anyhow::Result<ConnectionOrchestrator> {
    let pt_state = settings.pt_state_dir();
    let transports = TransportSet::new(
        Arc::new(ManagedTransport::new(
            HelperKind::Obfs4,
            settings.obfs4_binary.clone(),
            pt_state.clone(),
        )),
        Arc::new(ManagedTransport::new(
            HelperKind::Snowflake,
            settings.snowflake_binary.clone(),
            pt_state,
        )),
    );

    let discovery: Arc<dyn SiblingDiscovery> = match settings.sibling_url {
        Some(ref url) => Arc::new(LocalApiSibling::new(url, settings.sibling_token.clone())?),
        None => Arc::new(NoSibling),
    };

    let monitor: Arc<dyn NetworkMonitor> = match settings.probe_interval() {
        Some(interval) => Arc::new(RouteProbeMonitor::spawn(interval)),
        None => Arc::new(StaticMonitor::new(network::probe().await)),
    };

    Ok(ConnectionOrchestrator::new(OrchestratorParts {
        settings: store,
        transports,
        sibling: SiblingDetector::new(discovery),
        autoconf: Arc::new(MoatAutoConf::new(
            settings.auto_conf_url.clone(),
            settings.country.clone(),
        )?),
        launcher: Arc::new(TorLauncher::new(settings.tor_binary.clone())),
        connector: Arc::new(TorControlConnector),
        monitor,
        directories: settings.directories(),
        timing: Timing::default(),
    }))
}

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:30.cyan/blue}] {pos}% {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░"),
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message("Bootstrapping");
    pb
}

fn print_circuits(circuits: &[Circuit]) {
    if circuits.is_empty() {
        println!("  {} No circuits", dim_arrow());
        return;
    }
    for circuit in circuits {
        let path = circuit
            .path
            .iter()
            .map(|node| {
                node.nickname
                    .clone()
                    .unwrap_or_else(|| node.fingerprint.chars().take(8).collect())
            })
            .collect::<Vec<_>>()
            .join(" > ");
        let created = circuit
            .time_created
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_default();
        println!(
            "  {} {:>4} {:<9} {:<14} {} {}",
            bullet(),
            circuit.id,
            circuit.status,
            circuit.purpose.as_deref().unwrap_or("-"),
            style(created).dim(),
            path
        );
    }
}

pub async fn cmd_connect(settings: &Settings, args: ConnectArgs) -> anyhow::Result<()> {
    let store = Arc::new(FileSettingsStore::open(settings.state_file()));
    if let Some(transport) = args.transport {
        if transport == Transport::Custom && store.custom_bridges().is_empty() {
            anyhow::bail!("No custom bridges stored. Add some with `onionlink bridges add`.");
        }
        store.set_transport(transport);
    }

    let orchestrator = build_orchestrator(settings, store.clone()).await?;
    let options = StartOptions {
        auto_conf: args.auto_conf,
        smart_connect: settings.smart_connect && !args.no_smart,
    };

    println!(
        "{} Connecting via {} ({})",
        info(),
        style(store.transport()).cyan(),
        orchestrator.ip_status()
    );

    let pb = progress_bar();
    let reporter = pb.clone();
    let on_progress: ProgressCallback =
        Box::new(move |progress| reporter.set_position(u64::from(progress)));

    let started = tokio::select! {
        result = orchestrator.start(options, Some(on_progress)) => result,
        _ = tokio::signal::ctrl_c() => {
            pb.abandon_with_message("Interrupted");
            orchestrator.stop().await;
            return Ok(());
        }
    };

    match started {
        Ok(()) => pb.finish_with_message("Circuit established"),
        Err(e) => {
            pb.abandon_with_message("Failed");
            orchestrator.stop().await;
            if matches!(e, ConnectError::SmartConnectFailed) {
                eprintln!(
                    "{} Every transport stalled. Try `--transport custom` with your own bridges.",
                    warn()
                );
            }
            return Err(e.into());
        }
    }

    println!("{} Connected via {}", success(), style(orchestrator.transport()).cyan());
    if let Some(url) = orchestrator.socks_proxy_url() {
        println!("  {} SOCKS proxy: {}", dim_arrow(), style(url).bold());
    }

    if args.circuits {
        match orchestrator.get_circuits().await {
            Ok(circuits) => print_circuits(&circuits),
            Err(e) => eprintln!("{} Could not list circuits: {}", warn(), e),
        }
    }

    println!("  {} Press Ctrl-C to disconnect", dim_arrow());
    tokio::signal::ctrl_c().await?;

    orchestrator.stop().await;
    println!("{} Disconnected", success());
    Ok(())
}
