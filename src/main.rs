//! `ztunnel-redirect`: the per-node traffic redirection agent binary.
//!
//! Wires the real kernel-facing backends (ipset, the `iptables` crate, the
//! `ip` binary) into a [`ztunnel_redirect::reconciler::Agent`] and drives it
//! from a pod event stream read as newline-delimited JSON (the Kubernetes
//! informer machinery itself is out of scope, spec.md §1).

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;
use ipnet::Ipv4Net;
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use ztunnel_redirect::config::{self, Config};
use ztunnel_redirect::error::{AgentError, AgentResult};
use ztunnel_redirect::firewall::iptables::IptablesClassifier;
use ztunnel_redirect::hostip::{self, JsonNodePairSource, NodeInfoSource, NodePairSource};
use ztunnel_redirect::membership::IpsetMembership;
use ztunnel_redirect::pod::{Pod, PodEvent};
use ztunnel_redirect::reconciler::{self, Agent, ReconcilerMsg};
use ztunnel_redirect::routing::iproute::IpRouteSteering;
use ztunnel_redirect::tunnel::GeneveTunnelFabric;

/// Event queue depth (spec.md §5 "bounded queue").
const EVENT_QUEUE_DEPTH: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "ztunnel-redirect", about = "Per-node ambient-mesh redirection agent")]
struct Cli {
    /// Path to the JSON configuration file (spec.md §6).
    #[arg(long)]
    config: PathBuf,

    /// Path to a newline-delimited JSON pod-event file; reads stdin if omitted.
    #[arg(long)]
    events: Option<PathBuf>,

    /// Path to a JSON node-pair table, required in `cpu`/`dpu` role
    /// (spec.md §6 "Node-pair discovery").
    #[arg(long)]
    node_pair_file: Option<PathBuf>,

    /// The node's Spec.PodCIDR, for host-IP discovery (spec.md §6).
    #[arg(long)]
    pod_cidr: Option<Ipv4Net>,

    /// The node's InternalIP, used when `pod_cidr` is absent or no local
    /// address falls inside it.
    #[arg(long)]
    internal_ip: Ipv4Addr,

    /// Known local pods at startup, as a JSON array (spec.md §4.5
    /// "reconciles each currently-known local pod").
    #[arg(long)]
    known_pods: Option<PathBuf>,
}

struct CliNodeInfo {
    pod_cidr: Option<Ipv4Net>,
    internal_ip: Ipv4Addr,
}

impl NodeInfoSource for CliNodeInfo {
    fn pod_cidr(&self) -> Option<Ipv4Net> {
        self.pod_cidr
    }
    fn internal_ip(&self) -> Ipv4Addr {
        self.internal_ip
    }
}

#[tokio::main]
async fn main() -> AgentResult<()> {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!("{e}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> AgentResult<()> {
    ztunnel_redirect::cmd::check_capabilities()?;

    let config_text = std::fs::read_to_string(&cli.config)?;
    let config: Config = serde_json::from_str(&config_text)?;
    config.validate()?;

    let node_info = CliNodeInfo {
        pod_cidr: cli.pod_cidr,
        internal_ip: cli.internal_ip,
    };
    let local_addrs = hostip::local_ipv4_addresses()?;
    let host_ip = hostip::discover_host_ip(&node_info, &local_addrs);
    info!("host IP resolved to {host_ip}");

    let paired_ip = if config.role.is_split() {
        let path = cli.node_pair_file.as_ref().ok_or_else(|| {
            AgentError::msg("split role (cpu/dpu) requires --node-pair-file")
        })?;
        let source = JsonNodePairSource::load(path)?;
        Some(source.get_pair(&config.node_name, config.role)?)
    } else {
        None
    };

    let known_pods: Vec<Pod> = match &cli.known_pods {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => Vec::new(),
    };

    let agent = Agent::new(
        config,
        host_ip,
        Box::new(IpsetMembership::new(config::MEMBERSHIP_SET_NAME)),
        Box::new(IptablesClassifier::new()?),
        Box::new(IpRouteSteering::new()),
        Box::new(GeneveTunnelFabric::new()),
    );

    let (tx, rx) = tokio::sync::mpsc::channel(EVENT_QUEUE_DEPTH);

    let reconciler_task =
        tokio::task::spawn_blocking(move || reconciler::run_blocking(agent, rx, paired_ip, known_pods));

    let shutdown_tx = tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(ReconcilerMsg::Shutdown).await;
        }
    });

    let events_task = tokio::spawn(feed_events(cli.events, tx));

    let reconciler_result = reconciler_task
        .await
        .map_err(|e| AgentError::wrap("reconciler task panicked", Box::new(e)))?;
    events_task.abort();

    reconciler_result
}

/// Reads newline-delimited JSON `PodEvent`s from `path` (or stdin) and
/// forwards them to the reconciler until EOF or the channel closes.
async fn feed_events(path: Option<PathBuf>, tx: tokio::sync::mpsc::Sender<ReconcilerMsg>) {
    let reader: Box<dyn tokio::io::AsyncRead + Unpin> = match path {
        Some(p) => match tokio::fs::File::open(&p).await {
            Ok(f) => Box::new(f),
            Err(e) => {
                error!("could not open events file {}: {e}", p.display());
                return;
            }
        },
        None => Box::new(tokio::io::stdin()),
    };

    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<PodEvent>(&line) {
                    Ok(event) => {
                        if tx.send(ReconcilerMsg::Event(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("skipping malformed pod event: {e}"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!("error reading pod events: {e}");
                break;
            }
        }
    }
}
