//! Reconfirm simulator binary

use clap::{Parser, Subcommand};
use minilog::common::{parse_duration, Config, Lsn, ProposalId, ReplicaAddress};
use minilog::reconfirm::drive_until_converged;
use minilog::sim::{spawn_network, SimFollower, SimGroup};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minilog-reconfirm")]
#[command(about = "minilog leader reconfirmation")]
struct Cli {
    /// Config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconfirmation against simulated followers
    Simulate {
        /// Group size, leader included
        #[arg(long, default_value = "3")]
        replicas: usize,

        /// Leader's flushed log end
        #[arg(long, default_value = "1000")]
        local_end: u64,

        /// Proposal id of the leader's last flushed entry
        #[arg(long, default_value = "3")]
        local_pid: u64,

        /// Log end reported by the first follower
        #[arg(long, default_value = "1000")]
        peer_end: u64,

        /// Accept id reported by the first follower
        #[arg(long, default_value = "3")]
        peer_pid: u64,

        /// Followers that never answer
        #[arg(long, default_value = "0")]
        unreachable: usize,

        /// Max random delay before an ack is delivered
        #[arg(long, default_value = "20ms")]
        jitter: String,

        /// Give up after this long
        #[arg(long, default_value = "30s")]
        timeout: String,
    },

    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Simulate {
            replicas,
            local_end,
            local_pid,
            peer_end,
            peer_pid,
            unreachable,
            jitter,
            timeout,
        } => {
            anyhow::ensure!(replicas >= 1, "replicas must be at least 1");
            let jitter = parse_duration(&jitter)?;
            let timeout = parse_duration(&timeout)?;

            let leader = ReplicaAddress::new(config.node_id.clone());
            let followers = simulated_followers(
                &leader,
                replicas - 1,
                (ProposalId(local_pid), Lsn(local_end)),
                (ProposalId(peer_pid), Lsn(peer_end)),
                unreachable,
            );
            let addrs: Vec<ReplicaAddress> = followers.iter().map(|f| f.addr.clone()).collect();

            let (group, inbox) =
                SimGroup::networked(leader, &addrs, Lsn(local_end), Some(ProposalId(local_pid)));
            let reconfirm = Arc::new(group.reconfirm(config.stream_id, config.reconfirm.clone())?);
            let network = spawn_network(reconfirm.clone(), followers, inbox, jitter);

            let deadline = config.reconfirm.converge_timeout().unwrap_or(timeout);
            let result = drive_until_converged(
                reconfirm.clone(),
                config.reconfirm.poll_interval(),
                Some(deadline),
            )
            .await;

            println!("{}", serde_json::to_string_pretty(&reconfirm.status())?);
            reconfirm.destroy();
            network.abort();

            let polls = result?;
            tracing::info!(
                "Leader {} may start working after {} polls (fetches: {})",
                reconfirm.self_addr(),
                polls,
                group.log.fetch_requests().len()
            );
        }
    }

    Ok(())
}

/// Followers on consecutive ports after the leader's; the first one reports
/// the `peer` tail, the rest mirror the leader.
fn simulated_followers(
    leader: &ReplicaAddress,
    count: usize,
    local: (ProposalId, Lsn),
    peer: (ProposalId, Lsn),
    unreachable: usize,
) -> Vec<SimFollower> {
    let (host, base_port) = match leader.as_str().rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse::<u16>().unwrap_or(2882)),
        None => (leader.as_str().to_string(), 2882),
    };

    (0..count)
        .map(|i| {
            let addr = format!("{}:{}", host, base_port.wrapping_add(i as u16 + 1));
            let (pid, lsn) = if i == 0 { peer } else { local };
            let follower = SimFollower::new(addr, pid, lsn);
            if i >= count.saturating_sub(unreachable) {
                follower.unreachable()
            } else {
                follower
            }
        })
        .collect()
}
