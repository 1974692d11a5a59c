use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use courier::{
    now_ms, ContentId, ContentItem, ContentStore, DensityConfig, DispatchConfig, GroupId, Node,
    RegistryConfig, UserId,
};

/// Simulated mesh of devices meeting at random and pushing content to each
/// other during every encounter.
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of simulated devices.
    #[arg(short, long, default_value = "6")]
    nodes: usize,

    /// Milliseconds between simulation ticks.
    #[arg(long, default_value = "200")]
    tick_ms: u64,

    /// Probability that a device posts during a tick.
    #[arg(long, default_value = "0.3")]
    post_rate: f64,

    /// Ticks an encounter lasts before the devices drift apart.
    #[arg(long, default_value = "5")]
    encounter_ticks: u32,

    /// Item time-to-live in seconds; 0 disables expiry.
    #[arg(long, default_value = "0")]
    ttl_secs: u64,

    /// Replication density window in seconds.
    #[arg(long, default_value = "3600")]
    density_window_secs: u64,

    /// Score threshold below which items are not forwarded.
    #[arg(long, default_value = "0.0")]
    threshold: f64,

    /// Seed for the simulation and dispatcher rngs.
    #[arg(long)]
    seed: Option<u64>,

    /// Stop after this many seconds; runs until Ctrl+C when omitted.
    #[arg(short, long)]
    duration_secs: Option<u64>,

    #[arg(short, long, default_value = "5")]
    telemetry_interval: u64,
}

struct Encounter {
    a: usize,
    b: usize,
    ends_at_tick: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    if args.nodes < 2 {
        anyhow::bail!("a mesh needs at least two nodes");
    }

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let nodes: Vec<Arc<Node>> = (0..args.nodes)
        .map(|i| {
            let config = RegistryConfig {
                dispatch: DispatchConfig {
                    threshold: args.threshold,
                    rng_seed: args.seed.map(|s| s.wrapping_add(i as u64)),
                    ..DispatchConfig::default()
                },
                density: DensityConfig::with_window(Duration::from_secs(args.density_window_secs)),
                ..RegistryConfig::default()
            };
            Arc::new(Node::spawn(format!("node-{}", i), config))
        })
        .collect();
    let authors: Vec<UserId> = (0..args.nodes)
        .map(|i| UserId::derive(&format!("user-{}", i), 0))
        .collect();
    info!(nodes = nodes.len(), "mesh simulation started");

    let mut encounters: Vec<Encounter> = Vec::new();
    let mut posted: Vec<ContentId> = Vec::new();
    let mut tick: u64 = 0;

    let deadline = args.duration_secs.map(|s| Instant::now() + Duration::from_secs(s));
    let mut ticker = time::interval(Duration::from_millis(args.tick_ms.max(1)));
    let mut telemetry = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));
    telemetry.tick().await; // Skip initial tick

    // Graceful shutdown on Ctrl+C or when the duration elapses
    loop {
        let expired = async {
            match deadline {
                Some(at) => time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = expired => {
                info!("simulation duration elapsed");
                break;
            }
            _ = ticker.tick() => {
                tick += 1;
                step(&args, &nodes, &authors, &mut rng, &mut encounters, &mut posted, tick).await;
            }
            _ = telemetry.tick() => {
                log_telemetry(&nodes, &posted).await;
            }
        }
    }

    log_telemetry(&nodes, &posted).await;
    for node in &nodes {
        node.shutdown().await;
    }
    Ok(())
}

async fn step(
    args: &Args,
    nodes: &[Arc<Node>],
    authors: &[UserId],
    rng: &mut StdRng,
    encounters: &mut Vec<Encounter>,
    posted: &mut Vec<ContentId>,
    tick: u64,
) {
    // Devices drifting out of range.
    let mut i = 0;
    while i < encounters.len() {
        if encounters[i].ends_at_tick <= tick {
            let Encounter { a, b, .. } = encounters.swap_remove(i);
            for (from, to) in [(a, b), (b, a)] {
                if let Err(e) = nodes[from].disconnect(nodes[to].address()) {
                    debug!(error = %e, "encounter already over");
                }
            }
            debug!(a = nodes[a].address(), b = nodes[b].address(), "encounter ended");
        } else {
            i += 1;
        }
    }

    // One new encounter between two idle devices.
    let a = rng.gen_range(0..nodes.len());
    let b = rng.gen_range(0..nodes.len());
    let busy = |n: usize| encounters.iter().any(|e| e.a == n || e.b == n);
    if a != b && !busy(a) && !busy(b) {
        match Node::connect_pair(&nodes[a], &nodes[b]) {
            Ok(()) => debug!(a = nodes[a].address(), b = nodes[b].address(), "encounter started"),
            Err(e) => warn!(error = %e, "encounter refused"),
        }
        // Tracked even when half-open so both directions get torn down.
        encounters.push(Encounter {
            a,
            b,
            ends_at_tick: tick + u64::from(args.encounter_ticks.max(1)),
        });
    }

    // Someone posts.
    if rng.gen_bool(args.post_rate.clamp(0.0, 1.0)) {
        let author = rng.gen_range(0..nodes.len());
        let body = format!("status {} from {} #tick{}", posted.len(), nodes[author].address(), tick % 10);
        let mut item = ContentItem::new(authors[author], GroupId::public(), body, now_ms());
        if args.ttl_secs > 0 {
            item = item.with_ttl_ms((args.ttl_secs * 1000) as i64);
        }
        posted.push(nodes[author].post_item(item).await);
    }
}

async fn log_telemetry(nodes: &[Arc<Node>], posted: &[ContentId]) {
    let mut holders: HashMap<ContentId, usize> = HashMap::new();
    for node in nodes {
        let snapshot = node.telemetry().await;
        let (sent, failures): (u64, u64) = snapshot
            .registry
            .dispatchers
            .iter()
            .fold((0, 0), |(s, f), d| (s + d.stats.sent, f + d.stats.send_failures));
        info!(
            node = %snapshot.address,
            items = snapshot.items,
            links = snapshot.links,
            sent,
            failures,
            tracked = snapshot.registry.tracked_content,
            "node telemetry"
        );
        for id in posted {
            if let Ok(Some(_)) = node.store().get(id).await {
                *holders.entry(*id).or_default() += 1;
            }
        }
    }

    if posted.is_empty() {
        return;
    }
    let total: usize = holders.values().sum();
    let coverage = total as f64 / (posted.len() * nodes.len()) as f64;
    if coverage < 0.01 && posted.len() > 10 {
        warn!(posted = posted.len(), "content is not spreading");
    }
    info!(
        posted = posted.len(),
        coverage = format!("{:.2}", coverage),
        "mesh coverage"
    );
}
