use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use chrono::Utc;
use dhcp_core::config::{Config, LoggingConfig};
use dhcp_core::persist::{LeaseSink, RedbLeaseSink};
use dhcp_core::reconcile::ObjectCache;
use dhcp_core::Server;
use dhcp_net::socket::UnicastSocket;
use dhcp_net::RequestProcessor;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "dhcpd", about = "DHCPv4 lease server")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/dhcpd/dhcpd.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)?;
    init_logging(&config.logging);

    info!(config = %cli.config.display(), "starting dhcpd");

    let lease_sink: Arc<dyn LeaseSink> = Arc::new(RedbLeaseSink::open(&config.lease_store_path)?);
    info!(path = %config.lease_store_path.display(), "lease store opened");

    let server = Arc::new(Server::new());
    let cache = Arc::new(ObjectCache::new());

    server.set_local_addresses(dhcp_net::iface::local_addresses()?);

    for subnet in &config.subnets {
        server.add_subnet(subnet)?;
        cache.add_subnet_if_not_known(&subnet.cidr);
        for host in cache.pop_pending_hosts(&subnet.cidr) {
            server.add_host(&host, Utc::now())?;
        }
    }
    for host in &config.hosts {
        if cache.add_host_if_not_known(host.clone()) {
            warn!(subnet = %host.subnet, mac = %host.mac, "deferring host reservation, subnet not yet known");
        } else {
            server.add_host(host, Utc::now())?;
        }
    }

    for batch in lease_sink.load_all()? {
        server.apply_lease_batch(&batch);
        cache.add_lease_batch_if_not_known(batch);
    }

    // `apply_lease_batch` replayed batches oldest-first, so later batches
    // already overwrote earlier bindings for the same MAC. A batch whose
    // every lease is also covered by a later one is now redundant; evict
    // it from the cache and durable storage the same way a live
    // LeasesBatch-deletion control-plane event would.
    let ordered_batches = cache.lease_batches_oldest_first();
    for (i, batch) in ordered_batches.iter().enumerate() {
        let superseded = !batch.leases.is_empty()
            && batch.leases.iter().all(|lease| {
                ordered_batches[i + 1..]
                    .iter()
                    .any(|later| later.leases.iter().any(|l| l.mac == lease.mac))
            });
        if !superseded {
            continue;
        }
        if let Some((popped, still_known)) = cache.pop_lease_batch(&batch.name) {
            server.remove_lease_batch(&popped, &still_known);
            if let Err(e) = lease_sink.delete(&popped.name) {
                warn!(batch = %popped.name, error = %e, "failed to delete superseded lease batch");
            }
        }
    }

    let interface_index = dhcp_net::iface::interface_index_map()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();
    let mut processors = Vec::new();

    for listen in &config.listens {
        if !cache.add_listen_if_not_known(listen.clone()) {
            warn!(listen = %listen.describe(), "duplicate listen in config, skipping");
            continue;
        }
        let bind_addr = listen.address.clone().unwrap_or_else(|| "0.0.0.0:67".to_string());
        let socket = Arc::new(UnicastSocket::bind(&bind_addr, interface_index.clone()).await?);
        let sink = lease_sink.clone();
        let processor = RequestProcessor::spawn(
            listen.describe(),
            socket,
            server.clone(),
            cache.clone(),
            move |batch| sink.save(batch).map_err(dhcp_net::NetError::from),
        );
        info!(listen = %listen.describe(), "listener started");
        processors.push(processor);
    }

    // Periodic liveness heartbeat, mirroring the teacher's interval-task
    // shape. Expired dynamic leases are reclaimed lazily by the
    // allocator's free-pool scan (dhcp-core::pool::Subnet), not by a
    // separate sweep, so this tick only logs.
    {
        let mut rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        info!("lease store heartbeat");
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping listeners...");
    let _ = shutdown_tx.send(true);

    for processor in &processors {
        processor.shutdown();
    }
    for listen in &config.listens {
        cache.remove_listen(&listen.name);
    }
    for task in tasks {
        let _ = task.await;
    }

    info!("dhcpd stopped");
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format.as_str() {
        "json" => {
            tracing_subscriber::fmt().with_env_filter(filter).json().init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
