//! Replica Benchmark / Load Test
//!
//! Concurrent clients writing entities to a daemon over TCP.
//!
//! Run with: cargo run --example benchmark --release
//!
//! Make sure replicad is running: cargo run --bin replicad --release

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Barrier;

use replica_core::{CrdtKind, FieldValue, RawEntity, StorageKey};
use replica_storage::{Handle, HandleOptions};
use replica_transport::{Channel, RemoteStore};

/// Benchmark configuration
struct BenchConfig {
    /// Server address
    addr: SocketAddr,
    /// Number of concurrent clients
    clients: usize,
    /// Operations per client
    ops_per_client: usize,
}

/// Benchmark results
#[derive(Debug)]
struct BenchResults {
    name: String,
    total_ops: u64,
    duration: Duration,
    successful: u64,
    failed: u64,
    ops_per_sec: f64,
    avg_latency_us: f64,
}

impl BenchResults {
    fn new(name: &str, successful: u64, failed: u64, latency_us: u64, duration: Duration) -> Self {
        let total_ops = successful + failed;
        Self {
            name: name.to_string(),
            total_ops,
            duration,
            successful,
            failed,
            ops_per_sec: total_ops as f64 / duration.as_secs_f64(),
            avg_latency_us: latency_us as f64 / total_ops.max(1) as f64,
        }
    }

    fn print(&self) {
        println!("\n╔══════════════════════════════════════════════════════════╗");
        println!("║  {} ", self.name);
        println!("╠══════════════════════════════════════════════════════════╣");
        println!("║  Total operations:    {:>10}                         ║", self.total_ops);
        println!("║  Successful:          {:>10}                         ║", self.successful);
        println!("║  Failed:              {:>10}                         ║", self.failed);
        println!("║  Duration:            {:>10.2?}                       ║", self.duration);
        println!("║  Throughput:          {:>10.0} ops/sec                ║", self.ops_per_sec);
        println!("║  Avg latency:         {:>10.0} µs                     ║", self.avg_latency_us);
        println!("╚══════════════════════════════════════════════════════════╝");
    }
}

/// One channel and handle per client
async fn open_client(
    addr: SocketAddr,
    key: StorageKey,
    actor: String,
) -> Result<(Arc<Channel>, Arc<Handle>), Box<dyn std::error::Error + Send + Sync>> {
    let channel = Arc::new(Channel::connect_tcp(addr).await?);
    let store = RemoteStore::open(channel.clone(), key, CrdtKind::Set).await?;
    let handle = Handle::open(actor, store, HandleOptions::default()).await?;
    handle.idle().await;
    Ok((channel, handle))
}

async fn run_clients(
    config: &BenchConfig,
    name: &str,
    key: impl Fn(usize) -> StorageKey,
    entity: impl Fn(usize, usize) -> RawEntity + Send + Sync + 'static,
) -> BenchResults {
    let successful = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));
    let latency = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(config.clients));
    let entity = Arc::new(entity);

    let mut tasks = Vec::new();
    let start = Instant::now();
    for client in 0..config.clients {
        let addr = config.addr;
        let key = key(client);
        let ops = config.ops_per_client;
        let (successful, failed, latency) = (successful.clone(), failed.clone(), latency.clone());
        let barrier = barrier.clone();
        let entity = entity.clone();

        tasks.push(tokio::spawn(async move {
            let opened = open_client(addr, key, format!("bench-{}", client)).await;
            barrier.wait().await;
            let Ok((channel, handle)) = opened else {
                failed.fetch_add(ops as u64, Ordering::Relaxed);
                return;
            };
            for op in 0..ops {
                let started = Instant::now();
                match handle.store(entity(client, op)).await {
                    Ok(true) => successful.fetch_add(1, Ordering::Relaxed),
                    _ => failed.fetch_add(1, Ordering::Relaxed),
                };
                latency.fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
            }
            handle.idle().await;
            handle.close().await;
            channel.disconnect();
        }));
    }
    for task in tasks {
        let _ = task.await;
    }

    BenchResults::new(
        name,
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        latency.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Each client writes to its own direct store
async fn bench_direct(config: &BenchConfig) -> BenchResults {
    run_clients(
        config,
        "DIRECT STORE",
        |client| StorageKey::ramdisk(format!("bench/direct/{}", client)),
        |client, op| RawEntity::new(format!("{}-{}", client, op)).with_singleton("n", Some(FieldValue::int(op as i64))),
    )
    .await
}

/// All clients share one reference-mode store
async fn bench_shared(config: &BenchConfig) -> BenchResults {
    run_clients(
        config,
        "SHARED REFERENCE-MODE STORE",
        |_| StorageKey::reference_mode(StorageKey::ramdisk("bench/entities"), StorageKey::ramdisk("bench/shared")),
        |client, op| {
            RawEntity::new(format!("{}-{}", client, op))
                .with_singleton("client", Some(FieldValue::int(client as i64)))
                .with_collection("tags", vec![FieldValue::text("bench")])
        },
    )
    .await
}

/// Connection setup only
async fn bench_connections(addr: SocketAddr, max_clients: usize) -> BenchResults {
    let mut successful = 0;
    let mut failed = 0;
    let mut latency = 0;
    let start = Instant::now();
    for client in 0..max_clients {
        let started = Instant::now();
        match open_client(addr, StorageKey::ramdisk("bench/connect"), format!("conn-{}", client)).await {
            Ok((channel, handle)) => {
                handle.close().await;
                channel.disconnect();
                successful += 1;
            }
            Err(_) => failed += 1,
        }
        latency += started.elapsed().as_micros() as u64;
    }
    BenchResults::new("CONNECTIONS", successful, failed, latency, start.elapsed())
}

fn arg<T: std::str::FromStr>(args: &[String], short: &str, long: &str) -> Option<T> {
    args.iter()
        .position(|a| a == short || a == long)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!();
    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║           REPLICA BENCHMARK / LOAD TEST                  ║");
    println!("╚══════════════════════════════════════════════════════════╝");
    println!();

    let args: Vec<String> = std::env::args().collect();
    let host: String = arg(&args, "-H", "--host").unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = arg(&args, "-p", "--port").unwrap_or(7380);
    let clients: usize = arg(&args, "-c", "--clients").unwrap_or(10);
    let ops: usize = arg(&args, "-n", "--ops").unwrap_or(1000);
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    println!("Configuration:");
    println!("  Server:     {}:{}", host, port);
    println!("  Clients:    {}", clients);
    println!("  Ops/client: {}", ops);
    println!();

    print!("Connecting to server... ");
    match Channel::connect_tcp(addr).await {
        Ok(channel) => {
            println!("OK");
            channel.disconnect();
        }
        Err(e) => {
            println!("FAILED");
            println!("\nError: {}", e);
            println!("\nMake sure replicad is running:");
            println!("  cargo run --bin replicad --release");
            return Ok(());
        }
    }

    let config = BenchConfig {
        addr,
        clients,
        ops_per_client: ops,
    };

    println!("\nRunning benchmarks...");
    bench_connections(addr, clients * 2).await.print();
    bench_direct(&config).await.print();
    bench_shared(&config).await.print();

    println!("\n╔══════════════════════════════════════════════════════════╗");
    println!("║                    BENCHMARK COMPLETE                    ║");
    println!("╚══════════════════════════════════════════════════════════╝");
    println!();

    Ok(())
}
