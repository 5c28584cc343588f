use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, info, warn};

use ttlmap::{CallOptions, ExpiringMap, Options};
use ttlmap_common::{
    DEFAULT_SOAK_DURATION_MS, DEFAULT_SOAK_KEYS, DEFAULT_SOAK_THREADS, DEFAULT_SOAK_TIMEOUT_MS,
};

#[derive(Parser, Debug)]
#[command(
    name = "ttlmap-soak",
    about = "Carga concorrente sobre o ExpiringMap com verificação de consistência"
)]
struct Args {
    /// Threads gerando operações
    #[arg(long, short, default_value_t = DEFAULT_SOAK_THREADS)]
    threads: usize,
    /// Tamanho do espaço de chaves
    #[arg(long, short, default_value_t = DEFAULT_SOAK_KEYS)]
    keys: u64,
    /// Duração da carga, em ms
    #[arg(long, default_value_t = DEFAULT_SOAK_DURATION_MS)]
    duration_ms: u64,
    /// Timeout máximo de cada entrada, em ms
    #[arg(long, default_value_t = DEFAULT_SOAK_TIMEOUT_MS)]
    timeout_ms: u64,
    /// Percentual de operações que removem a chave (0-100)
    #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u8).range(0..=100))]
    delete_ratio: u8,
    /// Encaminha as linhas do debug sink do mapa para o log
    #[arg(long)]
    debug_sink: bool,
}

/// Contadores agregados de todas as threads.
#[derive(Default)]
struct Stats {
    stores: AtomicU64,
    swaps: AtomicU64,
    deletes: AtomicU64,
    loads: AtomicU64,
    hits: AtomicU64,
    expired: AtomicU64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ttlmap=info,ttlmap_soak=info".into()),
        )
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.keys > 0, "--keys precisa ser maior que zero");
    anyhow::ensure!(args.timeout_ms > 0, "--timeout-ms precisa ser maior que zero");

    let stats = Arc::new(Stats::default());
    let expired = stats.clone();
    let mut opts = Options::default()
        .with_timeout(Duration::from_millis(args.timeout_ms))
        .with_on_expire(move |_key: u64, _value: Bytes| {
            expired.expired.fetch_add(1, Ordering::Relaxed);
        });
    if args.debug_sink {
        opts = opts.with_debug(|line| debug!(target: "ttlmap_soak", "{line}"));
    }
    let map = ExpiringMap::new(opts)?;

    info!(
        "iniciando carga: {} threads, {} chaves, {}ms",
        args.threads, args.keys, args.duration_ms
    );

    let run_for = Duration::from_millis(args.duration_ms);
    let mut workers = Vec::with_capacity(args.threads);
    for t in 0..args.threads {
        let map = map.clone();
        let stats = stats.clone();
        let (keys, timeout_ms, delete_ratio) = (args.keys, args.timeout_ms, args.delete_ratio);
        workers.push(tokio::task::spawn_blocking(move || {
            let mut rng = StdRng::seed_from_u64(t as u64);
            let start = Instant::now();
            while start.elapsed() < run_for {
                let key = rng.gen_range(0..keys);
                let roll: u8 = rng.gen_range(0..100);
                if roll < delete_ratio {
                    map.delete(&key);
                    stats.deletes.fetch_add(1, Ordering::Relaxed);
                } else if roll % 3 == 0 {
                    let call = CallOptions::new()
                        .with_timeout(Duration::from_millis(rng.gen_range(1..=timeout_ms)));
                    map.swap_with(key, Bytes::from(format!("{t}:{key}")), &call);
                    stats.swaps.fetch_add(1, Ordering::Relaxed);
                } else if roll % 3 == 1 {
                    map.store(key, Bytes::from(format!("{t}:{key}")));
                    stats.stores.fetch_add(1, Ordering::Relaxed);
                } else {
                    if map.load(&key).is_some() {
                        stats.hits.fetch_add(1, Ordering::Relaxed);
                    }
                    stats.loads.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }

    for w in workers {
        w.await?;
    }

    map.check_consistency()?;
    info!("carga encerrada, {} entradas vivas", map.len());

    // Espera tudo expirar pelo scheduler.
    let drain_deadline = Instant::now() + Duration::from_millis(args.timeout_ms * 4 + 500);
    while !map.is_empty() && Instant::now() < drain_deadline {
        sleep(Duration::from_millis(10)).await;
    }
    map.check_consistency()?;

    if !map.is_empty() {
        warn!("{} entradas não expiraram a tempo", map.len());
    }
    if map.scheduler_restarts() > 0 {
        warn!("scheduler reiniciado {} vezes", map.scheduler_restarts());
    }
    map.close();

    println!("stores:   {}", stats.stores.load(Ordering::Relaxed));
    println!("swaps:    {}", stats.swaps.load(Ordering::Relaxed));
    println!("deletes:  {}", stats.deletes.load(Ordering::Relaxed));
    println!(
        "loads:    {} ({} hits)",
        stats.loads.load(Ordering::Relaxed),
        stats.hits.load(Ordering::Relaxed)
    );
    println!("expiradas: {}", stats.expired.load(Ordering::Relaxed));
    println!("restantes: {}", map.len());

    anyhow::ensure!(map.is_empty(), "entradas vencidas não foram varridas");
    Ok(())
}
