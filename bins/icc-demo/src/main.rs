//! Demo publisher / subscriber over a shared queue and "latest value" vector.
//!
//! ```text
//! icc-demo publish   [config.toml] [count]
//! icc-demo subscribe [config.toml]
//! icc-demo latest    [config.toml]
//! icc-demo destroy   [config.toml]
//! ```

use anyhow::{Context, bail};
use lithos_config::{IccConfig, QueueMode};
use lithos_icc::{Producer, Queue, QueueType, ReadError, SeqlockVector, destroy_shared};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
struct Heartbeat {
    seq: u64,
    ts_ns: u64,
    publisher: u32,
    _pad: u32,
    value: f64,
}

fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn queue_type(mode: QueueMode) -> QueueType {
    match mode {
        QueueMode::Spmc => QueueType::SingleProducer,
        QueueMode::Mpmc => QueueType::MultiProducer,
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .init();
}

fn publish(cfg: &IccConfig, count: Option<u64>) -> anyhow::Result<()> {
    let queue = Queue::<Heartbeat>::shared(
        &cfg.queue.path,
        cfg.queue.capacity,
        queue_type(cfg.queue.mode),
    )
    .with_context(|| format!("opening queue {}", cfg.queue.path))?;
    let latest = SeqlockVector::<Heartbeat>::shared(&cfg.vector.path, cfg.vector.len)
        .with_context(|| format!("opening vector {}", cfg.vector.path))?;
    if latest.is_empty() {
        bail!("vector {} has no slots", cfg.vector.path);
    }
    let mut producer = Producer::new(&queue)?;

    let publisher = std::process::id();
    let slot = publisher as usize % latest.len();
    info!(?queue, ?latest, slot, "publishing");

    let batch = cfg.publisher.batch_size.max(1);
    let delay = Duration::from_micros(cfg.publisher.batch_delay_us);
    let mut last = Instant::now();
    let mut since_last = 0u64;
    let mut sent = 0u64;

    while count.is_none_or(|n| sent < n) {
        let hb = Heartbeat {
            seq: sent,
            ts_ns: now_ns(),
            publisher,
            value: sent as f64 * 0.5,
            ..Default::default()
        };
        producer.produce(&hb);
        latest.write(slot, &hb)?;

        sent += 1;
        since_last += 1;
        if sent % batch == 0 && !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if last.elapsed() >= Duration::from_secs(1) {
            info!(rate = since_last, cursor = queue.count(), "publish rate msg/s");
            since_last = 0;
            last = Instant::now();
        }
    }

    info!(sent, cursor = queue.count(), "publisher done");
    Ok(())
}

fn subscribe(cfg: &IccConfig) -> anyhow::Result<()> {
    let queue = Queue::<Heartbeat>::open_shared(&cfg.queue.path)
        .with_context(|| format!("attaching to queue {}", cfg.queue.path))?;
    let mut consumer = queue.attach();
    info!(?queue, start = consumer.sequence(), "subscribed");

    let mut hb = Heartbeat::default();
    let mut last = Instant::now();
    let mut received = 0u64;
    let mut lost = 0u64;
    let mut latency_sum_ns = 0u64;

    loop {
        match consumer.try_consume(&mut hb) {
            Ok(()) => {
                received += 1;
                latency_sum_ns += now_ns().saturating_sub(hb.ts_ns);
            }
            Err(ReadError::SpedPast { expected, found }) => {
                let skipped = consumer.resync();
                lost += skipped;
                warn!(expected, found, skipped, "subscriber fell behind, resynced");
            }
            Err(ReadError::Empty) => std::hint::spin_loop(),
        }

        if last.elapsed() >= Duration::from_secs(1) {
            let avg_latency_ns = latency_sum_ns.checked_div(received).unwrap_or(0);
            info!(
                rate = received,
                lost,
                avg_latency_ns,
                last_seq = hb.seq,
                last_publisher = hb.publisher,
                "receive rate msg/s"
            );
            received = 0;
            lost = 0;
            latency_sum_ns = 0;
            last = Instant::now();
        }
    }
}

fn latest(cfg: &IccConfig) -> anyhow::Result<()> {
    let latest = SeqlockVector::<Heartbeat>::open_shared(&cfg.vector.path)
        .with_context(|| format!("attaching to vector {}", cfg.vector.path))?;
    for (slot, hb) in latest.iter().enumerate().filter(|(_, hb)| hb.ts_ns != 0) {
        info!(
            slot,
            seq = hb.seq,
            publisher = hb.publisher,
            value = hb.value,
            age_ms = now_ns().saturating_sub(hb.ts_ns) / 1_000_000,
            "latest"
        );
    }
    Ok(())
}

fn destroy(cfg: &IccConfig) -> anyhow::Result<()> {
    for path in [&cfg.queue.path, &cfg.vector.path] {
        match destroy_shared(path) {
            Ok(()) => info!(path = %path, "destroyed"),
            Err(e) => warn!(path = %path, error = %e, "destroy failed"),
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let role = args.next().unwrap_or_else(|| "subscribe".into());

    let cfg = match args.next() {
        Some(path) => IccConfig::load(&path).with_context(|| format!("loading {path}"))?,
        None => IccConfig::default(),
    };
    init_tracing(&cfg.log_level);

    match role.as_str() {
        "publish" => {
            let count = args.next().map(|n| n.parse::<u64>()).transpose()?;
            publish(&cfg, count)
        }
        "subscribe" => subscribe(&cfg),
        "latest" => latest(&cfg),
        "destroy" => destroy(&cfg),
        other => bail!("unknown role '{other}', expected publish|subscribe|latest|destroy"),
    }
}
