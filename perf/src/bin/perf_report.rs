use std::hint::black_box;
use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Instant;

use lithos_icc::{
    Producer, Queue, QueueHeader, QueueType, ReadError, Seqlock, SeqlockVector, VectorHeader,
    bytes_for_queue, destroy_shared,
};
use lithos_perf::*;

const CROSS_THREAD_MESSAGES: usize = 200_000;
const CROSS_THREAD_CAPACITY: usize = 1 << 16;

/// Results of the cross-thread latency run.
#[derive(Default)]
struct CrossThread {
    stats: Option<Summary>,
    received: u64,
    skipped: u64,
}

/// Results of the multi-producer fan-in run.
#[derive(Default, serde::Serialize)]
struct FanIn {
    producers: usize,
    produced: u64,
    received: u64,
    skipped: u64,
    msgs_per_sec: f64,
}

fn main() {
    let rusage_start = Rusage::now();
    let mut results: Vec<Measurement> = Vec::new();

    let bar = "\u{2550}".repeat(90);
    println!("\n{bar}");
    println!("  LITHOS ICC PERFORMANCE REPORT");
    println!("  single-thread micro + cross-thread latency + fan-in");
    println!("{bar}");

    section_memory_layout();
    section_micro(&mut results);
    let cross = section_cross_thread();
    let fan_in: Vec<FanIn> = [2, 4].into_iter().map(section_fan_in).collect();

    let usage = Rusage::now().since(&rusage_start);
    banner("RESOURCE USAGE");
    println!(
        "  minor faults {}  major faults {}  ctx switches {} vol / {} invol",
        usage.faults_minor, usage.faults_major, usage.csw_voluntary, usage.csw_involuntary,
    );

    save_results(&results, &cross, &fan_in, &usage);
}

fn section_memory_layout() {
    banner("MEMORY LAYOUT");
    println!("  {:<26} {:>8} {:>8} {:>12}", "Type", "Size", "Align", "Cache Lines");
    println!("  {}", "\u{2500}".repeat(60));

    let types: &[(&str, usize, usize)] = &[
        ("QueueHeader", size_of::<QueueHeader>(), align_of::<QueueHeader>()),
        ("VectorHeader", size_of::<VectorHeader>(), align_of::<VectorHeader>()),
        ("Seqlock<u64>", size_of::<Seqlock<u64>>(), align_of::<Seqlock<u64>>()),
        ("Seqlock<Msg56>", size_of::<Seqlock<Msg56>>(), align_of::<Seqlock<Msg56>>()),
        ("Seqlock<Msg1k>", size_of::<Seqlock<Msg1k>>(), align_of::<Seqlock<Msg1k>>()),
    ];
    for &(name, size, align) in types {
        println!(
            "  {:<26} {:>6} B {:>6} B {:>12}",
            name,
            size,
            align,
            size.div_ceil(64)
        );
    }

    if let Ok(bytes) = bytes_for_queue::<Msg56>(CROSS_THREAD_CAPACITY) {
        println!(
            "\n  * Queue<Msg56> x {CROSS_THREAD_CAPACITY} slots = {} KiB",
            bytes / 1024
        );
    }
}

fn section_micro(results: &mut Vec<Measurement>) {
    banner("SINGLE-THREAD OPERATIONS");
    print_header();

    let mut run = |r: Measurement| {
        print_row(&r);
        results.push(r);
    };

    run(per_op_ns("mono_now_ns()", Batches::default(), || {
        black_box(mono_now_ns());
    }));

    let cell = Seqlock::<Msg56>::default();
    let msg = make_msg56(1);
    let mut out = Msg56::default();
    run(per_op_ns("Seqlock<56B>::write", Batches::default(), || {
        cell.write(black_box(&msg));
    }));
    run(per_op_ns("Seqlock<56B>::read", Batches::default(), || {
        cell.read(&mut out);
        black_box(&out);
    }));

    let q = Queue::<Msg56>::private(CROSS_THREAD_CAPACITY, QueueType::SingleProducer)
        .expect("queue");
    let mut consumer = q.attach();
    run(per_op_ns("Queue::produce + try_consume", Batches::default(), || {
        q.produce(black_box(&msg));
        let _ = black_box(consumer.try_consume(&mut out));
    }));
    run(per_op_ns("Consumer::try_consume (empty)", Batches::default(), || {
        let _ = black_box(consumer.try_consume(&mut out));
    }));

    let v = SeqlockVector::<Msg56>::private(64).expect("vector");
    let mut i = 0usize;
    run(per_op_ns("SeqlockVector::write", Batches::default(), || {
        i = (i + 1) & 63;
        let _ = v.write(black_box(i), &msg);
    }));
    run(per_op_ns("SeqlockVector::read", Batches::default(), || {
        i = (i + 1) & 63;
        let _ = black_box(v.read(black_box(i), &mut out));
    }));
}

/// One pinned producer, one pinned consumer, shared-memory queue. Latency is
/// producer timestamp to consumer receipt.
fn section_cross_thread() -> CrossThread {
    let path = temp_shm_path("xthread");
    let queue = Queue::<Msg56>::shared(&path, CROSS_THREAD_CAPACITY, QueueType::SingleProducer)
        .expect("create queue");
    let barrier = Arc::new(Barrier::new(2));

    let consumer = {
        let path = path.clone();
        let barrier = barrier.clone();
        std::thread::spawn(move || {
            pin_to_cpu(1);
            // separate mapping, as a second process would have
            let q = Queue::<Msg56>::open_shared(&path).expect("open queue");
            let mut c = q.attach();
            let mut m = Msg56::default();
            let mut samples = Vec::with_capacity(CROSS_THREAD_MESSAGES);
            let mut skipped = 0u64;
            barrier.wait();

            while c.sequence() < CROSS_THREAD_MESSAGES as u64 {
                match c.try_consume(&mut m) {
                    Ok(()) => samples.push(mono_now_ns().saturating_sub(m.ts_ns)),
                    Err(ReadError::SpedPast { .. }) => skipped += c.resync(),
                    Err(ReadError::Empty) => std::hint::spin_loop(),
                }
            }
            (samples, skipped)
        })
    };

    pin_to_cpu(0);
    barrier.wait();
    let mut p = Producer::new(&queue).expect("producer");
    for seq in 0..CROSS_THREAD_MESSAGES as u64 {
        p.produce(&make_msg56(seq));
        // pace at roughly one message per 200 ns
        let until = mono_now_ns() + 200;
        while mono_now_ns() < until {
            std::hint::spin_loop();
        }
    }

    let (mut samples, skipped) = consumer.join().expect("consumer thread panicked");
    drop(queue);
    let _ = destroy_shared(&path);

    banner("CROSS-THREAD LATENCY  (producer \u{2192} shm queue \u{2192} consumer)");
    let mut out = CrossThread {
        received: samples.len() as u64,
        skipped,
        ..Default::default()
    };
    let Some(stats) = Summary::from_samples(&mut samples) else {
        println!("  no samples received");
        return out;
    };
    println!(
        "  {:<24} {:>8} {:>8} {:>8} {:>8} {:>8}",
        "", "p50", "p90", "p99", "p99.9", "max"
    );
    println!(
        "  {:<24} {:>8} {:>8} {:>8} {:>8} {:>8}  ns",
        "produce \u{2192} consume", stats.p50, stats.p90, stats.p99, stats.p999, stats.max
    );
    println!("\n  received {}  skipped {}", out.received, out.skipped);
    out.stats = Some(stats);
    out
}

/// `producers` threads on a multi-producer queue, one consumer counting.
fn section_fan_in(producers: usize) -> FanIn {
    const PER_PRODUCER: u64 = 250_000;
    let queue = Queue::<Msg56>::private(CROSS_THREAD_CAPACITY, QueueType::MultiProducer)
        .expect("queue");
    let done = AtomicBool::new(false);
    let start = Instant::now();

    let (received, skipped) = std::thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut c = queue.attach();
            let mut m = Msg56::default();
            let (mut received, mut skipped) = (0u64, 0u64);
            loop {
                match c.try_consume(&mut m) {
                    Ok(()) => received += 1,
                    Err(ReadError::SpedPast { .. }) => skipped += c.resync(),
                    Err(ReadError::Empty) => {
                        if done.load(Ordering::Acquire) && c.sequence() >= queue.count() {
                            break;
                        }
                        std::hint::spin_loop();
                    }
                }
            }
            (received, skipped)
        });

        let writers: Vec<_> = (0..producers)
            .map(|_| {
                s.spawn(|| {
                    let mut p = Producer::new(&queue).expect("producer");
                    for seq in 0..PER_PRODUCER {
                        p.produce(&make_msg56(seq));
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().expect("producer thread panicked");
        }
        done.store(true, Ordering::Release);
        reader.join().expect("consumer thread panicked")
    });

    let produced = producers as u64 * PER_PRODUCER;
    let msgs_per_sec = produced as f64 / start.elapsed().as_secs_f64();
    banner(&format!("FAN-IN  ({producers} producers \u{2192} 1 consumer)"));
    println!(
        "  produced {produced}  received {received}  skipped {skipped}  ({:.2}M msg/s)",
        msgs_per_sec / 1e6
    );

    FanIn {
        producers,
        produced,
        received,
        skipped,
        msgs_per_sec,
    }
}

fn save_results(
    results: &[Measurement],
    cross: &CrossThread,
    fan_in: &[FanIn],
    usage: &Rusage,
) {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let results_dir = concat!(env!("CARGO_MANIFEST_DIR"), "/results");
    let _ = std::fs::create_dir_all(results_dir);
    let json_path = format!("{results_dir}/{secs}_icc_report.json");

    let output = serde_json::json!({
        "report_type": "icc",
        "timestamp": secs,
        "ncpu": std::thread::available_parallelism().map(|n| n.get()).unwrap_or(0),
        "single_thread": results,
        "cross_thread": {
            "stats": cross.stats,
            "received": cross.received,
            "skipped": cross.skipped,
        },
        "fan_in": fan_in,
        "resources": usage,
    });

    let rendered = match serde_json::to_string_pretty(&output) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("\n  [failed to render results: {e}]\n");
            return;
        }
    };
    match std::fs::write(&json_path, rendered) {
        Ok(()) => println!("\n  Results saved to: {json_path}\n"),
        Err(e) => eprintln!("\n  [failed to save results: {e}]\n"),
    }
}
