//! Shared measurement helpers for the ICC benches and `perf_report`.

use std::time::Instant;

// ─── Payloads ───────────────────────────────────────────────────────────────

/// Fits one cache line together with the cell version.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Msg56 {
    pub ts_ns: u64,
    pub words: [u64; 6],
}

/// Spans several cache lines; exposes the cost of the copy itself.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Msg1k {
    pub ts_ns: u64,
    pub words: [u64; 127],
}

impl Default for Msg1k {
    fn default() -> Self {
        Self {
            ts_ns: 0,
            words: [0; 127],
        }
    }
}

pub fn make_msg56(seq: u64) -> Msg56 {
    Msg56 {
        ts_ns: mono_now_ns(),
        words: [seq; 6],
    }
}

// ─── Statistics ─────────────────────────────────────────────────────────────

/// Distribution of a set of nanosecond samples.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub count: usize,
    pub min: u64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub p999: u64,
    pub max: u64,
    pub mean: f64,
    pub stddev: f64,
}

impl Summary {
    /// Sorts `samples` in place. `None` if there are none.
    pub fn from_samples(samples: &mut [u64]) -> Option<Self> {
        (!samples.is_empty()).then(|| summarize(samples))
    }
}

fn summarize(samples: &mut [u64]) -> Summary {
    assert!(!samples.is_empty(), "cannot summarize zero samples");
    samples.sort_unstable();

    let n = samples.len() as f64;
    let mean = samples.iter().map(|&x| x as f64).sum::<f64>() / n;
    let var = samples.iter().map(|&x| (x as f64 - mean).powi(2)).sum::<f64>() / n;

    Summary {
        count: samples.len(),
        min: samples[0],
        p50: percentile(samples, 50.0),
        p90: percentile(samples, 90.0),
        p99: percentile(samples, 99.0),
        p999: percentile(samples, 99.9),
        max: samples[samples.len() - 1],
        mean,
        stddev: var.sqrt(),
    }
}

/// Nearest-rank percentile of an ascending, non-empty slice.
pub fn percentile(sorted: &[u64], pct: f64) -> u64 {
    let rank = (sorted.len() as f64 * pct / 100.0).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

// ─── Measurement Harness ────────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize)]
pub struct Measurement {
    pub label: String,
    pub unit: &'static str,
    pub summary: Summary,
}

/// How [`per_op_ns`] slices its run.
#[derive(Debug, Clone, Copy)]
pub struct Batches {
    pub count: usize,
    pub size: usize,
    pub warmup: usize,
}

impl Default for Batches {
    fn default() -> Self {
        Self {
            count: 500,
            size: 10_000,
            warmup: 50,
        }
    }
}

/// Runs `op` in timed batches; each batch contributes one ns/op sample, so
/// clock overhead is amortised over `size` calls.
pub fn per_op_ns<F: FnMut()>(label: &str, batches: Batches, mut op: F) -> Measurement {
    (0..batches.warmup * batches.size).for_each(|_| op());

    let size = batches.size.max(1) as u128;
    let mut samples: Vec<u64> = (0..batches.count.max(1))
        .map(|_| {
            let t0 = Instant::now();
            (0..size).for_each(|_| op());
            let ns = t0.elapsed().as_nanos();
            ((ns + size / 2) / size).max(1) as u64
        })
        .collect();

    Measurement {
        label: label.to_owned(),
        unit: "ns/op",
        summary: summarize(&mut samples),
    }
}

// ─── Clock & Scheduling ─────────────────────────────────────────────────────

/// CLOCK_MONOTONIC in nanoseconds; comparable across threads and processes.
#[inline(always)]
pub fn mono_now_ns() -> u64 {
    let mut ts = std::mem::MaybeUninit::<libc::timespec>::uninit();
    // SAFETY: clock_gettime fills `ts` for CLOCK_MONOTONIC, which always exists.
    let ts = unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, ts.as_mut_ptr());
        ts.assume_init()
    };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Pins the calling thread to `cpu` on Linux; a no-op elsewhere.
pub fn pin_to_cpu(cpu: usize) {
    #[cfg(target_os = "linux")]
    {
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_SET(cpu, &mut set);
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = cpu;
    }
}

/// Page faults and context switches of this process.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct Rusage {
    pub faults_minor: i64,
    pub faults_major: i64,
    pub csw_voluntary: i64,
    pub csw_involuntary: i64,
}

impl Rusage {
    pub fn now() -> Self {
        let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
        unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut ru) };
        Self {
            faults_minor: ru.ru_minflt,
            faults_major: ru.ru_majflt,
            csw_voluntary: ru.ru_nvcsw,
            csw_involuntary: ru.ru_nivcsw,
        }
    }

    pub fn since(&self, earlier: &Rusage) -> Rusage {
        Rusage {
            faults_minor: self.faults_minor - earlier.faults_minor,
            faults_major: self.faults_major - earlier.faults_major,
            csw_voluntary: self.csw_voluntary - earlier.csw_voluntary,
            csw_involuntary: self.csw_involuntary - earlier.csw_involuntary,
        }
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Unique segment path, under `/dev/shm` when it exists.
pub fn temp_shm_path(label: &str) -> String {
    let dir = if std::path::Path::new("/dev/shm").is_dir() {
        "/dev/shm"
    } else {
        "/tmp"
    };
    format!("{dir}/lithos_bench_{label}_{}", std::process::id())
}

const RULE: usize = 96;

pub fn print_header() {
    println!(
        "  {:<34}{:>9}{:>9}{:>9}{:>9}{:>9}{:>9}",
        "operation", "min", "p50", "p90", "p99", "p99.9", "max"
    );
    println!("  {}", "─".repeat(RULE));
}

pub fn print_row(m: &Measurement) {
    let s = &m.summary;
    println!(
        "  {:<34}{:>9}{:>9}{:>9}{:>9}{:>9}{:>9}  {}",
        m.label, s.min, s.p50, s.p90, s.p99, s.p999, s.max, m.unit
    );
}

pub fn banner(title: &str) {
    let rule = "─".repeat(RULE);
    println!("\n{rule}\n  {title}\n{rule}\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_use_nearest_rank() {
        let sorted: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&sorted, 50.0), 50);
        assert_eq!(percentile(&sorted, 99.0), 99);
        assert_eq!(percentile(&sorted, 99.9), 100);
        assert_eq!(percentile(&sorted, 0.0), 1);
        assert_eq!(percentile(&[7], 99.0), 7);
    }

    #[test]
    fn summary_sorts_its_input() {
        let mut samples = vec![5, 1, 4, 2, 3];
        let s = Summary::from_samples(&mut samples).unwrap();
        assert_eq!(samples, vec![1, 2, 3, 4, 5]);
        assert_eq!((s.min, s.max, s.p50, s.count), (1, 5, 3, 5));
        assert!((s.mean - 3.0).abs() < f64::EPSILON);
        assert!((s.stddev - 2f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn summary_of_nothing_is_none() {
        assert!(Summary::from_samples(&mut []).is_none());
    }

    #[test]
    fn one_sample_per_batch() {
        let mut calls = 0u64;
        let batches = Batches {
            count: 10,
            size: 100,
            warmup: 1,
        };
        let m = per_op_ns("noop", batches, || calls += 1);
        assert_eq!(calls, 1_100);
        assert_eq!(m.summary.count, 10);
        assert!(m.summary.min >= 1);
    }

    #[test]
    fn monotonic_clock_does_not_go_back() {
        let a = mono_now_ns();
        let b = mono_now_ns();
        assert!(b >= a);
    }

    #[test]
    fn rusage_deltas_are_non_negative() {
        let before = Rusage::now();
        let _v: Vec<u8> = vec![1; 1 << 20];
        let d = Rusage::now().since(&before);
        assert!(d.faults_minor >= 0 && d.csw_voluntary >= 0);
    }
}
