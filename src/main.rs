use clap::Parser;
use freezeframe::ckpt::{opts, opts_init, CkptOpts};
use freezeframe::memory::{Facade, LinearAllocator};
use freezeframe::{CheckpointImage, Coordinator, FrozenProcess, Outcome};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

// Global start time for dmesg-style logging
static START_TIME: OnceLock<Instant> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "freezeframe")]
#[command(about = "stop-the-world checkpoint rounds over a set of busy threads", long_about = None)]
struct Args {
    /// Number of worker threads
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Number of checkpoint rounds
    #[arg(short, long, default_value_t = 5)]
    rounds: u32,

    /// Short-lived detached threads started before every round
    #[arg(long, default_value_t = 0)]
    churn: usize,

    /// Pause between rounds, in milliseconds
    #[arg(long, default_value_t = 20)]
    pause_ms: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Where the signal-safe core log goes ("-" for stdout)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

/// Samples every worker counter twice while the process is frozen.
struct ProbeImage {
    counters: Arc<Vec<AtomicU64>>,
    /// Rounds during which some counter moved.
    drifted: u64,
    saves: u64,
    last_frozen: Option<FrozenProcess>,
}

impl ProbeImage {
    fn sample(&self) -> u64 {
        self.counters
            .iter()
            .fold(0u64, |acc, c| acc.wrapping_add(c.load(Ordering::SeqCst)))
    }
}

impl CheckpointImage for ProbeImage {
    fn save(&mut self, frozen: &FrozenProcess) -> freezeframe::Result<()> {
        let before = self.sample();
        std::thread::sleep(Duration::from_millis(1));
        if self.sample() != before {
            self.drifted += 1;
        }
        self.saves += 1;
        self.last_frozen = Some(*frozen);
        Ok(())
    }

    fn load(&mut self, _frozen: &FrozenProcess) -> freezeframe::Result<()> {
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    START_TIME.get_or_init(|| Instant::now());

    // Initialize logging with dmesg-style timestamps
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format(|buf, record| {
            use std::io::Write;

            let elapsed = START_TIME.get().map(|t| t.elapsed()).unwrap_or_default();
            writeln!(
                buf,
                "[{:5}.{:06}] {} {}",
                elapsed.as_secs(),
                elapsed.subsec_micros(),
                record.level(),
                record.args()
            )
        })
        .init();

    let mut ckpt_opts = CkptOpts::from_env();
    if args.verbose {
        ckpt_opts.log_level = log::LevelFilter::Debug;
    } else if ckpt_opts.log_level == log::LevelFilter::Off {
        ckpt_opts.log_level = log::LevelFilter::Warn;
    }
    if let Some(path) = &args.log_file {
        ckpt_opts.log_file = Some(path.display().to_string());
    }
    if opts_init(ckpt_opts).is_err() {
        anyhow::bail!("options already initialized");
    }
    log::debug!("options: {:?}", opts());

    let coord = Coordinator::init()?;
    log::debug!("core log level {}", freezeframe::ckpt::log::log_level());

    let stop = Arc::new(AtomicBool::new(false));
    let counters: Arc<Vec<AtomicU64>> =
        Arc::new((0..args.threads).map(|_| AtomicU64::new(0)).collect());

    let mut workers = Vec::with_capacity(args.threads);
    for i in 0..args.threads {
        let stop = Arc::clone(&stop);
        let counters = Arc::clone(&counters);
        workers.push(coord.spawn(move || {
            let heap = Facade::new(LinearAllocator::new());
            while !stop.load(Ordering::Relaxed) {
                let p = heap.calloc(4, 16);
                heap.free(p);
                counters[i].fetch_add(1, Ordering::SeqCst);
                std::hint::spin_loop();
            }
            heap.allocator().stats()
        })?);
    }
    log::info!("Started {} workers", workers.len());

    let mut image = ProbeImage {
        counters: Arc::clone(&counters),
        drifted: 0,
        saves: 0,
        last_frozen: None,
    };

    for round in 1..=args.rounds {
        for _ in 0..args.churn {
            coord
                .spawn(|| std::thread::sleep(Duration::from_micros(200)))?
                .detach();
        }
        std::thread::sleep(Duration::from_millis(args.pause_ms));

        let before: Vec<u64> = counters.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        let started = Instant::now();
        let outcome = coord.checkpoint(&mut image)?;
        anyhow::ensure!(
            outcome == Outcome::Checkpointed,
            "unexpected outcome {:?}",
            outcome
        );

        let frozen = image.last_frozen.map(|f| f.suspended).unwrap_or_default();
        log::info!(
            "Round {}: {} threads frozen, checkpoint took {:?}",
            round,
            frozen,
            started.elapsed()
        );

        std::thread::sleep(Duration::from_millis(1));
        let stalled = counters
            .iter()
            .zip(&before)
            .filter(|(c, b)| c.load(Ordering::SeqCst) == **b)
            .count();
        if stalled > 0 {
            log::warn!("Round {}: {} workers made no progress", round, stalled);
        }
    }

    stop.store(true, Ordering::SeqCst);
    for worker in workers {
        match worker.join() {
            Ok(stats) => log::debug!("worker heap: {:?}", stats),
            Err(_) => anyhow::bail!("worker panicked"),
        }
    }

    let stats = coord.stats();
    log::info!(
        "{} rounds, {} saves, arrivals {}/{}, {} rounds with drift",
        stats.rounds,
        image.saves,
        stats.arrivals.posts,
        stats.arrivals.waits,
        image.drifted
    );
    anyhow::ensure!(
        stats.arrivals.posts == stats.arrivals.waits,
        "arrival barrier unbalanced: {} posts, {} waits",
        stats.arrivals.posts,
        stats.arrivals.waits
    );
    anyhow::ensure!(image.drifted == 0, "threads moved while frozen");

    coord.teardown()?;
    Ok(())
}
