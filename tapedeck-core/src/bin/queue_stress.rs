//! Drive simulated captures into a deliberately slow sink and report how each
//! queue capacity copes.
//!
//! ```text
//! cargo run -p tapedeck-core --bin queue-stress -- --capacities 4,16,100 --blocks 400
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tapedeck_core::{
    buffering::block::AudioBlock, AudioSession, BlockSink, CaptureTarget, SessionConfig,
    SimulatedBackend, SimulatedConfig, SinkSummary, StreamInfo, Transition,
};

#[derive(Debug)]
struct Args {
    capacities: Vec<usize>,
    blocks: u64,
    block_size: usize,
    pace: Duration,
    sink_delay: Duration,
    output: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CapacityResult {
    capacity: usize,
    blocks_delivered: u64,
    blocks_captured: u64,
    blocks_dropped: u64,
    blocks_written: u64,
    frames_written: u64,
    pool_misses: u64,
    drop_rate: f64,
    wall_ms: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Summary {
    blocks: u64,
    block_size: usize,
    pace_us: u128,
    sink_delay_us: u128,
    results: Vec<CapacityResult>,
}

/// Sink that sleeps per block to model a slow disk.
struct SlowSink {
    delay: Duration,
    frames: u64,
    channels: u16,
    sample_rate: u32,
}

impl BlockSink for SlowSink {
    fn write_block(&mut self, block: &AudioBlock) -> tapedeck_core::Result<()> {
        thread::sleep(self.delay);
        self.frames += block.frames() as u64;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }

    fn finalize(self: Box<Self>) -> tapedeck_core::Result<SinkSummary> {
        Ok(SinkSummary {
            path: None,
            frames: self.frames,
            channels: self.channels,
            sample_rate: self.sample_rate,
        })
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("queue-stress failed: {e}");
        std::process::exit(1);
    }
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        capacities: vec![4, 16, 100],
        blocks: 400,
        block_size: 256,
        pace: Duration::from_micros(500),
        sink_delay: Duration::from_micros(1_500),
        output: None,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |name: &str| it.next().ok_or_else(|| format!("missing value for {name}"));
        match arg.as_str() {
            "--capacities" => {
                args.capacities = value("--capacities")?
                    .split(',')
                    .map(|v| v.trim().parse::<usize>().map(|c| c.max(1)))
                    .collect::<Result<_, _>>()
                    .map_err(|_| "invalid value for --capacities".to_string())?;
            }
            "--blocks" => {
                args.blocks = value("--blocks")?
                    .parse()
                    .map_err(|_| "invalid value for --blocks".to_string())?;
            }
            "--block-size" => {
                args.block_size = value("--block-size")?
                    .parse::<usize>()
                    .map_err(|_| "invalid value for --block-size".to_string())?
                    .clamp(16, 8192);
            }
            "--pace-us" => {
                let us: u64 = value("--pace-us")?
                    .parse()
                    .map_err(|_| "invalid value for --pace-us".to_string())?;
                args.pace = Duration::from_micros(us);
            }
            "--sink-delay-us" => {
                let us: u64 = value("--sink-delay-us")?
                    .parse()
                    .map_err(|_| "invalid value for --sink-delay-us".to_string())?;
                args.sink_delay = Duration::from_micros(us);
            }
            "--output" => {
                args.output = Some(PathBuf::from(value("--output")?));
            }
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p tapedeck-core --bin queue-stress -- \\
  [--capacities 4,16,100] [--blocks <n>] [--block-size <frames>] \\
  [--pace-us <us>] [--sink-delay-us <us>] [--output <file.json>]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    if args.capacities.is_empty() {
        return Err("--capacities must name at least one capacity".into());
    }
    Ok(args)
}

fn run_capacity(args: &Args, capacity: usize) -> Result<CapacityResult, String> {
    let backend = SimulatedBackend::new(SimulatedConfig {
        block_sizes: vec![args.block_size],
        pace: args.pace,
        max_blocks: Some(args.blocks),
        record_output: false,
        ..Default::default()
    });
    let config = SessionConfig {
        queue_capacity: capacity,
        pop_timeout: Duration::from_millis(10),
        prealloc_frames: args.block_size,
        level_interval_blocks: u64::MAX,
        ..Default::default()
    };
    let session = AudioSession::new(config, Arc::new(backend.clone())).map_err(|e| e.to_string())?;

    let delay = args.sink_delay;
    let started = Instant::now();
    session
        .start_capture(CaptureTarget::Sink(Box::new(
            move |info: &StreamInfo, channels: u16| -> tapedeck_core::Result<Box<dyn BlockSink>> {
                Ok(Box::new(SlowSink {
                    delay,
                    frames: 0,
                    channels,
                    sample_rate: info.sample_rate,
                }))
            },
        )))
        .map_err(|e| e.to_string())?;

    while backend.blocks_delivered() < args.blocks && backend.live_streams() > 0 {
        thread::sleep(Duration::from_millis(2));
    }

    let report = match session.stop().map_err(|e| e.to_string())? {
        Transition::Stopped(report) => report,
        other => return Err(format!("unexpected stop result: {other:?}")),
    };
    let diag = report.diagnostics;
    Ok(CapacityResult {
        capacity,
        blocks_delivered: backend.blocks_delivered(),
        blocks_captured: diag.blocks_captured,
        blocks_dropped: diag.blocks_dropped,
        blocks_written: diag.blocks_written,
        frames_written: diag.frames_written,
        pool_misses: diag.pool_misses,
        drop_rate: diag.blocks_dropped as f64 / diag.blocks_captured.max(1) as f64,
        wall_ms: started.elapsed().as_secs_f64() * 1_000.0,
    })
}

fn run() -> Result<(), String> {
    let args = parse_args()?;
    let mut results = Vec::with_capacity(args.capacities.len());
    for &capacity in &args.capacities {
        let result = run_capacity(&args, capacity)?;
        eprintln!(
            "capacity={:>5} captured={:>6} dropped={:>6} written={:>6} ({:.1}% dropped)",
            result.capacity,
            result.blocks_captured,
            result.blocks_dropped,
            result.blocks_written,
            result.drop_rate * 100.0
        );
        results.push(result);
    }

    let summary = Summary {
        blocks: args.blocks,
        block_size: args.block_size,
        pace_us: args.pace.as_micros(),
        sink_delay_us: args.sink_delay.as_micros(),
        results,
    };

    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    if let Some(out) = args.output {
        std::fs::write(&out, json).map_err(|e| e.to_string())?;
        println!("Wrote queue-stress report: {}", out.display());
    } else {
        println!("{json}");
    }
    Ok(())
}
