// Loader and sandbox latency benchmark
// Measures context creation (rewrite + isolate) and a full in-process run
// Target: p50 < 1ms per context for small units

use gradebox::config::policy::CallPolicy;
use gradebox::config::types::SandboxConfig;
use gradebox::loader::IsolatedLoader;
use gradebox::sandbox::{InProcessSandbox, Sandbox, SandboxRequest};
use gradebox::unit::{CallSite, CompiledUnit, Const, Instr, Routine};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Benchmark configuration
const ITERATIONS: usize = 200;
const WARMUP_ITERATIONS: usize = 20;

/// Latency percentiles
struct LatencyStats {
    p50: Duration,
    p95: Duration,
    p99: Duration,
    min: Duration,
    max: Duration,
    mean: Duration,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        samples.sort();
        let len = samples.len();

        let sum: Duration = samples.iter().sum();
        Self {
            p50: samples[len / 2],
            p95: samples[len * 95 / 100],
            p99: samples[len * 99 / 100],
            min: samples[0],
            max: samples[len - 1],
            mean: sum / len as u32,
        }
    }

    fn print(&self, label: &str) {
        println!("\n=== {} ===", label);
        println!("  p50: {:?}", self.p50);
        println!("  p95: {:?}", self.p95);
        println!("  p99: {:?}", self.p99);
        println!("  min: {:?}", self.min);
        println!("  max: {:?}", self.max);
        println!("  mean: {:?}", self.mean);
    }
}

/// A unit with `loops` counting loops and a few gated calls
fn workload(loops: usize) -> CompiledUnit {
    let mut unit = CompiledUnit::new("Bench");
    for n in 0..loops {
        unit = unit.with_routine(
            Routine::new(
                &format!("loop{}", n),
                &[],
                vec![
                    Instr::Const(Const::Int(0)),
                    Instr::Store(0),
                    Instr::Load(0),
                    Instr::Const(Const::Int(100)),
                    Instr::Lt,
                    Instr::JumpIfNot(6),
                    Instr::Load(0),
                    Instr::Const(Const::Int(1)),
                    Instr::Add,
                    Instr::Store(0),
                    Instr::Jump(-8),
                    Instr::Const(Const::Str("x".into())),
                    Instr::Invoke(CallSite::new("std.System", "getenv", &["std.String"])),
                    Instr::ReturnValue,
                ],
            )
            .with_locals(1),
        );
    }
    unit.with_routine(Routine::new(
        "main",
        &[],
        vec![
            Instr::Invoke(CallSite::new("Bench", "loop0", &[])),
            Instr::Pop,
            Instr::Const(Const::Int(0)),
            Instr::ReturnValue,
        ],
    ))
}

fn measure<F: FnMut()>(mut f: F) -> LatencyStats {
    for _ in 0..WARMUP_ITERATIONS {
        f();
    }
    let samples = (0..ITERATIONS)
        .map(|_| {
            let started = Instant::now();
            f();
            started.elapsed()
        })
        .collect();
    LatencyStats::from_samples(samples)
}

fn main() {
    println!("gradebox loader benchmark ({} iterations)", ITERATIONS);

    let policy = Arc::new(CallPolicy::default_baseline());
    for loops in [1, 16, 64] {
        let units = vec![workload(loops)];
        let loader = IsolatedLoader::new(Some(Arc::clone(&policy)), true);
        let stats = measure(|| {
            if let Err(e) = loader.load(&units, &[]) {
                panic!("load failed: {}", e);
            }
        });
        stats.print(&format!("context creation, {} loop routines", loops));
    }

    let sandbox = InProcessSandbox::new(SandboxConfig::default());
    let request = SandboxRequest::new(
        Arc::new(vec![workload(4)]),
        Vec::new(),
        CallSite::new("Bench", "main", &[]),
        Vec::new(),
    );
    let stats = measure(|| {
        if let Err(e) = sandbox.run(&request) {
            panic!("run failed: {}", e);
        }
    });
    stats.print("in-process run (illegal call after 100 iterations)");
}
