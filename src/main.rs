use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use kairos::{Context, Environment, Failure, Process, Step, Target, Value, Wake};

type Trace = Rc<RefCell<Vec<(u64, String)>>>;

/// Spawns jobs at random intervals, each with a random service time.
/// All randomness comes from one seeded generator, so the whole
/// workload is a pure function of the seed.
struct JobSource {
    rng: SmallRng,
    remaining: u32,
    spawned: u32,
    machines: kairos::ResourceId,
    trace: Trace,
}

impl Process for JobSource {
    fn resume(&mut self, ctx: &mut Context<'_>, wake: Wake) -> Result<Step, Failure> {
        wake.into_value()?;
        if self.remaining == 0 {
            return Ok(Step::Done(Value::None));
        }
        self.remaining -= 1;
        let service = self.rng.gen_range(2..=8);
        ctx.spawn(Box::new(Job {
            name: format!("job-{}", self.spawned),
            machines: self.machines,
            service,
            req: None,
            trace: self.trace.clone(),
        }));
        self.spawned += 1;
        let gap = self.rng.gen_range(1..=4);
        let ev = ctx.timeout(gap)?;
        Ok(Step::Wait(Target::Event(ev)))
    }
}

/// One job: queue for a machine, hold it for the service time, leave.
struct Job {
    name: String,
    machines: kairos::ResourceId,
    service: i64,
    req: Option<kairos::RequestId>,
    trace: Trace,
}

impl Job {
    fn log(&self, ctx: &Context<'_>, what: &str) {
        self.trace
            .borrow_mut()
            .push((ctx.now().ticks(), format!("{} {}", self.name, what)));
    }
}

impl Process for Job {
    fn resume(&mut self, ctx: &mut Context<'_>, wake: Wake) -> Result<Step, Failure> {
        wake.into_value()?;
        match self.req {
            None => {
                self.log(ctx, "queued");
                let req = ctx.request(self.machines)?;
                self.req = Some(req);
                Ok(Step::Wait(Target::Request(req)))
            }
            Some(req) => {
                if self.service > 0 {
                    self.log(ctx, "started");
                    let hold = self.service;
                    self.service = 0;
                    let ev = ctx.timeout(hold)?;
                    Ok(Step::Wait(Target::Event(ev)))
                } else {
                    ctx.release(req)?;
                    self.log(ctx, "finished");
                    Ok(Step::Done(Value::None))
                }
            }
        }
    }
}

fn run_shop(label: &str, seed: u64) -> u64 {
    let trace: Trace = Rc::new(RefCell::new(Vec::new()));

    let mut env = Environment::new();
    let machines = env.resource(2).expect("capacity is non-zero");
    env.spawn(Box::new(JobSource {
        rng: SmallRng::seed_from_u64(seed),
        remaining: 10,
        spawned: 0,
        machines,
        trace: trace.clone(),
    }));

    env.run().expect("workload runs to completion");

    let entries = trace.borrow();
    println!(
        "  {}: {} events processed, finished at {}, {} trace entries",
        label,
        env.events_processed(),
        env.now(),
        entries.len()
    );
    for (t, what) in entries.iter().take(6) {
        println!("    T={:<3} {}", t, what);
    }
    if entries.len() > 6 {
        println!("    ... {} more", entries.len() - 6);
    }

    let mut hasher = DefaultHasher::new();
    entries.hash(&mut hasher);
    hasher.finish()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    println!("═══════════════════════════════════════════════════════");
    println!("  Kairos — Deterministic Discrete-Event Simulation");
    println!("  Machine-Shop Replay Demo");
    println!("═══════════════════════════════════════════════════════");
    println!();

    // ── Run 1: seeded workload ────────────────────────────────
    let hash_1 = run_shop("Run 1", 42);

    // ── Run 2: identical replay ───────────────────────────────
    let hash_2 = run_shop("Run 2", 42);

    // ── Verify ────────────────────────────────────────────────
    println!();
    println!("  Verification:");
    println!("    Run 1 trace hash: {:016x}", hash_1);
    println!("    Run 2 trace hash: {:016x}", hash_2);
    if hash_1 == hash_2 {
        println!("    ✓ Traces are IDENTICAL — deterministic replay confirmed.");
    } else {
        println!("    ✗ MISMATCH — determinism violation detected!");
    }
}
