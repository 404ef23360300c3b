use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};
use std::time::Duration;
use storage_workflows::history::{EventKind, HistoryEvent};
use storage_workflows::orchestration::{run_turn, Execution, TurnOutcome, WorkflowCatalog};
use storage_workflows::{RetryPolicy, Workflow, WorkflowContext, WorkflowResult};

/// Sleeps `n` times, one second each
struct Sleeper;

#[async_trait]
impl Workflow for Sleeper {
    const WORKFLOW_TYPE: &'static str = "Sleeper";
    type Input = u64;
    type Output = u64;

    async fn run(&self, ctx: WorkflowContext, n: u64) -> WorkflowResult<u64> {
        for _ in 0..n {
            ctx.sleep(Duration::from_secs(1)).await;
        }
        Ok(n)
    }
}

/// History of a Sleeper run where every timer has fired
fn fired_history(n: u64) -> Vec<HistoryEvent> {
    let mut history = vec![HistoryEvent::new(
        1,
        EventKind::WorkflowStarted {
            workflow_type: "Sleeper".to_string(),
            input: json!(n),
            parent: None,
            execution_timeout: None,
        },
    )];
    for seq in 0..n {
        let next = history.len() as u64 + 1;
        history.push(HistoryEvent::new(
            next,
            EventKind::TimerStarted {
                seq,
                fire_after: Duration::from_secs(1),
                fire_at: chrono::Utc::now(),
            },
        ));
        history.push(HistoryEvent::new(next + 1, EventKind::TimerFired { seq }));
    }
    history
}

fn benchmark_replay(c: &mut Criterion) {
    let mut catalog = WorkflowCatalog::new();
    catalog.register(Sleeper);
    let Some(definition) = catalog.get("Sleeper") else {
        return;
    };

    let mut group = c.benchmark_group("replay_turn");
    for n in [10u64, 100, 1000] {
        let history = fired_history(n);
        let input: Value = json!(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &history, |b, history| {
            b.iter(|| {
                let outcome = run_turn(&definition, "bench", &input, black_box(history));
                assert!(matches!(outcome, TurnOutcome::Completed(_)));
            })
        });
    }
    group.finish();
}

/// A live execution fed one fired timer per turn
fn benchmark_live_turns(c: &mut Criterion) {
    let mut catalog = WorkflowCatalog::new();
    catalog.register(Sleeper);
    let Some(definition) = catalog.get("Sleeper") else {
        return;
    };

    let mut group = c.benchmark_group("live_turns");
    for n in [100u64, 1000] {
        let history = fired_history(n);
        let input: Value = json!(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &history, |b, history| {
            b.iter(|| {
                let mut execution = Execution::start(&definition, "bench", &input, &history[..1]);
                let mut outcome = execution.turn();
                for event in &history[1..] {
                    execution.observe(black_box(event));
                    if execution.is_woken() {
                        outcome = execution.turn();
                    }
                }
                assert!(matches!(outcome, TurnOutcome::Completed(_)));
            })
        });
    }
    group.finish();
}

fn benchmark_retry_delays(c: &mut Criterion) {
    let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(120), 0);
    c.bench_function("retry_delay_for_attempt", |b| {
        b.iter(|| (1..=50).map(|attempt| policy.delay_for_attempt(black_box(attempt))).sum::<Duration>())
    });
}

criterion_group!(benches, benchmark_replay, benchmark_live_turns, benchmark_retry_delays);
criterion_main!(benches);
