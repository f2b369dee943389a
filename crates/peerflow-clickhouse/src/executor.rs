//! Normalize executor
//!
//! Runs one invocation's plans on a fixed pool of worker connections.
//! Plans flow through a bounded channel; workers pull from a shared
//! receiver, so a slow merge on one table never blocks the others. The
//! first worker reuses the invocation's shared connection, the rest open
//! their own and drop them on exit.
//!
//! Failure semantics: the first error cancels the shared token; the
//! producer observes it on its next send and stops emitting, in-flight
//! workers finish their current statement and exit on the next receive.
//! The caller never advances batch pointers after an executor error.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use peerflow_core::{NormalizeError, Result};

use crate::client::{Destination, DestinationClient};
use crate::planner::NormalizePlan;

/// Queue depth between the planner and the workers. Small on purpose:
/// plans are cheap to build and backpressure keeps cancellation prompt.
const PLAN_QUEUE_CAPACITY: usize = 8;

/// Run every plan to completion on `parallelism` worker connections.
///
/// `parallelism` is assumed pre-clamped to `[1, plan count]` by the
/// coordinator; values below 1 are treated as 1.
pub async fn execute_plans<D: Destination>(
    destination: Arc<D>,
    plans: Vec<NormalizePlan>,
    parallelism: u32,
    cancel: &CancellationToken,
) -> Result<()> {
    let workers = parallelism.max(1) as usize;
    let (tx, rx) = mpsc::channel::<NormalizePlan>(PLAN_QUEUE_CAPACITY);
    let rx = Arc::new(Mutex::new(rx));

    let mut pool = JoinSet::new();
    for worker_id in 0..workers {
        let destination = destination.clone();
        let rx = rx.clone();
        let cancel = cancel.clone();
        pool.spawn(async move {
            run_worker(worker_id, destination, rx, cancel).await
        });
    }

    // Producer: feed plans until done or a worker cancels.
    let mut produce_result: Result<()> = Ok(());
    for plan in plans {
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            sent = tx.send(plan) => sent.is_ok(),
        };
        if !sent {
            produce_result = Err(NormalizeError::Cancelled);
            break;
        }
    }
    drop(tx);

    // First worker error wins; producer-side cancellation is only
    // surfaced when no worker reported a cause.
    let mut first_error: Option<NormalizeError> = None;
    while let Some(joined) = pool.join_next().await {
        let result = joined
            .map_err(|e| NormalizeError::destination(format!("normalize worker panicked: {e}")))?;
        if let Err(e) = result {
            cancel.cancel();
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => produce_result,
    }
}

async fn run_worker<D: Destination>(
    worker_id: usize,
    destination: Arc<D>,
    rx: Arc<Mutex<mpsc::Receiver<NormalizePlan>>>,
    cancel: CancellationToken,
) -> Result<()> {
    // Worker 0 shares the coordinator's connection; the rest hold their
    // own for the lifetime of the pool.
    let fresh = if worker_id == 0 {
        None
    } else {
        Some(destination.connect().await?)
    };
    let client = fresh.as_ref().unwrap_or_else(|| destination.client());

    loop {
        let plan = {
            let mut guard = rx.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                plan = guard.recv() => plan,
            }
        };
        let Some(plan) = plan else {
            debug!(worker_id, "normalize worker draining, exiting");
            return Ok(());
        };

        info!(
            worker_id,
            table = %plan.table,
            part = plan.part,
            query = %plan.sql,
            "executing normalize query"
        );
        let started = Instant::now();
        match client.execute(&plan.sql).await {
            Ok(()) => {
                histogram!("peerflow.normalize.query_duration_ms")
                    .record(started.elapsed().as_millis() as f64);
                counter!("peerflow.normalize.queries").increment(1);
            }
            Err(e) => {
                counter!("peerflow.normalize.query_failures").increment(1);
                cancel.cancel();
                return Err(NormalizeError::plan(plan.table, e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDestination;

    fn plan(table: &str, part: u32) -> NormalizePlan {
        NormalizePlan {
            table: table.to_string(),
            part,
            sql: format!("INSERT INTO `{table}` /* part {part} */"),
        }
    }

    #[tokio::test]
    async fn test_runs_all_plans() {
        let dest = Arc::new(MockDestination::new());
        let plans = vec![plan("a", 0), plan("b", 0), plan("c", 0)];
        let cancel = CancellationToken::new();

        execute_plans(dest.clone(), plans, 2, &cancel).await.unwrap();

        let executed = dest.executed();
        assert_eq!(executed.len(), 3);
        for table in ["a", "b", "c"] {
            assert!(executed.iter().any(|sql| sql.contains(table)));
        }
    }

    #[tokio::test]
    async fn test_worker_zero_reuses_shared_connection() {
        let dest = Arc::new(MockDestination::new());
        let cancel = CancellationToken::new();
        execute_plans(dest.clone(), vec![plan("a", 0)], 1, &cancel)
            .await
            .unwrap();
        assert_eq!(dest.connections_opened(), 0);

        execute_plans(dest.clone(), vec![plan("a", 0), plan("b", 0)], 3, &cancel)
            .await
            .unwrap();
        assert_eq!(dest.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_first_error_wins_and_cancels() {
        let dest = Arc::new(MockDestination::new());
        dest.fail_times("INSERT INTO `b`", 1);
        let plans: Vec<_> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|t| plan(t, 0))
            .collect();
        let cancel = CancellationToken::new();

        let err = execute_plans(dest.clone(), plans, 1, &cancel)
            .await
            .unwrap_err();
        match err {
            NormalizeError::Plan { table, .. } => assert_eq!(table, "b"),
            other => panic!("expected plan error, got {other}"),
        }
        assert!(cancel.is_cancelled());
        // With one worker, nothing after the failing plan ran.
        assert_eq!(dest.executed(), vec!["INSERT INTO `a` /* part 0 */"]);
    }

    #[tokio::test]
    async fn test_external_cancellation_stops_cleanly() {
        let dest = Arc::new(MockDestination::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = execute_plans(dest.clone(), vec![plan("a", 0)], 2, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, NormalizeError::Cancelled));
        assert!(dest.executed().is_empty());
    }

    #[tokio::test]
    async fn test_empty_plan_set() {
        let dest = Arc::new(MockDestination::new());
        let cancel = CancellationToken::new();
        execute_plans(dest, Vec::new(), 4, &cancel).await.unwrap();
    }
}
