//! Parallel statement execution.
//!
//! A worker pool of `num_conns` threads replays statements, one worker
//! per connection. Statements are distributed by run-length over equal
//! object type: consecutive statements of the same type stay on the same
//! connection, so types whose DDL carries implicit inter-object ordering
//! (partitions, inherited tables) keep their locality. Each worker owns
//! a channel that the producer fills and closes exactly once; workers
//! drain until the channel disconnects, checking the shared fatal slot
//! and the termination flag between items.
//!
//! Post-data runs in three batches. Creating indexes in parallel on an
//! append-only table that had none can deadlock in the server, so the
//! first batch takes one index per table; the second runs the remaining
//! post-data objects fully parallel; the third runs the ` METADATA`
//! statements (ALTER INDEX, comments, labels) that depend on objects the
//! second batch creates. Pre-data runs tier by tier: the tier-zero
//! prefix, then numbered tiers ascending, then the tier-zero remainder.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{channel, Receiver};

use parking_lot::Mutex;
use tracing::{debug, error};

use heron_common::shutdown::TerminationSignal;
use heron_common::toc::StatementWithType;

use crate::error::{RestoreError, RestoreResult};
use crate::pool::{ConnectionPool, SegmentConnection};
use crate::progress::ProgressReporter;

/// Outcome of a batch run that did not hit a fatal error.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    /// Statements that failed under on-error-continue.
    pub num_errors: u32,
    /// `schema.name` of every failed object.
    pub error_tables: BTreeSet<String>,
}

impl ExecutionReport {
    pub fn merge(&mut self, other: ExecutionReport) {
        self.num_errors += other.num_errors;
        self.error_tables.extend(other.error_tables);
    }
}

struct ExecState {
    num_errors: AtomicU32,
    error_tables: Mutex<BTreeSet<String>>,
    fatal: Mutex<Option<RestoreError>>,
}

impl ExecState {
    fn new() -> Self {
        Self {
            num_errors: AtomicU32::new(0),
            error_tables: Mutex::new(BTreeSet::new()),
            fatal: Mutex::new(None),
        }
    }
}

/// Replay `statements` over the pool.
///
/// Serial (`execute_in_parallel` false): everything runs in submitted
/// order on `which_conn` (default 0). Parallel: statements are
/// distributed across all connections by run-length over equal object
/// type. On-error-continue failures are counted and recorded; without
/// the flag the first failure is fatal, every worker stops at its next
/// check, and the error is returned after all workers drain.
pub fn execute_statements<C: SegmentConnection>(
    pool: &ConnectionPool<C>,
    statements: &[StatementWithType],
    progress: &dyn ProgressReporter,
    on_error_continue: bool,
    execute_in_parallel: bool,
    which_conn: Option<usize>,
    term: &TerminationSignal,
) -> RestoreResult<ExecutionReport> {
    let shared = ExecState::new();

    if statements.is_empty() {
        return Ok(ExecutionReport::default());
    }

    if !execute_in_parallel {
        let conn = pool.validate_conn_num(which_conn);
        let (tx, rx) = channel();
        for statement in statements {
            // The receiver is alive in this scope; send cannot fail.
            let _ = tx.send(statement.clone());
        }
        drop(tx);
        execute_for_conn(pool, rx, conn, &shared, progress, on_error_continue, term);
    } else {
        let split = distribute_by_type(statements, pool.num_conns());
        std::thread::scope(|s| {
            for (conn, batch) in split.into_iter().enumerate() {
                let (tx, rx) = channel();
                for statement in batch {
                    let _ = tx.send(statement);
                }
                drop(tx);
                let shared = &shared;
                s.spawn(move || {
                    execute_for_conn(pool, rx, conn, shared, progress, on_error_continue, term);
                });
            }
        });
    }

    if let Some(fatal) = shared.fatal.lock().take() {
        return Err(fatal);
    }
    let report = ExecutionReport {
        num_errors: shared.num_errors.load(Ordering::SeqCst),
        error_tables: std::mem::take(&mut shared.error_tables.lock()),
    };
    if report.num_errors > 0 {
        error!(
            errors = report.num_errors,
            "encountered errors during metadata restore; failed objects recorded"
        );
    }
    Ok(report)
}

fn execute_for_conn<C: SegmentConnection>(
    pool: &ConnectionPool<C>,
    statements: Receiver<StatementWithType>,
    conn: usize,
    shared: &ExecState,
    progress: &dyn ProgressReporter,
    on_error_continue: bool,
    term: &TerminationSignal,
) {
    for statement in statements {
        if term.was_terminated() || shared.fatal.lock().is_some() {
            return;
        }
        if let Err(e) = pool.execute(&statement.statement, conn) {
            debug!(
                conn,
                statement = statement.statement.trim(),
                "error executing statement: {}",
                e
            );
            if on_error_continue {
                shared.num_errors.fetch_add(1, Ordering::SeqCst);
                shared.error_tables.lock().insert(statement.fq_name());
            } else {
                let mut fatal = shared.fatal.lock();
                if fatal.is_none() {
                    *fatal = Some(e);
                }
            }
        }
        progress.increment();
    }
}

/// Run-length distribution over equal object type. Consecutive
/// statements of the same type go to the same worker; a type change
/// advances the worker index, wrapping at `num_workers`.
fn distribute_by_type(
    statements: &[StatementWithType],
    num_workers: usize,
) -> Vec<Vec<StatementWithType>> {
    let mut split: Vec<Vec<StatementWithType>> = vec![Vec::new(); num_workers.max(1)];
    if statements.is_empty() {
        return split;
    }
    let mut current = 0;
    split[0].push(statements[0].clone());
    for pair in statements.windows(2) {
        if !pair[0].type_is_equal(&pair[1]) {
            current = (current + 1) % split.len();
        }
        split[current].push(pair[1].clone());
    }
    split
}

// ── Batching ────────────────────────────────────────────────────────────────

/// Partition post-data statements into the three deadlock-avoiding
/// batches: one index per table, everything else, then the ` METADATA`
/// statements that depend on batch two.
pub fn batch_postdata_statements(
    statements: &[StatementWithType],
) -> (
    Vec<StatementWithType>,
    Vec<StatementWithType>,
    Vec<StatementWithType>,
) {
    let mut tables_with_index: BTreeSet<&str> = BTreeSet::new();
    let mut first = Vec::new();
    let mut second = Vec::new();
    let mut third = Vec::new();

    for statement in statements {
        if statement.object_type == "INDEX"
            && !tables_with_index.contains(statement.reference_object.as_str())
        {
            tables_with_index.insert(&statement.reference_object);
            first.push(statement.clone());
        } else if statement.object_type.ends_with(" METADATA") {
            third.push(statement.clone());
        } else {
            second.push(statement.clone());
        }
    }
    (first, second, third)
}

/// Partition pre-data statements by dependency tier: the tier-zero
/// prefix that precedes any numbered tier, the numbered tiers keyed
/// ascending, and the tier-zero remainder.
pub fn batch_predata_statements(
    statements: &[StatementWithType],
) -> (
    Vec<StatementWithType>,
    BTreeMap<u32, Vec<StatementWithType>>,
    Vec<StatementWithType>,
) {
    let mut found_numbered_tier = false;
    let mut first_tier_zero = Vec::new();
    let mut numbered_tiers: BTreeMap<u32, Vec<StatementWithType>> = BTreeMap::new();
    let mut second_tier_zero = Vec::new();

    for statement in statements {
        if statement.tier > 0 {
            found_numbered_tier = true;
            numbered_tiers
                .entry(statement.tier)
                .or_default()
                .push(statement.clone());
        } else if !found_numbered_tier {
            first_tier_zero.push(statement.clone());
        } else {
            second_tier_zero.push(statement.clone());
        }
    }
    (first_tier_zero, numbered_tiers, second_tier_zero)
}

/// Batch and replay pre-data statements, with a full barrier between
/// tiers.
pub fn execute_predata<C: SegmentConnection>(
    pool: &ConnectionPool<C>,
    statements: &[StatementWithType],
    progress: &dyn ProgressReporter,
    on_error_continue: bool,
    execute_in_parallel: bool,
    term: &TerminationSignal,
) -> RestoreResult<ExecutionReport> {
    let (first, tiers, second) = batch_predata_statements(statements);
    let mut report = ExecutionReport::default();

    let mut run = |batch: &[StatementWithType]| -> RestoreResult<()> {
        let r = execute_statements(
            pool,
            batch,
            progress,
            on_error_continue,
            execute_in_parallel,
            None,
            term,
        )?;
        report.merge(r);
        Ok(())
    };

    run(&first)?;
    for batch in tiers.values() {
        run(batch)?;
    }
    run(&second)?;
    Ok(report)
}

/// Batch and replay post-data statements, with a full barrier between
/// the three batches.
pub fn execute_postdata<C: SegmentConnection>(
    pool: &ConnectionPool<C>,
    statements: &[StatementWithType],
    progress: &dyn ProgressReporter,
    on_error_continue: bool,
    execute_in_parallel: bool,
    term: &TerminationSignal,
) -> RestoreResult<ExecutionReport> {
    let (first, second, third) = batch_postdata_statements(statements);
    let mut report = ExecutionReport::default();
    for batch in [&first, &second, &third] {
        let r = execute_statements(
            pool,
            batch,
            progress,
            on_error_continue,
            execute_in_parallel,
            None,
            term,
        )?;
        report.merge(r);
    }
    Ok(report)
}
