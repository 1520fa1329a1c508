//! Multi-platform fan-out.
//!
//! Each platform gets its own engine run over the shared graph. Runs are
//! independent: one platform failing does not cancel the others.

use crate::builder::executor::{ExecutionError, Executor, FinalResult, StepError};
use crate::builder::graph::OperationGraph;
use crate::builder::platform::Platform;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, instrument};

/// Per-platform results in the order platforms were requested.
#[derive(Debug)]
pub struct MatrixOutcome {
    pub results: Vec<(Platform, Result<FinalResult, ExecutionError>)>,
}

impl MatrixOutcome {
    pub fn is_success(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_ok())
    }

    pub fn completed(&self) -> impl Iterator<Item = &FinalResult> {
        self.results.iter().filter_map(|(_, r)| r.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ExecutionError> {
        self.results.iter().filter_map(|(_, r)| r.as_ref().err())
    }

    /// One result per platform, or the failures alongside what did finish.
    pub fn into_results(self) -> Result<Vec<FinalResult>, MatrixError> {
        let mut completed = Vec::with_capacity(self.results.len());
        let mut failures = Vec::new();
        for (_, result) in self.results {
            match result {
                Ok(result) => completed.push(result),
                Err(err) => failures.push(err),
            }
        }

        if failures.is_empty() {
            Ok(completed)
        } else {
            Err(MatrixError { failures, completed })
        }
    }
}

/// At least one platform failed.
#[derive(Debug)]
pub struct MatrixError {
    pub failures: Vec<ExecutionError>,
    /// Platforms that built successfully.
    pub completed: Vec<FinalResult>,
}

impl fmt::Display for MatrixError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.failures.as_slice() {
            [only] => write!(f, "{}", only),
            failures => {
                write!(f, "{} platform builds failed:", failures.len())?;
                for failure in failures {
                    write!(f, "\n  {}", failure)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for MatrixError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures.first().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Builds `target_stage` for every platform concurrently.
#[instrument(skip_all, fields(platforms = platforms.len()))]
pub async fn run(
    executor: &Executor,
    graph: Arc<OperationGraph>,
    target_stage: usize,
    platforms: &[Platform],
) -> MatrixOutcome {
    let mut tasks = JoinSet::new();
    for (slot, platform) in platforms.iter().enumerate() {
        let executor = executor.clone();
        let graph = graph.clone();
        let platform = platform.clone();
        tasks.spawn(async move { (slot, executor.execute(graph, target_stage, platform).await) });
    }

    let mut slots: Vec<Option<Result<FinalResult, ExecutionError>>> = platforms.iter().map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((slot, result)) => {
                match &result {
                    Ok(done) => info!(platform = %done.platform, layers = done.stats.layer_count, "Platform build complete"),
                    Err(e) => error!(platform = %e.platform, error = %e, "Platform build failed"),
                }
                slots[slot] = Some(result);
            }
            // A panicked platform task leaves its slot empty; filled in below.
            Err(e) => error!(error = %e, "Platform task failed"),
        }
    }

    let results = platforms
        .iter()
        .cloned()
        .zip(slots)
        .map(|(platform, slot)| {
            let result = slot.unwrap_or_else(|| {
                Err(ExecutionError {
                    platform: platform.clone(),
                    origin: None,
                    source: StepError::Task("platform task did not complete".into()),
                })
            });
            (platform, result)
        })
        .collect();

    MatrixOutcome { results }
}
