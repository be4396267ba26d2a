//! Trial rounds.
//!
//! Each round starts a fresh pool, waits for the startup invocations to run,
//! checks the outcome, and shuts the pool down again.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;

use hostloop_runtime::{GuestValue, Hooks, LoopPool, REPRO_RESULT, Recorder, SourceUnit};

use crate::settings::Settings;

/// Outcome of one round.
#[derive(Debug, Clone, Serialize)]
pub struct TrialReport {
    pub trial: usize,
    pub running: usize,
    pub invocations: usize,
    pub foreign_entries: u64,
    pub elapsed_ms: u128,
    /// Everything that went wrong; empty when the round passed.
    pub problems: Vec<String>,
}

impl TrialReport {
    pub fn passed(&self) -> bool {
        self.problems.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub trials: usize,
    pub workers: usize,
    pub passed: usize,
    pub failed: usize,
    pub invocations: usize,
    /// Reports of the rounds that failed.
    pub failures: Vec<TrialReport>,
}

impl Summary {
    pub fn ok(&self) -> bool {
        self.failed == 0
    }

    /// An error naming how many rounds failed, if any did.
    pub fn check(&self) -> Result<()> {
        anyhow::ensure!(self.ok(), "{} of {} trials failed", self.failed, self.trials);
        Ok(())
    }
}

/// Read a startup script from disk.
pub fn load_script(path: &Path) -> Result<SourceUnit> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read script {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(SourceUnit::new(name, text))
}

/// Run every round. `script` replaces the fixed startup source.
pub async fn run_trials(settings: &Settings, script: Option<SourceUnit>) -> Summary {
    let mut summary = Summary {
        trials: settings.trials,
        workers: settings.workers,
        passed: 0,
        failed: 0,
        invocations: 0,
        failures: Vec::new(),
    };

    for trial in 0..settings.trials {
        let report = run_trial(trial, settings, script.clone()).await;
        summary.invocations += report.invocations;

        if report.passed() {
            summary.passed += 1;
            tracing::debug!("trial {} passed in {}ms", trial, report.elapsed_ms);
        } else {
            summary.failed += 1;
            for problem in &report.problems {
                tracing::warn!("trial {}: {}", trial, problem);
            }
            summary.failures.push(report);
        }
    }

    tracing::info!(
        "{} of {} trials passed ({} workers, {} invocations)",
        summary.passed,
        summary.trials,
        summary.workers,
        summary.invocations
    );
    summary
}

/// Run a single round.
pub async fn run_trial(
    trial: usize,
    settings: &Settings,
    script: Option<SourceUnit>,
) -> TrialReport {
    let started = Instant::now();
    let recorder = Recorder::new();
    let fixed_source = script.is_none();

    let mut builder = LoopPool::builder(settings.engine.clone())
        .workers(settings.workers)
        .hooks(Hooks::recording(recorder.clone()));
    if let Some(script) = script {
        builder = builder.source(script);
    }
    let pool = builder.start();

    let mut problems = Vec::new();

    for (id, e) in pool.failures() {
        problems.push(format!("{} failed to start: {}", id, e));
    }
    if let Err(e) = pool.flush().await {
        problems.push(format!("flush failed: {}", e));
    }

    for report in recorder.take_errors() {
        let seq = report.seq.map(|s| format!(" task #{s}")).unwrap_or_default();
        problems.push(format!("{}{}: {}", report.worker, seq, report.error));
    }

    let stats = pool.stats();
    if stats.foreign_entries > 0 {
        problems.push(format!("{} foreign runtime entries", stats.foreign_entries));
    }

    let records = recorder.take_invocations();
    for record in &records {
        let owner = pool.worker(record.worker).map(|h| h.thread_id());
        if owner != Some(record.thread) {
            problems.push(format!(
                "{} task #{} ran on {:?}, not its worker thread",
                record.worker, record.seq, record.thread
            ));
        }
    }

    if fixed_source {
        for handle in pool.running() {
            let mine: Vec<_> = records.iter().filter(|r| r.worker == handle.id()).collect();
            match mine.as_slice() {
                [only] if only.result == Some(GuestValue::Int(REPRO_RESULT)) => {}
                [only] => {
                    let computed = only.result.as_ref().map(ToString::to_string);
                    problems.push(format!(
                        "{} computed {}, expected {}",
                        handle.id(),
                        computed.as_deref().unwrap_or("nothing"),
                        REPRO_RESULT
                    ));
                }
                other => problems.push(format!(
                    "{} ran {} invocations, expected 1",
                    handle.id(),
                    other.len()
                )),
            }
        }
    }

    let running = pool.running_count();
    for (id, joined) in pool.shutdown() {
        if let Err(e) = joined {
            problems.push(format!("{} did not shut down cleanly: {}", id, e));
        }
    }

    TrialReport {
        trial,
        running,
        invocations: records.len(),
        foreign_entries: stats.foreign_entries,
        elapsed_ms: started.elapsed().as_millis(),
        problems,
    }
}
