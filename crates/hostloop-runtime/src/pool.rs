//! A pool of symmetric loop workers.
//!
//! Workers share nothing mutable. Each slot holds either a running
//! `WorkerHandle` or the error that stopped that worker from starting, so one
//! failed worker never takes its siblings down.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use futures::future::join_all;

use crate::audit::StatsSnapshot;
use crate::config::EngineConfig;
use crate::error::RuntimeError;
use crate::handle::WorkerHandle;
use crate::sink::Hooks;
use crate::spawn::spawn_worker;
use crate::types::{SourceUnit, WorkerId};

pub const DEFAULT_WORKERS: usize = 8;

/// What each worker evaluates before it reports ready.
#[derive(Debug, Clone)]
enum Startup {
    /// The fixed script, using each worker's own binding name.
    Repro,
    Source(SourceUnit),
    Nothing,
}

/// Builder for [`LoopPool`].
#[derive(Debug)]
pub struct PoolBuilder {
    config: EngineConfig,
    workers: usize,
    hooks: Hooks,
    startup: Startup,
    overrides: HashMap<usize, EngineConfig>,
}

impl PoolBuilder {
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count;
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Evaluate `source` on every worker at startup instead of the fixed script.
    pub fn source(mut self, source: SourceUnit) -> Self {
        self.startup = Startup::Source(source);
        self
    }

    /// Start workers with no startup script.
    pub fn no_source(mut self) -> Self {
        self.startup = Startup::Nothing;
        self
    }

    /// Use a different configuration for the worker at `index`.
    pub fn configure_worker(mut self, index: usize, config: EngineConfig) -> Self {
        self.overrides.insert(index, config);
        self
    }

    /// Spawn every worker and wait until each is ready or has failed.
    pub fn start(self) -> LoopPool {
        let PoolBuilder {
            config,
            workers,
            hooks,
            startup,
            mut overrides,
        } = self;

        let shared = Arc::new(config);
        let plans: Vec<(WorkerId, Arc<EngineConfig>)> = (0..workers)
            .map(|index| {
                let config = overrides
                    .remove(&index)
                    .map(Arc::new)
                    .unwrap_or_else(|| shared.clone());
                (WorkerId(index), config)
            })
            .collect();
        for index in overrides.keys() {
            tracing::warn!(
                "ignoring configuration for worker-{}: pool has {} workers",
                index,
                workers
            );
        }

        // Spawns block on each worker's init handshake, so run them side by side.
        let slots: Vec<(WorkerId, Result<WorkerHandle, RuntimeError>)> = thread::scope(|scope| {
            let spawning: Vec<_> = plans
                .into_iter()
                .map(|(id, config)| {
                    let hooks = hooks.clone();
                    let source = match &startup {
                        Startup::Repro => Some(config.repro_source()),
                        Startup::Source(source) => Some(source.clone()),
                        Startup::Nothing => None,
                    };
                    (id, scope.spawn(move || spawn_worker(id, config, hooks, source)))
                })
                .collect();

            spawning
                .into_iter()
                .map(|(id, spawn)| (id, spawn.join().unwrap_or(Err(RuntimeError::ThreadPanic))))
                .collect()
        });

        for (id, slot) in &slots {
            if let Err(e) = slot {
                tracing::warn!("[{}] failed to start: {}", id, e);
            }
        }

        let pool = LoopPool { slots };
        tracing::info!(
            "pool started: {} of {} workers running",
            pool.running_count(),
            pool.len()
        );
        pool
    }
}

/// A fixed set of loop workers.
#[derive(Debug)]
pub struct LoopPool {
    slots: Vec<(WorkerId, Result<WorkerHandle, RuntimeError>)>,
}

impl LoopPool {
    pub fn builder(config: EngineConfig) -> PoolBuilder {
        PoolBuilder {
            config,
            workers: DEFAULT_WORKERS,
            hooks: Hooks::default(),
            startup: Startup::Repro,
            overrides: HashMap::new(),
        }
    }

    /// Start `workers` workers running the fixed script, with log-only hooks.
    pub fn start(workers: usize, config: EngineConfig) -> Self {
        Self::builder(config).workers(workers).start()
    }

    /// Number of slots, running or failed.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn running(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.slots.iter().filter_map(|(_, slot)| slot.as_ref().ok())
    }

    pub fn running_count(&self) -> usize {
        self.running().count()
    }

    /// Workers that failed to start, with their errors.
    pub fn failures(&self) -> Vec<(WorkerId, &RuntimeError)> {
        self.slots
            .iter()
            .filter_map(|(id, slot)| slot.as_ref().err().map(|e| (*id, e)))
            .collect()
    }

    pub fn worker(&self, id: WorkerId) -> Option<&WorkerHandle> {
        self.slots
            .get(id.0)
            .and_then(|(_, slot)| slot.as_ref().ok())
    }

    /// Evaluate `source` on every running worker concurrently.
    pub async fn evaluate_all(
        &self,
        source: SourceUnit,
    ) -> Vec<(WorkerId, Result<(), RuntimeError>)> {
        join_all(self.running().map(|handle| {
            let source = source.clone();
            async move { (handle.id(), handle.evaluate(source).await) }
        }))
        .await
    }

    /// Wait until every running worker has drained its run queue.
    pub async fn flush(&self) -> Result<(), RuntimeError> {
        join_all(self.running().map(WorkerHandle::flush))
            .await
            .into_iter()
            .collect()
    }

    /// Counters summed over every running worker.
    pub fn stats(&self) -> StatsSnapshot {
        self.running().map(WorkerHandle::stats).sum()
    }

    /// Stop every worker and join its thread.
    pub fn shutdown(self) -> Vec<(WorkerId, Result<(), RuntimeError>)> {
        for handle in self.running() {
            handle.terminate();
        }
        let results: Vec<_> = self
            .slots
            .into_iter()
            .filter_map(|(id, slot)| slot.ok().map(|handle| (id, handle.join())))
            .collect();
        tracing::debug!("pool shut down: {} workers joined", results.len());
        results
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use guest_types::GuestValue;
    use rand::Rng;

    use super::*;
    use crate::config::Capabilities;
    use crate::sink::Recorder;
    use crate::types::REPRO_RESULT;

    fn recording_pool(workers: usize) -> (LoopPool, Arc<Recorder>) {
        let recorder = Recorder::new();
        let pool = LoopPool::builder(EngineConfig::default())
            .workers(workers)
            .hooks(Hooks::recording(recorder.clone()))
            .no_source()
            .start();
        (pool, recorder)
    }

    /// A random argument value that survives a JSON round trip unchanged.
    fn random_value<R: Rng>(rng: &mut R, depth: usize) -> GuestValue {
        const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789 ";
        let choice = if depth == 0 { rng.gen_range(0..5) } else { rng.gen_range(0..7) };
        match choice {
            0 => GuestValue::Null,
            1 => GuestValue::Bool(rng.gen_bool(0.5)),
            2 => GuestValue::Int(rng.gen_range(-1_000_000..1_000_000)),
            3 => GuestValue::Float(rng.gen_range(-1000..1000) as f64 + 0.5),
            4 => {
                let len = rng.gen_range(0..12);
                GuestValue::String(
                    (0..len)
                        .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
                        .collect(),
                )
            }
            5 => GuestValue::Array(
                (0..rng.gen_range(0..4))
                    .map(|_| random_value(rng, depth - 1))
                    .collect(),
            ),
            // Keys stay in sorted order so JSON output keeps them as generated.
            _ => GuestValue::object_from_pairs(
                (0..rng.gen_range(0..4)).map(|i| (format!("k{i}"), random_value(rng, depth - 1))),
            ),
        }
    }

    fn js_literal(values: &[GuestValue]) -> String {
        serde_json::Value::from(GuestValue::Array(values.to_vec())).to_string()
    }

    #[tokio::test]
    async fn test_fixed_source_on_eight_workers() {
        for _ in 0..25 {
            let recorder = Recorder::new();
            let pool = LoopPool::builder(EngineConfig::default())
                .hooks(Hooks::recording(recorder.clone()))
                .start();
            assert!(pool.failures().is_empty());
            pool.flush().await.unwrap();

            let records = recorder.invocations();
            assert_eq!(records.len(), DEFAULT_WORKERS);
            for handle in pool.running() {
                let mine = recorder.invocations_of(handle.id());
                assert_eq!(mine.len(), 1, "{}", handle.id());
                assert_eq!(mine[0].result, Some(GuestValue::Int(REPRO_RESULT)));
                assert_eq!(mine[0].args.to_string(), "(1000, 2000)");
                assert_eq!(mine[0].thread, handle.thread_id());
            }
            assert_eq!(recorder.error_count(), 0);
            assert_eq!(pool.stats().foreign_entries, 0);

            for (_, joined) in pool.shutdown() {
                joined.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_arguments_are_copied_at_call_time() {
        let (pool, recorder) = recording_pool(4);
        let mut rng = rand::thread_rng();

        let expected: Vec<Vec<GuestValue>> = (0..pool.len())
            .map(|_| (0..rng.gen_range(1..6)).map(|_| random_value(&mut rng, 3)).collect())
            .collect();

        let evaluations = pool.running().map(|handle| {
            let args = &expected[handle.id().0];
            let script = format!(
                r#"
                const args = {};
                hostInvoke((...xs) => xs, ...args);
                for (const a of args) {{
                    if (Array.isArray(a)) a.length = 0;
                    else if (a && typeof a === 'object') for (const k in a) a[k] = 'mutated';
                }}
                args.length = 0;
                "#,
                js_literal(args)
            );
            handle.evaluate(SourceUnit::new("mutate.js", script))
        });
        for result in join_all(evaluations).await {
            result.unwrap();
        }
        pool.flush().await.unwrap();

        for handle in pool.running() {
            let records = recorder.invocations_of(handle.id());
            assert_eq!(records.len(), 1);
            let want = &expected[handle.id().0];
            assert_eq!(records[0].args.as_slice(), want.as_slice());
            assert_eq!(records[0].result, Some(GuestValue::Array(want.clone())));
        }
    }

    #[tokio::test]
    async fn test_invocations_run_in_submission_order() {
        let (pool, recorder) = recording_pool(2);
        pool.evaluate_all(SourceUnit::new(
            "order.js",
            "for (let i = 0; i < 100; i++) hostInvoke(n => n, i);",
        ))
        .await
        .into_iter()
        .for_each(|(_, r)| r.unwrap());
        pool.flush().await.unwrap();

        for handle in pool.running() {
            let results: Vec<i64> = recorder
                .invocations_of(handle.id())
                .iter()
                .filter_map(|r| r.result.as_ref().and_then(GuestValue::as_i64))
                .collect();
            assert_eq!(results, (0..100).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_concurrent_invokes_stay_on_owner_threads() {
        let (pool, recorder) = recording_pool(8);
        let mut rng = rand::thread_rng();

        let scripts: Vec<String> = (0..pool.len())
            .map(|_| {
                let offset: i64 = rng.gen_range(0..1000);
                format!("for (let i = 0; i < 20; i++) hostInvoke((i, x) => i + x, i, {offset});")
            })
            .collect();
        let evaluations = pool.running().map(|handle| {
            let text = scripts[handle.id().0].clone();
            handle.evaluate(SourceUnit::new("stress.js", text))
        });
        for result in join_all(evaluations).await {
            result.unwrap();
        }
        pool.flush().await.unwrap();

        let records = recorder.invocations();
        assert_eq!(records.len(), 160);
        for record in &records {
            let owner = pool.worker(record.worker).unwrap();
            assert_eq!(record.thread, owner.thread_id());
        }

        let stats = pool.stats();
        assert_eq!(stats.foreign_entries, 0);
        assert_eq!(stats.scheduled, 160);
        assert_eq!(stats.completed, 160);
        assert_eq!(stats.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_non_callable_is_rejected_and_worker_continues() {
        let (pool, recorder) = recording_pool(1);
        let handle = pool.worker(WorkerId(0)).unwrap();

        handle
            .evaluate(SourceUnit::new(
                "reject.js",
                "try { hostInvoke({ not: 'a function' }); } catch (e) { hostInvoke(n => n, e.name); }",
            ))
            .await
            .unwrap();
        handle
            .evaluate(SourceUnit::new("next.js", "hostInvoke(() => 'next')"))
            .await
            .unwrap();
        handle.flush().await.unwrap();

        let results: Vec<_> = recorder.invocations().into_iter().map(|r| r.result).collect();
        assert_eq!(
            results,
            vec![Some(GuestValue::from("TypeError")), Some(GuestValue::from("next"))]
        );
        assert_eq!(handle.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_throwing_invocation_reaches_error_sink() {
        let (pool, recorder) = recording_pool(2);
        let handle = pool.worker(WorkerId(1)).unwrap();

        handle
            .evaluate(SourceUnit::new(
                "throw.js",
                "hostInvoke(() => { throw new Error('deferred failure'); })",
            ))
            .await
            .unwrap();
        handle.flush().await.unwrap();

        let errors = recorder.take_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].worker, WorkerId(1));
        assert_eq!(errors[0].error.class(), "GuestInvocationError");

        handle
            .evaluate(SourceUnit::new("after.js", "hostInvoke((a, b) => a * b, 6, 7)"))
            .await
            .unwrap();
        handle.flush().await.unwrap();
        let records = recorder.invocations_of(WorkerId(1));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].result, Some(GuestValue::Int(42)));
        assert_eq!(recorder.error_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_worker_is_isolated() {
        let recorder = Recorder::new();
        let pool = LoopPool::builder(EngineConfig::default())
            .hooks(Hooks::recording(recorder.clone()))
            .configure_worker(3, EngineConfig::default().with_binding_name("1nvalid"))
            .start();

        let failures = pool.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, WorkerId(3));
        assert_eq!(failures[0].1.class(), "InitError");
        assert!(pool.worker(WorkerId(3)).is_none());
        assert_eq!(pool.running_count(), 7);

        pool.flush().await.unwrap();
        assert_eq!(recorder.invocations().len(), 7);
        assert_eq!(pool.shutdown().len(), 7);
    }

    #[tokio::test]
    async fn test_startup_script_error_fails_every_worker_cleanly() {
        let pool = LoopPool::builder(EngineConfig::default())
            .workers(3)
            .source(SourceUnit::new("boot.js", "undefinedFunction()"))
            .start();
        assert_eq!(pool.running_count(), 0);
        assert!(pool.failures().iter().all(|(_, e)| e.class() == "ScriptError"));
        assert!(pool.flush().await.is_ok());
    }

    #[tokio::test]
    async fn test_custom_binding_name() {
        let recorder = Recorder::new();
        let pool = LoopPool::builder(EngineConfig::default().with_binding_name("schedule"))
            .workers(2)
            .hooks(Hooks::recording(recorder.clone()))
            .start();
        pool.flush().await.unwrap();

        let records = recorder.invocations();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.result == Some(GuestValue::Int(REPRO_RESULT))));
    }

    #[tokio::test]
    async fn test_fixed_source_without_console_fails_each_invocation() {
        let recorder = Recorder::new();
        let config = EngineConfig {
            console: false,
            ..EngineConfig::default()
        };
        let pool = LoopPool::builder(config)
            .workers(3)
            .hooks(Hooks::recording(recorder.clone()))
            .start();
        assert_eq!(pool.running_count(), 3);
        pool.flush().await.unwrap();

        let errors = recorder.take_errors();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().all(|r| r.error.class() == "GuestInvocationError"));
        assert!(errors.iter().all(|r| r.error.to_string().contains("console")));
        assert!(recorder.invocations().is_empty());
        assert_eq!(pool.stats().failed, 3);
    }

    #[tokio::test]
    async fn test_timer_capability_runs_on_owner_thread() {
        let recorder = Recorder::new();
        let caps = Capabilities {
            threads: true,
            ..Capabilities::NONE
        };
        let pool = LoopPool::builder(EngineConfig::default().with_capabilities(caps))
            .workers(2)
            .hooks(Hooks::recording(recorder.clone()))
            .source(SourceUnit::new(
                "timer.js",
                "const box = { n: 41 }; host.after(10, b => b.n + 1, box); box.n = 0;",
            ))
            .start();
        assert_eq!(pool.running_count(), 2);

        let mut waited = 0;
        while recorder.invocations().len() < 2 && waited < 200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }

        let records = recorder.invocations();
        assert_eq!(records.len(), 2);
        for record in records {
            assert_eq!(record.result, Some(GuestValue::Int(42)));
            assert_eq!(record.thread, pool.worker(record.worker).unwrap().thread_id());
        }
    }

    #[tokio::test]
    async fn test_shutdown_discards_parked_timers() {
        let caps = Capabilities {
            threads: true,
            ..Capabilities::NONE
        };
        let pool = LoopPool::builder(EngineConfig::default().with_capabilities(caps))
            .workers(2)
            .source(SourceUnit::new("late.js", "host.after(60000, () => 1);"))
            .start();
        assert_eq!(pool.stats().scheduled, 2);

        for (_, joined) in pool.shutdown() {
            joined.unwrap();
        }
    }
}
