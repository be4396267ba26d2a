//! Worker thread implementation.
//!
//! Each worker owns one guest runtime and runs a single-threaded loop over
//! three inputs: its run queue (tasks scheduled by the bridge), timer wakeups
//! from `host.after`, and commands from its handle. Queued tasks always win
//! over wakeups and commands, so a command sent after an `invoke` is handled
//! after that invocation has run.
//!
//! A deferred call that returns a promise settles later: it is recorded as
//! completed or failed once the promise resolves, normally while the job queue
//! is drained right after the call.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use guest_types::{ArgSnapshot, GuestValue};
use rquickjs::function::{Rest, This};
use rquickjs::{CatchResultExt, Ctx, Function, Object, Value};
use tokio::sync::{mpsc, watch};

use crate::audit::{OwnerGuard, WorkerStats};
use crate::bridge::{Bridge, Task, Timers};
use crate::capabilities::register_host;
use crate::command::WorkerCommand;
use crate::config::EngineConfig;
use crate::error::RuntimeError;
use crate::globals::register_console;
use crate::guest::{GuestRuntime, describe_reason};
use crate::sink::{ErrorReport, Hooks};
use crate::snapshot::{capture_value, hydrate_args};
use crate::types::{InvocationRecord, SourceUnit, WorkerId};

/// Everything a worker thread needs, moved into it at spawn.
pub(crate) struct WorkerSetup {
    pub id: WorkerId,
    pub config: Arc<EngineConfig>,
    pub hooks: Hooks,
    pub stats: Arc<WorkerStats>,
    pub startup: Option<SourceUnit>,
}

/// Borrowed view used while running tasks.
struct TaskContext<'a> {
    max_depth: usize,
    hooks: &'a Hooks,
    stats: &'a Arc<WorkerStats>,
}

/// The main worker loop that runs inside the spawned thread.
pub(crate) async fn run_worker(
    setup: WorkerSetup,
    mut cmd_rx: mpsc::Receiver<WorkerCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
    init_tx: std::sync::mpsc::SyncSender<Result<ThreadId, RuntimeError>>,
) -> Result<(), RuntimeError> {
    let WorkerSetup {
        id,
        config,
        hooks,
        stats,
        startup,
    } = setup;

    let guard = OwnerGuard::for_current_thread(id, stats.clone());
    let guest = match GuestRuntime::create(id, &config, guard) {
        Ok(guest) => guest,
        Err(e) => {
            tracing::warn!("[{}] {}", id, e);
            let _ = init_tx.send(Err(e));
            return Ok(());
        }
    };

    let (task_tx, mut task_rx) = mpsc::unbounded_channel::<Task>();
    let (wake_tx, mut wake_rx) = mpsc::unbounded_channel::<u64>();
    let parked: Rc<RefCell<HashMap<u64, Task>>> = Rc::new(RefCell::new(HashMap::new()));
    let timers = Timers {
        parked: parked.clone(),
        wake: wake_tx,
    };
    let bridge = Bridge::new(id, task_tx.clone(), config.max_snapshot_depth, stats.clone());

    let task_ctx = TaskContext {
        max_depth: config.max_snapshot_depth,
        hooks: &hooks,
        stats: &stats,
    };

    let booted = install(&guest, &config, &bridge, timers).and_then(|()| match &startup {
        Some(source) => {
            let result = guest.evaluate(source);
            report_failed_jobs(&guest, &task_ctx);
            result
        }
        None => Ok(()),
    });
    if let Err(e) = booted {
        tracing::warn!("[{}] startup failed: {}", id, e);
        release(guest, &mut task_rx, &parked);
        let _ = init_tx.send(Err(e));
        return Ok(());
    }

    let _ = init_tx.send(Ok(guest.owner()));
    tracing::debug!("[{}] worker ready", id);

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::debug!("[{}] Shutdown signal received", id);
                    break;
                }
            }

            Some(task) = task_rx.recv() => {
                run_task(&guest, task, &task_ctx);
            }

            Some(seq) = wake_rx.recv() => {
                let fired = parked.borrow_mut().remove(&seq);
                if let Some(task) = fired {
                    // The receiver lives in this function, so the send cannot fail.
                    let _ = task_tx.send(task);
                }
            }

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    tracing::debug!("[{}] Command channel closed", id);
                    break;
                };
                match cmd {
                    WorkerCommand::Evaluate { source, reply } => {
                        let result = guest.evaluate(&source);
                        report_failed_jobs(&guest, &task_ctx);
                        let _ = reply.send(result);
                    }
                    WorkerCommand::Flush { reply } => {
                        let _ = reply.send(());
                    }
                }
            }
        }
    }

    release(guest, &mut task_rx, &parked);
    tracing::debug!("[{}] Worker finished", id);
    Ok(())
}

/// Install console, bridge and host object into a fresh runtime.
fn install(
    guest: &GuestRuntime,
    config: &EngineConfig,
    bridge: &Bridge,
    timers: Timers,
) -> Result<(), RuntimeError> {
    let worker = guest.worker();
    guest.with(|ctx| {
        let installed = (|| {
            if config.console {
                register_console(&ctx, worker)?;
            }
            bridge.install(&ctx, &config.binding_name)?;
            register_host(&ctx, config.capabilities, bridge, timers)
        })();
        installed.map_err(|e| RuntimeError::Init {
            worker,
            reason: e.to_string(),
        })
    })
}

/// Drop every task that still holds a guest handle, then the runtime itself.
fn release(
    guest: GuestRuntime,
    task_rx: &mut mpsc::UnboundedReceiver<Task>,
    parked: &RefCell<HashMap<u64, Task>>,
) {
    task_rx.close();
    let mut discarded = 0usize;
    while task_rx.try_recv().is_ok() {
        discarded += 1;
    }
    discarded += parked.borrow().len();
    parked.borrow_mut().clear();

    if discarded > 0 {
        tracing::debug!("[{}] discarded {} pending task(s)", guest.worker(), discarded);
    }
    drop(guest);
}

/// Reports the outcome of one deferred call.
#[derive(Clone)]
struct Outcome {
    worker: WorkerId,
    seq: u64,
    hooks: Hooks,
    stats: Arc<WorkerStats>,
}

impl Outcome {
    fn complete(self, args: ArgSnapshot, result: Option<GuestValue>) {
        self.stats.record_completed();
        self.hooks.observer.observe(InvocationRecord {
            worker: self.worker,
            seq: self.seq,
            args,
            result,
            thread: thread::current().id(),
        });
    }

    fn fail(self, error: RuntimeError) {
        self.stats.record_failed();
        self.hooks.errors.report(ErrorReport {
            worker: self.worker,
            seq: Some(self.seq),
            error,
        });
    }
}

/// Invoke one deferred call and report its outcome.
fn run_task(guest: &GuestRuntime, task: Task, cx: &TaskContext<'_>) {
    let Task { seq, func, args } = task;
    let outcome = Outcome {
        worker: guest.worker(),
        seq,
        hooks: cx.hooks.clone(),
        stats: cx.stats.clone(),
    };

    let called = guest.with(|ctx| {
        let engine = |e: rquickjs::Error| RuntimeError::GuestInvocation(e.to_string());

        let func = func.restore(&ctx).map_err(engine)?;
        let values = hydrate_args(&ctx, &args).map_err(engine)?;
        let returned: Value = func
            .call((Rest(values),))
            .catch(&ctx)
            .map_err(|e| RuntimeError::GuestInvocation(e.to_string()))?;

        match thenable(&returned) {
            Some((promise, then)) => {
                let pending = (outcome.clone(), args.clone());
                settle_later(&ctx, promise, then, pending, cx.max_depth)?;
                Ok(None)
            }
            None => Ok(Some(capture_value(&returned, cx.max_depth).ok())),
        }
    });

    match called {
        Ok(Some(result)) => outcome.complete(args, result),
        Ok(None) => {}
        Err(error) => outcome.fail(error),
    }

    report_failed_jobs(guest, cx);
}

/// A returned value with a callable `then`, split into object and method.
fn thenable<'js>(value: &Value<'js>) -> Option<(Object<'js>, Function<'js>)> {
    let object = value.as_object()?;
    let then = object.get::<_, Value>("then").ok()?.into_function()?;
    Some((object.clone(), then))
}

/// Attach reactions that report the call once its promise settles.
fn settle_later<'js>(
    ctx: &Ctx<'js>,
    promise: Object<'js>,
    then: Function<'js>,
    pending: (Outcome, ArgSnapshot),
    max_depth: usize,
) -> Result<(), RuntimeError> {
    let engine = |e: rquickjs::Error| RuntimeError::GuestInvocation(e.to_string());
    let slot = Rc::new(RefCell::new(Some(pending)));

    let fulfilled = {
        let slot = slot.clone();
        Function::new(ctx.clone(), move |value: Value<'js>| {
            if let Some((outcome, args)) = slot.borrow_mut().take() {
                outcome.complete(args, capture_value(&value, max_depth).ok());
            }
        })
        .map_err(engine)?
    };
    let rejected = Function::new(ctx.clone(), move |reason: Value<'js>| {
        if let Some((outcome, _)) = slot.borrow_mut().take() {
            let message = format!("promise rejected: {}", describe_reason(&reason));
            outcome.fail(RuntimeError::GuestInvocation(message));
        }
    })
    .map_err(engine)?;

    then.call::<_, Value>((This(promise), fulfilled, rejected))
        .catch(ctx)
        .map(|_| ())
        .map_err(|e| RuntimeError::GuestInvocation(e.to_string()))
}

/// Run pending jobs and report each one that threw or left a rejection unhandled.
fn report_failed_jobs(guest: &GuestRuntime, cx: &TaskContext<'_>) {
    let errors = match guest.drain_jobs() {
        Ok(failures) => failures.into_iter().map(RuntimeError::GuestInvocation).collect(),
        Err(e) => vec![e],
    };
    for error in errors {
        cx.hooks.errors.report(ErrorReport {
            worker: guest.worker(),
            seq: None,
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::sink::Recorder;

    /// A guest runtime with the bridge installed and direct access to its queue.
    struct Harness {
        recorder: Arc<Recorder>,
        stats: Arc<WorkerStats>,
        hooks: Hooks,
        task_rx: mpsc::UnboundedReceiver<Task>,
        parked: Rc<RefCell<HashMap<u64, Task>>>,
        guest: Option<GuestRuntime>,
    }

    impl Harness {
        fn new() -> Self {
            let config = EngineConfig::default();
            let recorder = Recorder::new();
            let stats = Arc::new(WorkerStats::default());
            let guard = OwnerGuard::for_current_thread(WorkerId(0), stats.clone());
            let guest = GuestRuntime::create(WorkerId(0), &config, guard).unwrap();

            let (task_tx, task_rx) = mpsc::unbounded_channel();
            let (wake, _) = mpsc::unbounded_channel();
            let parked = Rc::new(RefCell::new(HashMap::new()));
            let depth = config.max_snapshot_depth;
            let bridge = Bridge::new(WorkerId(0), task_tx, depth, stats.clone());
            install(
                &guest,
                &config,
                &bridge,
                Timers {
                    parked: parked.clone(),
                    wake,
                },
            )
            .unwrap();

            Self {
                hooks: Hooks::recording(recorder.clone()),
                recorder,
                stats,
                task_rx,
                parked,
                guest: Some(guest),
            }
        }

        fn guest(&self) -> &GuestRuntime {
            self.guest.as_ref().unwrap()
        }

        fn eval(&self, text: &str) {
            self.guest().evaluate(&SourceUnit::new("test.js", text)).unwrap();
        }

        fn cx(&self) -> TaskContext<'_> {
            TaskContext {
                max_depth: 32,
                hooks: &self.hooks,
                stats: &self.stats,
            }
        }

        fn run_all(&mut self) -> usize {
            let mut ran = 0;
            while let Ok(task) = self.task_rx.try_recv() {
                run_task(self.guest(), task, &self.cx());
                ran += 1;
            }
            ran
        }

        fn drain(&self) {
            report_failed_jobs(self.guest(), &self.cx());
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            if let Some(guest) = self.guest.take() {
                release(guest, &mut self.task_rx, &self.parked);
            }
        }
    }

    #[test]
    fn test_deferred_call_sees_captured_values() {
        let mut h = Harness::new();
        h.eval(
            r#"
            const payload = { x: 1, list: [1, 2] };
            hostInvoke(p => [p.x, p.list.length], payload);
            payload.x = 99;
            payload.list.push(3);
            "#,
        );
        assert_eq!(h.run_all(), 1);

        let records = h.recorder.invocations();
        assert_eq!(records[0].result, Some(GuestValue::from(vec![1, 2])));
        assert_eq!(
            records[0].args.get(0).and_then(|p| p.get("x")),
            Some(&GuestValue::Int(1))
        );
    }

    #[test]
    fn test_argument_survives_gc_before_invocation() {
        let mut h = Harness::new();
        h.eval(
            r#"
            let big = { items: Array.from({ length: 1000 }, (_, i) => i) };
            hostInvoke(b => b.items.reduce((a, n) => a + n, 0), big);
            big = null;
            "#,
        );
        h.guest().gc().unwrap();
        h.run_all();

        assert_eq!(h.recorder.invocations()[0].result, Some(GuestValue::Int(499_500)));
    }

    #[test]
    fn test_throwing_function_goes_to_error_sink() {
        let mut h = Harness::new();
        h.eval("hostInvoke(() => { throw new Error('kaboom'); });");
        h.eval("hostInvoke((a, b) => a + b, 1, 2);");
        assert_eq!(h.run_all(), 2);

        let errors = h.recorder.take_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].seq, Some(0));
        assert_eq!(errors[0].error.class(), "GuestInvocationError");
        assert!(errors[0].error.to_string().contains("kaboom"), "{}", errors[0].error);

        let records = h.recorder.invocations();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].seq, 1);
        assert_eq!(records[0].result, Some(GuestValue::Int(3)));

        let stats = h.stats.snapshot();
        assert_eq!((stats.completed, stats.failed), (1, 1));
    }

    #[test]
    fn test_tasks_scheduled_by_tasks_run_later() {
        let mut h = Harness::new();
        h.eval(
            r#"
            globalThis.order = [];
            hostInvoke(() => { order.push('outer'); hostInvoke(() => order.push('inner')); });
            hostInvoke(() => order.push('second'));
            "#,
        );
        assert_eq!(h.run_all(), 3);
        h.eval("hostInvoke(() => order.join(','))");
        h.run_all();

        let last = h.recorder.invocations().pop().unwrap();
        assert_eq!(last.result, Some(GuestValue::from("outer,second,inner")));
    }

    #[test]
    fn test_release_discards_pending_tasks() {
        let h = Harness::new();
        h.eval("for (let i = 0; i < 3; i++) hostInvoke(() => i);");
        assert_eq!(h.stats.snapshot().scheduled, 3);
        // Dropping the harness releases the runtime with three tasks still queued.
        drop(h);
    }

    #[test]
    fn test_async_rejection_is_a_failed_invocation() {
        let mut h = Harness::new();
        h.eval("hostInvoke(async () => { throw new Error('async boom'); });");
        assert_eq!(h.run_all(), 1);

        let errors = h.recorder.take_errors();
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert_eq!(errors[0].seq, Some(0));
        assert_eq!(errors[0].error.class(), "GuestInvocationError");
        assert!(errors[0].error.to_string().contains("async boom"), "{}", errors[0].error);
        assert!(h.recorder.invocations().is_empty());

        let stats = h.stats.snapshot();
        assert_eq!((stats.completed, stats.failed), (0, 1));
    }

    #[test]
    fn test_async_result_is_recorded_when_settled() {
        let mut h = Harness::new();
        h.eval("hostInvoke(async n => { await null; return n * 2; }, 21);");
        h.run_all();

        let records = h.recorder.invocations();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].result, Some(GuestValue::Int(42)));
        assert_eq!(records[0].args.get(0), Some(&GuestValue::Int(21)));
        assert_eq!(h.recorder.error_count(), 0);
        assert_eq!(h.stats.snapshot().in_flight(), 0);
    }

    #[test]
    fn test_throwing_reaction_goes_to_error_sink() {
        let mut h = Harness::new();
        h.eval("Promise.resolve().then(() => { throw new Error('job boom'); });");
        h.drain();

        let errors = h.recorder.take_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].seq, None);
        assert_eq!(errors[0].error.class(), "GuestInvocationError");
        assert!(errors[0].error.to_string().contains("job boom"), "{}", errors[0].error);

        // A stray rejection inside a task does not fail the task itself.
        h.eval("hostInvoke(() => { Promise.reject(new Error('stray')); return 1; });");
        h.run_all();
        let errors = h.recorder.take_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].seq, None);
        assert_eq!(h.recorder.invocations()[0].result, Some(GuestValue::Int(1)));
    }
}
