//! The host-to-guest callback bridge.
//!
//! Guest code calls `hostInvoke(fn, ...args)`. The bridge checks that `fn` is
//! callable, copies `args` into an `ArgSnapshot`, and pushes a `Task` onto the
//! run queue of the worker that owns the guest runtime. The call returns
//! before the task runs.
//!
//! A `Task` holds a persistent handle to a guest function, so neither the task
//! nor the queue sender is `Send`. The bridge can only ever reach its own
//! worker's queue.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rquickjs::function::{Opt, Rest};
use rquickjs::{Ctx, Exception, Function, Object, Persistent, Value};
use tokio::sync::mpsc;

use guest_types::ArgSnapshot;

use crate::audit::WorkerStats;
use crate::snapshot::capture_args;
use crate::types::WorkerId;

/// A deferred call waiting on a worker's run queue.
pub(crate) struct Task {
    pub seq: u64,
    pub func: Persistent<Function<'static>>,
    pub args: ArgSnapshot,
}

pub(crate) type TaskSender = mpsc::UnboundedSender<Task>;

/// Tasks scheduled with `host.after`, keyed by sequence number until their
/// timer thread sends the number back.
#[derive(Clone)]
pub(crate) struct Timers {
    pub parked: Rc<RefCell<HashMap<u64, Task>>>,
    pub wake: mpsc::UnboundedSender<u64>,
}

#[derive(Clone)]
pub(crate) struct Bridge {
    worker: WorkerId,
    queue: TaskSender,
    next_seq: Rc<Cell<u64>>,
    max_depth: usize,
    stats: Arc<WorkerStats>,
}

impl Bridge {
    pub fn new(
        worker: WorkerId,
        queue: TaskSender,
        max_depth: usize,
        stats: Arc<WorkerStats>,
    ) -> Self {
        Self {
            worker,
            queue,
            next_seq: Rc::new(Cell::new(0)),
            max_depth,
            stats,
        }
    }

    /// Bind `invoke` to `binding` in the guest's global scope.
    pub fn install<'js>(&self, ctx: &Ctx<'js>, binding: &str) -> rquickjs::Result<()> {
        let bridge = self.clone();
        let name = binding.to_string();
        let function = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, func: Opt<Value<'js>>, args: Rest<Value<'js>>| {
                bridge.invoke(&ctx, &name, func.0, args.0)
            },
        )?;
        ctx.globals().set(binding, function)?;
        Ok(())
    }

    /// Add `after(ms, fn, ...args)` to the guest `host` object.
    pub fn install_timer<'js>(
        &self,
        ctx: &Ctx<'js>,
        host: &Object<'js>,
        timers: Timers,
    ) -> rquickjs::Result<()> {
        let bridge = self.clone();
        let function = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, delay_ms: u32, func: Opt<Value<'js>>, args: Rest<Value<'js>>| {
                bridge.after(&ctx, &timers, delay_ms, func.0, args.0)
            },
        )?;
        host.set("after", function)?;
        Ok(())
    }

    /// Capture and enqueue. Never runs `func` itself.
    pub fn invoke<'js>(
        &self,
        ctx: &Ctx<'js>,
        name: &str,
        func: Option<Value<'js>>,
        args: Vec<Value<'js>>,
    ) -> rquickjs::Result<()> {
        let task = self.capture(ctx, name, func, args)?;
        let seq = task.seq;
        if self.queue.send(task).is_err() {
            return Err(Exception::throw_message(ctx, &format!("{name}: run queue is closed")));
        }
        self.stats.record_scheduled();
        tracing::trace!("[{}] scheduled task #{}", self.worker, seq);
        Ok(())
    }

    /// Capture now, enqueue once a host thread has slept for `delay_ms`.
    fn after<'js>(
        &self,
        ctx: &Ctx<'js>,
        timers: &Timers,
        delay_ms: u32,
        func: Option<Value<'js>>,
        args: Vec<Value<'js>>,
    ) -> rquickjs::Result<()> {
        let task = self.capture(ctx, "host.after", func, args)?;
        let seq = task.seq;
        timers.parked.borrow_mut().insert(seq, task);

        // Only the sequence number crosses to the timer thread.
        let wake = timers.wake.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-timer-{}", self.worker, seq))
            .spawn(move || {
                thread::sleep(Duration::from_millis(u64::from(delay_ms)));
                let _ = wake.send(seq);
            });

        if let Err(e) = spawned {
            timers.parked.borrow_mut().remove(&seq);
            return Err(Exception::throw_message(
                ctx,
                &format!("host.after: failed to start timer thread: {e}"),
            ));
        }
        self.stats.record_scheduled();
        tracing::trace!("[{}] parked task #{} for {}ms", self.worker, seq, delay_ms);
        Ok(())
    }

    fn capture<'js>(
        &self,
        ctx: &Ctx<'js>,
        name: &str,
        func: Option<Value<'js>>,
        args: Vec<Value<'js>>,
    ) -> rquickjs::Result<Task> {
        let Some(func) = func.and_then(|value| value.into_function()) else {
            self.stats.record_rejected();
            return Err(Exception::throw_type(
                ctx,
                &format!("{name}: first argument must be a function"),
            ));
        };

        let args = match capture_args(&args, self.max_depth) {
            Ok(args) => args,
            Err(e) => {
                self.stats.record_rejected();
                return Err(Exception::throw_type(ctx, &format!("{name}: {e}")));
            }
        };

        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);

        Ok(Task {
            seq,
            func: Persistent::save(ctx, func),
            args,
        })
    }
}
