//! Guest runtime handle.
//!
//! Wraps one QuickJS runtime and context. The handle is created on its
//! worker's thread, is `!Send`, and checks the owner thread on every entry.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;
use std::thread::ThreadId;

use rquickjs::context::EvalOptions;
use rquickjs::convert::Coerced;
use rquickjs::{CatchResultExt, Context, Ctx, Persistent, Runtime, Value};

use crate::audit::OwnerGuard;
use crate::config::EngineConfig;
use crate::error::RuntimeError;
use crate::types::{SourceUnit, WorkerId};

/// One worker's guest runtime.
pub struct GuestRuntime {
    worker: WorkerId,
    guard: OwnerGuard,
    /// Rejected promises nobody has handled yet, with their reasons.
    rejections: Rc<RefCell<Vec<(Persistent<Value<'static>>, String)>>>,
    context: Context,
    runtime: Runtime,
    /// Pins the handle to the thread that created it.
    _not_send: PhantomData<Rc<()>>,
}

impl GuestRuntime {
    /// Allocate a runtime and context configured by `config`.
    pub fn create(
        worker: WorkerId,
        config: &EngineConfig,
        guard: OwnerGuard,
    ) -> Result<Self, RuntimeError> {
        let init = |reason: String| RuntimeError::Init { worker, reason };

        config.validate().map_err(init)?;

        let runtime = Runtime::new().map_err(|e| init(e.to_string()))?;
        if let Some(bytes) = config.memory_limit {
            runtime.set_memory_limit(bytes);
        }
        if let Some(bytes) = config.max_stack_size {
            runtime.set_max_stack_size(bytes);
        }
        if let Some(bytes) = config.gc_threshold {
            runtime.set_gc_threshold(bytes);
        }

        let rejections = Rc::new(RefCell::new(Vec::new()));
        track_rejections(&runtime, &rejections);

        let context = Context::full(&runtime).map_err(|e| init(e.to_string()))?;

        tracing::debug!("[{}] guest runtime created", worker);

        Ok(Self {
            worker,
            guard,
            rejections,
            context,
            runtime,
            _not_send: PhantomData,
        })
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// The thread this runtime is bound to.
    pub fn owner(&self) -> ThreadId {
        self.guard.owner()
    }

    /// Enter the context. Refused unless called on the owner thread.
    pub fn with<R>(
        &self,
        f: impl FnOnce(Ctx<'_>) -> Result<R, RuntimeError>,
    ) -> Result<R, RuntimeError> {
        self.guard.enter()?;
        self.context.with(f)
    }

    /// Evaluate a source unit as a global script, then run pending jobs.
    pub fn evaluate(&self, source: &SourceUnit) -> Result<(), RuntimeError> {
        tracing::debug!("[{}] evaluating {}", self.worker, source.name);
        self.with(|ctx| {
            let mut options = EvalOptions::default();
            options.global = true;
            options.strict = false;
            options.backtrace_barrier = true;

            ctx.eval_with_options::<Value, _>(source.text.as_str(), options)
                .catch(&ctx)
                .map(|_| ())
                .map_err(|e| RuntimeError::Script {
                    source_name: source.name.clone(),
                    message: e.to_string(),
                })
        })
    }

    /// Run queued promise jobs until none are left.
    ///
    /// Returns one message per job that threw and per promise left rejected
    /// without a handler once the queue is empty.
    pub fn drain_jobs(&self) -> Result<Vec<String>, RuntimeError> {
        self.guard.enter()?;
        let mut failures = Vec::new();
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(_) => failures.push("pending job threw".to_string()),
            }
        }
        let unhandled = std::mem::take(&mut *self.rejections.borrow_mut());
        failures.extend(
            unhandled
                .into_iter()
                .map(|(_, reason)| format!("unhandled promise rejection: {reason}")),
        );
        Ok(failures)
    }

    /// Run a garbage-collection cycle.
    pub fn gc(&self) -> Result<(), RuntimeError> {
        self.guard.enter()?;
        self.runtime.run_gc();
        Ok(())
    }
}

impl Drop for GuestRuntime {
    fn drop(&mut self) {
        // Saved promises must go before the runtime does.
        self.rejections.borrow_mut().clear();
        self.runtime.set_host_promise_rejection_tracker(None);
        tracing::debug!("[{}] guest runtime released", self.worker);
    }
}

/// Keep rejected promises until a handler is attached to them.
fn track_rejections(
    runtime: &Runtime,
    rejections: &Rc<RefCell<Vec<(Persistent<Value<'static>>, String)>>>,
) {
    let pending = rejections.clone();
    runtime.set_host_promise_rejection_tracker(Some(Box::new(
        move |_ctx: Ctx<'_>, promise: Value<'_>, reason: Value<'_>, is_handled: bool| {
            let ctx = promise.ctx().clone();
            let mut pending = pending.borrow_mut();
            if is_handled {
                pending.retain(|(saved, _)| {
                    saved.clone().restore(&ctx).map_or(true, |p| p != promise)
                });
            } else {
                pending.push((Persistent::save(&ctx, promise), describe_reason(&reason)));
            }
        },
    )));
}

/// Readable text for a thrown or rejected value.
pub(crate) fn describe_reason(reason: &Value<'_>) -> String {
    if let Some(exception) = reason.as_exception() {
        return exception.message().unwrap_or_else(|| "exception".to_string());
    }
    reason
        .get::<Coerced<String>>()
        .map(|text| text.0)
        .unwrap_or_else(|_| "unprintable value".to_string())
}
