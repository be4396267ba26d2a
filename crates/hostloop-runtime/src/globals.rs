//! Guest `console` object.
//!
//! Console output is forwarded to `tracing` under the `hostloop::guest` target,
//! tagged with the worker that produced it.

use rquickjs::convert::Coerced;
use rquickjs::function::Rest;
use rquickjs::{Ctx, Function, Object, Result as JsResult};

use crate::types::WorkerId;

fn join(args: Rest<Coerced<String>>) -> String {
    args.0
        .into_iter()
        .map(|arg| arg.0)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Register the console object with log, info, warn, error and debug methods.
pub fn register_console(ctx: &Ctx<'_>, worker: WorkerId) -> JsResult<()> {
    let globals = ctx.globals();
    let console = Object::new(ctx.clone())?;

    console.set(
        "log",
        Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
            tracing::info!(target: "hostloop::guest", worker = %worker, "{}", join(args));
        })?,
    )?;

    console.set(
        "info",
        Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
            tracing::info!(target: "hostloop::guest", worker = %worker, "{}", join(args));
        })?,
    )?;

    console.set(
        "warn",
        Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
            tracing::warn!(target: "hostloop::guest", worker = %worker, "{}", join(args));
        })?,
    )?;

    console.set(
        "error",
        Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
            tracing::error!(target: "hostloop::guest", worker = %worker, "{}", join(args));
        })?,
    )?;

    console.set(
        "debug",
        Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
            tracing::debug!(target: "hostloop::guest", worker = %worker, "{}", join(args));
        })?,
    )?;

    globals.set("console", console)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    #[test]
    fn test_register_console() {
        let runtime = Runtime::new().unwrap();
        let ctx = Context::full(&runtime).unwrap();

        ctx.with(|ctx| {
            register_console(&ctx, WorkerId(0)).unwrap();

            let console: Object = ctx.globals().get("console").unwrap();
            let _log: Function = console.get("log").unwrap();
            let _debug: Function = console.get("debug").unwrap();
        });
    }

    #[test]
    fn test_console_coerces_arguments() {
        let runtime = Runtime::new().unwrap();
        let ctx = Context::full(&runtime).unwrap();

        ctx.with(|ctx| {
            register_console(&ctx, WorkerId(1)).unwrap();

            // Non-string arguments must not throw.
            let _: rquickjs::Value = ctx
                .eval("console.log('a + b:', 1000 + 2000, { x: 1 }, null, undefined)")
                .unwrap();
        });
    }
}
