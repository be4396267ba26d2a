//! The guest `host` object.
//!
//! `host` always exists; its members depend on the granted `Capabilities`.
//! Host failures are thrown into the guest as plain errors.

use std::process::Command;

use rquickjs::function::Opt;
use rquickjs::{Ctx, Exception, Function, Object, Result as JsResult};

use crate::bridge::{Bridge, Timers};
use crate::config::Capabilities;

/// Install `host` with one member group per granted capability.
pub(crate) fn register_host<'js>(
    ctx: &Ctx<'js>,
    capabilities: Capabilities,
    bridge: &Bridge,
    timers: Timers,
) -> JsResult<()> {
    let host = Object::new(ctx.clone())?;

    if capabilities.environment {
        register_environment(ctx, &host)?;
    }
    if capabilities.io {
        register_io(ctx, &host)?;
    }
    if capabilities.process {
        register_process(ctx, &host)?;
    }
    if capabilities.threads {
        bridge.install_timer(ctx, &host, timers)?;
    }

    ctx.globals().set("host", host)?;
    Ok(())
}

fn register_environment<'js>(ctx: &Ctx<'js>, host: &Object<'js>) -> JsResult<()> {
    host.set(
        "env",
        Function::new(ctx.clone(), |name: String| std::env::var(name).ok())?,
    )
}

fn register_io<'js>(ctx: &Ctx<'js>, host: &Object<'js>) -> JsResult<()> {
    host.set(
        "readTextFile",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, path: String| {
            std::fs::read_to_string(&path).map_err(|e| {
                Exception::throw_message(&ctx, &format!("readTextFile({path}): {e}"))
            })
        })?,
    )?;

    host.set(
        "writeTextFile",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, path: String, text: String| {
            std::fs::write(&path, text).map_err(|e| {
                Exception::throw_message(&ctx, &format!("writeTextFile({path}): {e}"))
            })
        })?,
    )
}

fn register_process<'js>(ctx: &Ctx<'js>, host: &Object<'js>) -> JsResult<()> {
    host.set(
        "exec",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, program: String, args: Opt<Vec<String>>| -> JsResult<Object<'js>> {
                let output = Command::new(&program)
                    .args(args.0.unwrap_or_default())
                    .output()
                    .map_err(|e| Exception::throw_message(&ctx, &format!("exec({program}): {e}")))?;

                let result = Object::new(ctx.clone())?;
                result.set("status", output.status.code())?;
                result.set("stdout", String::from_utf8_lossy(&output.stdout).into_owned())?;
                result.set("stderr", String::from_utf8_lossy(&output.stderr).into_owned())?;
                Ok(result)
            },
        )?,
    )
}
