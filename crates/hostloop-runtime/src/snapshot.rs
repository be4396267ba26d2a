//! Copy-on-capture for bridge arguments.
//!
//! `capture_args` walks guest values and copies them into `GuestValue`s before
//! anything is scheduled. `hydrate_args` builds fresh guest values from a
//! snapshot when the deferred call runs, so the callee never shares an object
//! with the call site.

use std::cell::OnceCell;

use rquickjs::{Array, Ctx, IntoJs, Object, Type, Value};

use guest_types::{ArgSnapshot, GuestValue, SnapshotError};

/// Largest integer a guest number holds exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Copy an argument vector out of the guest heap.
pub fn capture_args<'js>(
    values: &[Value<'js>],
    max_depth: usize,
) -> Result<ArgSnapshot, SnapshotError> {
    let walker = Walker::new(max_depth);
    values.iter().map(|value| walker.capture(value, 0)).collect()
}

/// Copy one guest value out of the guest heap.
pub fn capture_value<'js>(
    value: &Value<'js>,
    max_depth: usize,
) -> Result<GuestValue, SnapshotError> {
    Walker::new(max_depth).capture(value, 0)
}

/// One capture pass. Only plain objects are copied; anything with a class
/// (`Map`, `Date`, typed arrays, instances) would lose its state.
struct Walker<'js> {
    limit: usize,
    /// `Object.prototype`, looked up on the first object met.
    plain: OnceCell<Option<Object<'js>>>,
}

impl<'js> Walker<'js> {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            plain: OnceCell::new(),
        }
    }

    fn capture(&self, value: &Value<'js>, depth: usize) -> Result<GuestValue, SnapshotError> {
        let read = |e: rquickjs::Error| SnapshotError::Read(e.to_string());
        let mismatch = || {
            let kind = value.type_of();
            SnapshotError::Read(format!("value changed type while reading ({kind:?})"))
        };
        let limit = self.limit;

        match value.type_of() {
            Type::Undefined => Ok(GuestValue::Undefined),
            Type::Null => Ok(GuestValue::Null),
            Type::Bool => value.as_bool().map(GuestValue::Bool).ok_or_else(mismatch),
            Type::Int => value
                .as_int()
                .map(|i| GuestValue::Int(i64::from(i)))
                .ok_or_else(mismatch),
            Type::Float => value.as_float().map(normalize_number).ok_or_else(mismatch),
            Type::String => {
                let s = value.as_string().ok_or_else(mismatch)?;
                Ok(GuestValue::String(s.to_string().map_err(read)?))
            }
            Type::Array => {
                if depth >= limit {
                    return Err(SnapshotError::TooDeep { limit });
                }
                let array = value.as_array().ok_or_else(mismatch)?;
                let mut items = Vec::with_capacity(array.len());
                for item in array.iter::<Value>() {
                    items.push(self.capture(&item.map_err(read)?, depth + 1)?);
                }
                Ok(GuestValue::Array(items))
            }
            Type::Object => {
                let object = value.as_object().ok_or_else(mismatch)?;
                if !self.is_plain(object).map_err(read)? {
                    return Err(SnapshotError::Unsupported {
                        kind: class_name(object),
                    });
                }
                if depth >= limit {
                    return Err(SnapshotError::TooDeep { limit });
                }
                let mut fields = Vec::new();
                for prop in object.props::<String, Value>() {
                    let (key, item) = prop.map_err(read)?;
                    fields.push((key, self.capture(&item, depth + 1)?));
                }
                Ok(GuestValue::Object(fields))
            }
            other => Err(SnapshotError::Unsupported {
                kind: format!("{other:?}").to_lowercase(),
            }),
        }
    }

    /// Prototype is `Object.prototype` or `null`.
    fn is_plain(&self, object: &Object<'js>) -> rquickjs::Result<bool> {
        let Some(proto) = object.get_prototype() else {
            return Ok(true);
        };
        let plain = match self.plain.get() {
            Some(plain) => plain,
            None => {
                // A fresh literal reaches the real prototype even if the
                // guest has replaced the global `Object`.
                let fresh = Object::new(object.ctx().clone())?;
                self.plain.get_or_init(|| fresh.get_prototype())
            }
        };
        Ok(plain.as_ref().is_some_and(|plain| plain.as_value() == proto.as_value()))
    }
}

/// Constructor name of a non-plain object, for error messages.
fn class_name(object: &Object<'_>) -> String {
    object
        .get::<_, Object>("constructor")
        .and_then(|ctor| ctor.get::<_, String>("name"))
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "class instance".to_string())
}

/// Integral floats in the exact range compare equal to ints on the guest side,
/// so they are stored as ints. `-0.0` stays a float.
fn normalize_number(f: f64) -> GuestValue {
    if f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER && !(f == 0.0 && f.is_sign_negative()) {
        GuestValue::Int(f as i64)
    } else {
        GuestValue::Float(f)
    }
}

/// Build fresh guest values for a snapshot.
pub fn hydrate_args<'js>(ctx: &Ctx<'js>, args: &ArgSnapshot) -> rquickjs::Result<Vec<Value<'js>>> {
    args.iter().map(|value| hydrate_value(ctx, value)).collect()
}

/// Build a fresh guest value.
pub fn hydrate_value<'js>(ctx: &Ctx<'js>, value: &GuestValue) -> rquickjs::Result<Value<'js>> {
    let hydrated = match value {
        GuestValue::Undefined => Value::new_undefined(ctx.clone()),
        GuestValue::Null => Value::new_null(ctx.clone()),
        GuestValue::Bool(b) => Value::new_bool(ctx.clone(), *b),
        GuestValue::Int(i) => match i32::try_from(*i) {
            Ok(small) => Value::new_int(ctx.clone(), small),
            Err(_) => Value::new_float(ctx.clone(), *i as f64),
        },
        GuestValue::Float(f) => Value::new_float(ctx.clone(), *f),
        GuestValue::String(s) => s.as_str().into_js(ctx)?,
        GuestValue::Array(items) => {
            let array = Array::new(ctx.clone())?;
            for (i, item) in items.iter().enumerate() {
                array.set(i, hydrate_value(ctx, item)?)?;
            }
            array.into_value()
        }
        GuestValue::Object(fields) => {
            let object = Object::new(ctx.clone())?;
            for (key, item) in fields {
                object.set(key.as_str(), hydrate_value(ctx, item)?)?;
            }
            object.into_value()
        }
    };
    Ok(hydrated)
}
