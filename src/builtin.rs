//! Handlers compiled into the `isofork` binary.
//!
//! | Name         | Behaviour                                              |
//! |--------------|--------------------------------------------------------|
//! | `echo`       | `{ "request": <arg0>, "response": "ok" }`              |
//! | `echo_async` | same as `echo`, from an async handler                  |
//! | `sleep`      | waits `<arg0>` milliseconds, returns the waited time   |
//! | `sum`        | sum of all numeric arguments                           |
//! | `fail`       | rejects with `<arg0>` (or `options.error`)             |
//! | `panic`      | panics with `<arg0>` as message                        |
//! | `exit`       | terminates the worker process with code `<arg0>`       |

use crate::module::HandlerTable;
use serde_json::{Value, json};
use std::time::Duration;

fn first(params: &[Value]) -> Value {
    params.first().cloned().unwrap_or(Value::Null)
}

fn echo(params: &[Value]) -> Value {
    json!({ "request": first(params), "response": "ok" })
}

fn sum(params: &[Value]) -> Result<Value, Value> {
    let mut total = 0.0;
    for (index, param) in params.iter().enumerate() {
        let n = param
            .as_f64()
            .ok_or_else(|| json!({ "message": format!("argument {} is not a number", index) }))?;
        total += n;
    }
    if total.fract() == 0.0 && total.abs() < (1u64 << 53) as f64 {
        Ok(json!(total as i64))
    } else {
        Ok(json!(total))
    }
}

fn failure(params: &[Value], options: &Value) -> Value {
    match params.first() {
        Some(error) => error.clone(),
        None => options
            .get("error")
            .cloned()
            .unwrap_or_else(|| json!({ "message": "failed" })),
    }
}

/// The built-in handler table.
pub fn handlers() -> HandlerTable {
    HandlerTable::new()
        .sync("echo", |params, _| Ok(echo(&params)))
        .asynchronous("echo_async", |params, _| async move {
            tokio::task::yield_now().await;
            Ok(echo(&params))
        })
        .asynchronous("sleep", |params, _| async move {
            let ms = params.first().and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!(ms))
        })
        .sync("sum", |params, _| sum(&params))
        .sync("fail", |params, options| Err(failure(&params, options)))
        .sync("panic", |params, _| {
            let message = match first(&params) {
                Value::String(s) => s,
                Value::Null => "panic handler invoked".to_string(),
                other => other.to_string(),
            };
            panic!("{}", message)
        })
        .sync("exit", |params, _| {
            let code = params.first().and_then(Value::as_i64).unwrap_or(1);
            std::process::exit(code as i32)
        })
}
