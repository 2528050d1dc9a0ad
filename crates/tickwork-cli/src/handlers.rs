use serde_json::{json, Value};
use tickwork_scheduler::HandlerRegistry;
use tracing::info;

/// Names every `tickwork` process can execute out of the box.
pub const BUILTIN_HANDLERS: &[&str] = &[
    "consoleHandler",
    "emailHandler",
    "defaultHandler",
    "failingHandler",
];

/// Register the built-in handlers.
///
/// These only log their payload; real deployments embed the library and
/// register their own.
pub fn register_builtins(registry: &HandlerRegistry) -> tickwork_scheduler::Result<()> {
    registry.register_fn("consoleHandler", |data: Value| async move {
        info!(%data, "job executed");
        anyhow::Ok(json!({ "printed": true }))
    })?;

    registry.register_fn("emailHandler", |data: Value| async move {
        let to = data
            .get("to")
            .and_then(Value::as_str)
            .unwrap_or("nobody@example.com")
            .to_string();
        info!(%to, %data, "sending email");
        anyhow::Ok(json!({ "sent_to": to }))
    })?;

    registry.register_fn("defaultHandler", |data: Value| async move {
        info!(%data, "default handler");
        anyhow::Ok(Value::Null)
    })?;

    // Always fails; handy for watching retry accounting from the CLI.
    registry.register_fn("failingHandler", |data: Value| async move {
        let reason = data
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("failing on purpose")
            .to_string();
        Err::<Value, _>(anyhow::anyhow!(reason))
    })?;

    Ok(())
}

pub fn is_builtin(name: &str) -> bool {
    BUILTIN_HANDLERS.contains(&name)
}
