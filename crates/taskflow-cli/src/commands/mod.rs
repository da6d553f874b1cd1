//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and drives the
//! taskflow-core engine through `AppState`.

pub mod step;
pub mod template;
pub mod workflow;

use std::sync::Arc;

use taskflow_core::state::AppState;
use taskflow_core::workflow::{AgentRegistry, EchoAgent};
use taskflow_core::EngineConfig;

/// Build the shared `AppState` for the given database path, or exit.
///
/// Engine settings come from `TASKFLOW_*` environment variables; `echo_kinds`
/// are answered by the built-in echo agent.
pub fn init_state(db_path: &str, echo_kinds: &[String]) -> AppState {
    let config = EngineConfig {
        db_path: db_path.to_string(),
        ..EngineConfig::from_env()
    };
    tracing::debug!("[CLI] Opening {} with echo agents {:?}", db_path, echo_kinds);
    taskflow_core::create_app_state(config, echo_registry(echo_kinds)).unwrap_or_else(|e| {
        eprintln!("Failed to open database '{}': {}", db_path, e);
        std::process::exit(1);
    })
}

/// Registry with `EchoAgent` behind every non-empty kind.
pub fn echo_registry(kinds: &[String]) -> AgentRegistry {
    let echo = Arc::new(EchoAgent);
    let mut registry = AgentRegistry::new();
    for kind in kinds.iter().map(|k| k.trim()).filter(|k| !k.is_empty()) {
        registry.register(kind, echo.clone());
    }
    registry
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

/// Parse a `--input` style argument; must be a JSON object.
pub fn parse_json_object(raw: &str) -> Result<serde_json::Value, String> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| format!("Invalid JSON input: {}", e))?;
    if !value.is_object() {
        return Err("Input must be a JSON object".to_string());
    }
    Ok(value)
}
