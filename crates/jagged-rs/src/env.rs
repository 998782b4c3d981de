use std::env;
use std::sync::OnceLock;

static JAGGED_VALIDATE_INVARIANTS: OnceLock<bool> = OnceLock::new();
static JAGGED_LOG_METADATA: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn flag(name: &str) -> bool {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    }
}

pub(crate) fn validate_invariants_enabled() -> bool {
    *JAGGED_VALIDATE_INVARIANTS.get_or_init(|| flag("JAGGED_VALIDATE_INVARIANTS"))
}

pub(crate) fn log_metadata_enabled() -> bool {
    *JAGGED_LOG_METADATA.get_or_init(|| flag("JAGGED_LOG_METADATA"))
}
