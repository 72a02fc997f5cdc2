use std::env;
use std::sync::OnceLock;

static GRAPHRT_PASS_STATS: OnceLock<bool> = OnceLock::new();

pub(crate) const PROFILE_VAR: &str = "GRAPHRT_PROFILE";
pub(crate) const THREADS_VAR: &str = "GRAPHRT_THREADS";
pub(crate) const PASS_STATS_VAR: &str = "GRAPHRT_PASS_STATS";

pub(crate) fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// `None` when the variable is unset or blank.
pub(crate) fn env_bool(name: &str) -> Option<bool> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(parse_bool(&value)),
        _ => None,
    }
}

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok()?.trim().parse().ok()
}

pub(crate) fn pass_stats_enabled() -> bool {
    *GRAPHRT_PASS_STATS.get_or_init(|| env_bool(PASS_STATS_VAR).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn truthy_values() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_bool(value), "{value}");
        }
        for value in ["0", "off", "nope", ""] {
            assert!(!parse_bool(value), "{value}");
        }
    }
}
