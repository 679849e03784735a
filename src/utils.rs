use std::env;

/// Get the per-connection schema cache bound, from environment or default
///
/// Reads `PVARS_FIELD_CACHE_LIMIT`. The floor keeps a misconfigured
/// environment from disabling caching outright; the ceiling is the id space
/// of the wire encoding.
pub fn get_default_field_cache_limit() -> usize {
    env::var("PVARS_FIELD_CACHE_LIMIT")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(1024)
        .clamp(16, u16::MAX as usize)
}
