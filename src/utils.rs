//! Utility functions and helpers

/// Get current timestamp in milliseconds
pub fn current_time_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Check if a string is a valid hex string
pub fn is_valid_hex(hex: &str) -> bool {
    !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit())
}
