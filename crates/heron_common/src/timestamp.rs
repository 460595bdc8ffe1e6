//! Backup timestamp keys.
//!
//! Every backup set is keyed by the 14-digit local wall-clock instant at
//! which it started, `YYYYMMDDhhmmss`. The key doubles as the history
//! database primary key and as the backup directory name.

use chrono::Local;

/// Format of a backup timestamp key.
const TIMESTAMP_LEN: usize = 14;

/// Current local time as a backup timestamp key.
pub fn current_timestamp() -> String {
    Local::now().format("%Y%m%d%H%M%S").to_string()
}

/// Returns true when `s` is a well-formed 14-digit timestamp key.
pub fn is_valid_timestamp(s: &str) -> bool {
    s.len() == TIMESTAMP_LEN && s.bytes().all(|b| b.is_ascii_digit())
}
