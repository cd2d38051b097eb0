//! Small helpers shared across modules.

use std::borrow::Cow;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Expand a leading `~` to `$HOME` (`"~/data"` becomes `"/home/user/data"`).
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Cow::Owned(format!("{home}{}", &path[1..]));
        }
    }
    Cow::Borrowed(path)
}
