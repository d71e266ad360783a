//! Timestamp formats used in request contexts

use chrono::{DateTime, Utc};

/// Format a timestamp in Common Log Format, e.g. `09/Apr/2015:12:34:56 +0000`
pub fn format_clf(time: &DateTime<Utc>) -> String {
    time.format("%d/%b/%Y:%H:%M:%S %z").to_string()
}
