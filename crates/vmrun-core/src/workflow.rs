//! GitHub Actions workflow commands.
//!
//! The runner parses `::group::`, `::endgroup::` and `::error::` lines from
//! stdout. Everything else vmrun logs goes through `tracing` on stderr.

use std::io::Write;

/// Escape a message for a workflow command payload.
pub fn escape_data(message: &str) -> String {
    message
        .replace('%', "%25")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

/// Mark the run failed with `message` as the annotation.
pub fn error_annotation(message: &str) {
    println!("::error::{}", escape_data(message));
}

/// Collapsible log group, closed when the guard drops.
#[must_use = "the group closes as soon as the guard is dropped"]
pub struct LogGroup {
    _private: (),
}

/// Open a log group titled `title`.
pub fn group(title: &str) -> LogGroup {
    println!("::group::{}", escape_data(title));
    let _ = std::io::stdout().flush();
    LogGroup { _private: () }
}

impl Drop for LogGroup {
    fn drop(&mut self) {
        println!("::endgroup::");
        let _ = std::io::stdout().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escapes_multiline_messages() {
        assert_eq!(
            escape_data("100% failed\nsee log\r"),
            "100%25 failed%0Asee log%0D"
        );
    }

    #[test]
    fn test_group_guard_opens_and_closes() {
        let guard = group("Run 'run' in VM");
        drop(guard);
    }
}
