use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkerLevel {
    Info,
    Warning,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkerKind {
    ProcessStarted,
    ProcessExited,
    ToolError,
    /// Reserved for user annotations supplied from outside the core.
    Annotation,
}

/// A string-labeled, time-stamped event attached to a `Run` (spec.md §3.1).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Marker {
    pub id: Option<i64>,
    pub run_id: i64,
    pub timestamp: i64,
    pub kind: MarkerKind,
    pub level: MarkerLevel,
    pub label: String,
}

impl Marker {
    pub fn process_started(run_id: i64, timestamp: i64, name: &str, pid: u32) -> Self {
        Marker {
            id: None,
            run_id,
            timestamp,
            kind: MarkerKind::ProcessStarted,
            level: MarkerLevel::Info,
            label: format!("Process {} (PID {}) started.", name, pid),
        }
    }

    pub fn process_exited(run_id: i64, timestamp: i64, name: &str, pid: u32, code: Option<i32>) -> Self {
        let label = match code {
            Some(code) => format!("Process {} (PID {}) exited with code {}.", name, pid, code),
            None => format!("Process {} (PID {}) exited.", name, pid),
        };
        Marker {
            id: None,
            run_id,
            timestamp,
            kind: MarkerKind::ProcessExited,
            level: MarkerLevel::Info,
            label,
        }
    }

    pub fn tool_error(run_id: i64, timestamp: i64, label: impl Into<String>) -> Self {
        Marker {
            id: None,
            run_id,
            timestamp,
            kind: MarkerKind::ToolError,
            level: MarkerLevel::Error,
            label: label.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_marker_formats_with_code() {
        let m = Marker::process_exited(1, 100, "child", 42, Some(0));
        assert_eq!(m.label, "Process child (PID 42) exited with code 0.");
    }

    #[test]
    fn exit_marker_formats_without_code() {
        let m = Marker::process_exited(1, 100, "child", 42, None);
        assert_eq!(m.label, "Process child (PID 42) exited.");
    }

    #[test]
    fn start_marker_format() {
        let m = Marker::process_started(1, 100, "child", 42);
        assert_eq!(m.label, "Process child (PID 42) started.");
    }
}
