use crate::DeviceId;
use serde::Serialize;
use std::collections::VecDeque;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Ok,
    /// Stopped by the safe-mode interlock before any I/O.
    Blocked,
    Timeout,
    /// Failed catalog or argument validation before any I/O.
    Rejected,
    Failed,
}

/// One line of the operator-visible command log.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub device: DeviceId,
    pub command: String,
    pub args: Vec<String>,
    pub result: Option<Vec<String>>,
    pub error: Option<String>,
    pub outcome: ExecutionOutcome,
}

impl ExecutionRecord {
    pub fn summary(&self) -> String {
        let body = match (&self.result, &self.error) {
            (_, Some(err)) => format!("error: {err}"),
            (Some(lines), None) => lines.join(" | "),
            (None, None) => "-".to_string(),
        };
        let args = if self.args.is_empty() {
            String::new()
        } else {
            format!(" [{}]", self.args.join(", "))
        };
        format!("{} {}{} -> {}", self.device, self.command, args, body)
    }
}

/// Bounded ring of execution records; the oldest falls off first.
#[derive(Debug)]
pub struct ExecutionLog {
    records: VecDeque<ExecutionRecord>,
    capacity: usize,
}

impl ExecutionLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, record: ExecutionRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Up to `n` most recent records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<ExecutionRecord> {
        let skip = self.records.len().saturating_sub(n);
        self.records.iter().skip(skip).cloned().collect()
    }

    pub fn last(&self) -> Option<&ExecutionRecord> {
        self.records.back()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for ExecutionLog {
    fn default() -> Self {
        Self::new(500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(command: &str) -> ExecutionRecord {
        ExecutionRecord {
            at: OffsetDateTime::UNIX_EPOCH,
            device: DeviceId::from("gen"),
            command: command.to_string(),
            args: Vec::new(),
            result: None,
            error: None,
            outcome: ExecutionOutcome::Ok,
        }
    }

    #[test]
    fn oldest_records_fall_off() {
        let mut log = ExecutionLog::new(2);
        log.push(rec("a"));
        log.push(rec("b"));
        log.push(rec("c"));
        let names: Vec<_> = log.recent(10).into_iter().map(|r| r.command).collect();
        assert_eq!(names, ["b", "c"]);
        assert_eq!(log.last().map(|r| r.command.as_str()), Some("c"));
    }

    #[test]
    fn summary_shows_error_over_result() {
        let mut r = rec("setLoad");
        r.args = vec!["2.00".into()];
        r.error = Some("blocked".into());
        assert_eq!(r.summary(), "gen setLoad [2.00] -> error: blocked");
    }

    #[test]
    fn record_serializes_with_rfc3339_time() {
        let json = serde_json::to_value(rec("ping")).unwrap();
        assert_eq!(json["at"], "1970-01-01T00:00:00Z");
        assert_eq!(json["outcome"], "ok");
    }
}
