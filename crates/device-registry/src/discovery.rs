use crate::invoker::with_deadline;
use crate::{parse_signature, CommandCatalog, DeviceError, Result};
use line_transport::LineTransport;
use std::time::Duration;
use tokio::time::Instant;

/// Token that asks a device to enumerate its commands.
pub const ENUMERATE_COMMAND: &str = "list";
/// Line a device sends after its last signature.
pub const END_OF_CATALOG: &str = "eoc";

/// Limits for the enumerate handshake.
#[derive(Debug, Clone)]
pub struct DiscoveryPolicy {
    /// Consecutive blank reads tolerated before giving up.
    pub max_blank_reads: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Bound on the whole handshake.
    pub overall_deadline: Duration,
    /// Bound on each single read.
    pub read_deadline: Duration,
}

impl Default for DiscoveryPolicy {
    fn default() -> Self {
        Self {
            max_blank_reads: 8,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(400),
            overall_deadline: Duration::from_secs(10),
            read_deadline: Duration::from_millis(3000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryOutcome {
    pub catalog: CommandCatalog,
    /// True when the sentinel was seen.
    pub complete: bool,
    /// Lines that did not parse as signatures.
    pub skipped: Vec<String>,
}

/// Run the enumerate handshake on a freshly opened line.
///
/// Each announced signature is acknowledged by echoing its bare name, which
/// prompts the device for the next one. Blank reads back off exponentially;
/// after too many in a row, or once the overall deadline passes, whatever was
/// collected so far is returned with `complete == false`.
pub async fn discover(line: &mut dyn LineTransport, policy: &DiscoveryPolicy) -> Result<DiscoveryOutcome> {
    let started = Instant::now();
    let port = line.port_name().to_string();

    with_deadline(|| "clear input".to_string(), policy.read_deadline, line.clear_input()).await?;
    with_deadline(
        || format!("write {ENUMERATE_COMMAND}"),
        policy.read_deadline,
        line.write_line(ENUMERATE_COMMAND),
    )
    .await?;

    let mut catalog = CommandCatalog::default();
    let mut skipped = Vec::new();
    let mut blanks = 0u32;
    let mut backoff = policy.initial_backoff;

    loop {
        let remaining = policy.overall_deadline.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            tracing::warn!(port = %port, commands = catalog.len(), "discovery deadline passed; keeping partial catalog");
            return Ok(DiscoveryOutcome { catalog, complete: false, skipped });
        }

        let read_bound = policy.read_deadline.min(remaining);
        let text = match with_deadline(|| "read signature".to_string(), read_bound, line.read_line()).await {
            Ok(text) => text,
            Err(DeviceError::ProtocolTimeout { .. }) => String::new(),
            Err(e) => return Err(e),
        };
        let text = text.trim();

        if text.is_empty() {
            blanks += 1;
            if blanks >= policy.max_blank_reads {
                tracing::warn!(port = %port, blanks, commands = catalog.len(), "device stopped answering; keeping partial catalog");
                return Ok(DiscoveryOutcome { catalog, complete: false, skipped });
            }
            let remaining = policy.overall_deadline.saturating_sub(started.elapsed());
            tokio::time::sleep(backoff.min(remaining)).await;
            backoff = (backoff * 2).min(policy.max_backoff);
            continue;
        }
        blanks = 0;
        backoff = policy.initial_backoff;

        if text == END_OF_CATALOG {
            tracing::debug!(port = %port, commands = catalog.len(), "catalog complete");
            return Ok(DiscoveryOutcome { catalog, complete: true, skipped });
        }

        match parse_signature(text) {
            Ok(cmd) => {
                let name = cmd.name.clone();
                catalog.insert(cmd);
                with_deadline(|| format!("echo {name}"), policy.read_deadline, line.write_line(&name)).await?;
            }
            Err(e) => {
                tracing::warn!(port = %port, line = text, error = %e, "skipping malformed signature");
                skipped.push(text.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use line_transport::{MockFirmware, MockLine};

    fn quick() -> DiscoveryPolicy {
        DiscoveryPolicy {
            max_blank_reads: 4,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            overall_deadline: Duration::from_secs(2),
            read_deadline: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn firmware_catalog_is_collected_in_order() {
        let fw = MockFirmware::new(["getPower>1", "setLoad<1", "stop"]);
        let (mut line, handle) = MockLine::with_firmware("gen", fw);
        let out = discover(&mut line, &quick()).await.unwrap();
        assert!(out.complete);
        let names: Vec<_> = out.catalog.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["getPower", "setLoad", "stop"]);
        assert_eq!(handle.outbound(), ["list", "getPower", "setLoad", "stop"]);
    }

    #[tokio::test]
    async fn blank_reads_are_retried() {
        let (mut line, handle) = MockLine::new("pv");
        handle.reply_on_next_write(["", "", "getVoltage>1", "", "eoc"]);
        let out = discover(&mut line, &quick()).await.unwrap();
        assert!(out.complete);
        assert_eq!(out.catalog.len(), 1);
        assert_eq!(handle.outbound(), ["list", "getVoltage"]);
    }

    #[tokio::test]
    async fn silence_yields_partial_catalog() {
        let (mut line, handle) = MockLine::new("wind");
        handle.reply_on_next_write(["getPower>1"]);
        let out = discover(&mut line, &quick()).await.unwrap();
        assert!(!out.complete);
        assert_eq!(out.catalog.len(), 1);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_not_echoed() {
        let (mut line, handle) = MockLine::new("fan");
        handle.reply_on_next_write(["set<x", "setSpeed<1", "eoc"]);
        let out = discover(&mut line, &quick()).await.unwrap();
        assert!(out.complete);
        assert_eq!(out.skipped, ["set<x"]);
        assert!(out.catalog.contains("setSpeed"));
        assert_eq!(handle.outbound(), ["list", "setSpeed"]);
    }

    #[tokio::test]
    async fn stalled_reads_count_as_blanks() {
        let (mut line, handle) = MockLine::new("gen");
        handle.set_stall_reads(true);
        let policy = DiscoveryPolicy {
            read_deadline: Duration::from_millis(10),
            ..quick()
        };
        let out = discover(&mut line, &policy).await.unwrap();
        assert!(!out.complete);
        assert!(out.catalog.is_empty());
    }

    #[tokio::test]
    async fn input_pending_before_the_handshake_is_flushed() {
        let (mut line, handle) = MockLine::new("gen");
        handle.push_inbound(["stale>1"]);
        handle.reply_on_next_write(["getPower>1", "eoc"]);
        let out = discover(&mut line, &quick()).await.unwrap();
        assert!(out.complete);
        assert!(!out.catalog.contains("stale"));
        assert!(out.catalog.contains("getPower"));
    }

    #[tokio::test(start_paused = true)]
    async fn overall_deadline_bounds_a_pending_read() {
        let (mut line, handle) = MockLine::new("gen");
        handle.set_stall_reads(true);
        let policy = DiscoveryPolicy {
            overall_deadline: Duration::from_millis(100),
            read_deadline: Duration::from_millis(500),
            ..quick()
        };
        let started = Instant::now();
        let out = discover(&mut line, &policy).await.unwrap();
        assert!(!out.complete);
        assert!(started.elapsed() <= Duration::from_millis(110), "took {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn closed_line_is_an_error() {
        let (mut line, handle) = MockLine::new("gen");
        handle.close();
        let err = discover(&mut line, &quick()).await.unwrap_err();
        assert!(matches!(err, DeviceError::Transport(_)));
    }
}
