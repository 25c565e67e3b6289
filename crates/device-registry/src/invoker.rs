use crate::{CommandCatalog, CommandDescriptor, DeviceError, Result};
use line_transport::LineTransport;
use std::future::Future;
use std::time::Duration;

/// Run one transport operation under a deadline, labelling the timeout.
pub(crate) async fn with_deadline<T, F>(op: impl FnOnce() -> String, deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = line_transport::Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(res) => res.map_err(DeviceError::from),
        Err(_) => Err(DeviceError::ProtocolTimeout {
            op: op(),
            after: deadline,
        }),
    }
}

#[derive(Debug, Clone)]
pub struct InvokerConfig {
    /// Bound on each transport operation.
    pub deadline: Duration,
    /// Pause between outbound lines so firmware can drain its buffer.
    pub arg_delay: Duration,
    /// Pause after a blank read while waiting for a response line.
    pub blank_pause: Duration,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_millis(3000),
            arg_delay: Duration::from_millis(20),
            blank_pause: Duration::from_millis(10),
        }
    }
}

/// Encodes one command call and decodes its declared outputs.
#[derive(Debug, Clone, Default)]
pub struct Invoker {
    config: InvokerConfig,
}

impl Invoker {
    pub fn new(config: InvokerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InvokerConfig {
        &self.config
    }

    /// Same invoker with a different per-operation deadline.
    pub fn with_deadline(&self, deadline: Duration) -> Self {
        let mut config = self.config.clone();
        config.deadline = deadline;
        Self { config }
    }

    /// Look `name` up in `catalog` and run it. Unknown names fail without I/O.
    pub async fn call(
        &self,
        line: &mut dyn LineTransport,
        catalog: &CommandCatalog,
        name: &str,
        args: &[String],
    ) -> Result<Option<Vec<String>>> {
        let command = catalog
            .get(name)
            .ok_or_else(|| DeviceError::UnknownCommand {
                command: name.to_string(),
            })?;
        self.invoke(line, command, args).await
    }

    /// Send the name, then each argument on its own line, then read exactly
    /// `output_arity` lines. Returns `None` when the command declares no output.
    pub async fn invoke(
        &self,
        line: &mut dyn LineTransport,
        command: &CommandDescriptor,
        args: &[String],
    ) -> Result<Option<Vec<String>>> {
        check_arity(command, args)?;
        let deadline = self.config.deadline;
        let name = command.name.as_str();

        with_deadline(|| format!("write {name}"), deadline, line.write_line(name)).await?;
        if command.is_bare() {
            return Ok(None);
        }

        for (i, arg) in args.iter().enumerate() {
            if !self.config.arg_delay.is_zero() {
                tokio::time::sleep(self.config.arg_delay).await;
            }
            with_deadline(
                || format!("write arg {} of {name}", i + 1),
                deadline,
                line.write_line(arg),
            )
            .await?;
        }

        if command.output_arity == 0 {
            return Ok(None);
        }
        let mut out = Vec::with_capacity(command.output_arity);
        for i in 0..command.output_arity {
            let label = || format!("read {} of {name}", i + 1);
            let text = with_deadline(label, deadline, self.read_response(line)).await?;
            out.push(text);
        }
        tracing::trace!(command = name, lines = out.len(), "response read");
        Ok(Some(out))
    }

    /// Next non-blank inbound line.
    async fn read_response(&self, line: &mut dyn LineTransport) -> line_transport::Result<String> {
        loop {
            let text = line.read_line().await?;
            if !text.is_empty() {
                return Ok(text);
            }
            tokio::time::sleep(self.config.blank_pause).await;
        }
    }
}

/// Argument count must match the declared input arity.
pub(crate) fn check_arity(command: &CommandDescriptor, args: &[String]) -> Result<()> {
    if args.len() != command.input_arity {
        return Err(DeviceError::Validation(format!(
            "`{}` takes {} argument(s), got {}",
            command.name,
            command.input_arity,
            args.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use line_transport::{MockFirmware, MockLine};

    fn fast() -> Invoker {
        Invoker::new(InvokerConfig {
            deadline: Duration::from_millis(200),
            arg_delay: Duration::ZERO,
            blank_pause: Duration::from_millis(1),
        })
    }

    #[tokio::test]
    async fn bare_command_writes_one_line_and_returns_none() {
        let catalog = CommandCatalog::from_signatures(["stop"]).unwrap();
        let (mut line, handle) = MockLine::new("gen");
        let out = fast().call(&mut line, &catalog, "stop", &[]).await.unwrap();
        assert_eq!(out, None);
        assert_eq!(handle.outbound(), ["stop"]);
        assert_eq!(handle.reads(), 0);
    }

    #[tokio::test]
    async fn one_in_one_out_writes_two_lines_reads_one() {
        let catalog = CommandCatalog::from_signatures(["scale>1<1"]).unwrap();
        let (mut line, handle) = MockLine::new("fan");
        handle.push_inbound(["84", "extra"]);
        let out = fast()
            .call(&mut line, &catalog, "scale", &["42".to_string()])
            .await
            .unwrap();
        assert_eq!(out, Some(vec!["84".to_string()]));
        assert_eq!(handle.outbound(), ["scale", "42"]);
        assert_eq!(handle.reads(), 1);
        assert_eq!(handle.pending_inbound(), 1);
    }

    #[tokio::test]
    async fn input_only_command_returns_none() {
        let fw = MockFirmware::new(["setLoad<1"]);
        let catalog = CommandCatalog::from_signatures(["setLoad<1"]).unwrap();
        let (mut line, handle) = MockLine::with_firmware("gen", fw);
        let out = fast()
            .call(&mut line, &catalog, "setLoad", &["2.50".to_string()])
            .await
            .unwrap();
        assert_eq!(out, None);
        assert_eq!(handle.args_for("setLoad"), vec![vec!["2.50".to_string()]]);
        assert_eq!(handle.reads(), 0);
    }

    #[tokio::test]
    async fn blank_lines_are_skipped_while_reading() {
        let catalog = CommandCatalog::from_signatures(["readAll>2"]).unwrap();
        let (mut line, handle) = MockLine::new("pv");
        handle.push_inbound(["", "12.1", "", "300"]);
        let out = fast().call(&mut line, &catalog, "readAll", &[]).await.unwrap();
        assert_eq!(out, Some(vec!["12.1".to_string(), "300".to_string()]));
    }

    #[tokio::test]
    async fn unknown_command_does_no_io() {
        let catalog = CommandCatalog::from_signatures(["ping"]).unwrap();
        let (mut line, handle) = MockLine::new("gen");
        let err = fast().call(&mut line, &catalog, "pong", &[]).await.unwrap_err();
        assert!(matches!(err, DeviceError::UnknownCommand { .. }));
        assert!(handle.outbound().is_empty());
        assert_eq!(handle.reads(), 0);
    }

    #[tokio::test]
    async fn wrong_argument_count_is_rejected_before_io() {
        let catalog = CommandCatalog::from_signatures(["setLoad<1"]).unwrap();
        let (mut line, handle) = MockLine::new("gen");
        let err = fast().call(&mut line, &catalog, "setLoad", &[]).await.unwrap_err();
        assert!(matches!(err, DeviceError::Validation(_)));
        assert!(handle.outbound().is_empty());
    }

    #[tokio::test]
    async fn stalled_read_times_out_with_label() {
        let catalog = CommandCatalog::from_signatures(["getPower>1"]).unwrap();
        let (mut line, handle) = MockLine::new("gen");
        handle.set_stall_reads(true);
        let err = fast().call(&mut line, &catalog, "getPower", &[]).await.unwrap_err();
        match err {
            DeviceError::ProtocolTimeout { op, after } => {
                assert_eq!(op, "read 1 of getPower");
                assert_eq!(after, Duration::from_millis(200));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
