use crate::types::{check_outbound, trim_line};
use crate::{LineTransport, PortInfo, PortLister, Result, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Token the simulated firmware answers with its command list.
const ENUMERATE: &str = "list";
/// Sentinel closing an enumeration.
const END_OF_CATALOG: &str = "eoc";

/// In-process stand-in for a serial port. Each instance is independent.
///
/// Inbound lines come from a scripted queue and, optionally, from a
/// [`MockFirmware`] reacting to outbound lines. Everything written is recorded
/// and can be inspected through the paired [`MockHandle`].
pub struct MockLine {
    name: String,
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    inbound: VecDeque<String>,
    outbound: Vec<String>,
    reads: usize,
    stall_reads: bool,
    read_delay: Option<Duration>,
    closed: bool,
    firmware: Option<MockFirmware>,
    /// Batches released into `inbound` one per write, after the firmware reply.
    on_write: VecDeque<Vec<String>>,
}

/// Test-side view of a [`MockLine`] that stays valid after the line is moved.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockLine {
    pub fn new(name: &str) -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                name: name.to_string(),
                state: state.clone(),
            },
            MockHandle { state },
        )
    }

    /// A line whose inbound side is driven by simulated firmware.
    pub fn with_firmware(name: &str, firmware: MockFirmware) -> (Self, MockHandle) {
        let (line, handle) = Self::new(name);
        line.state.lock().firmware = Some(firmware);
        (line, handle)
    }
}

impl PortLister for MockLine {
    fn list() -> Result<Vec<PortInfo>> {
        Ok(vec![PortInfo {
            name: "mock0".to_string(),
            driver: "mock".to_string(),
        }])
    }
}

#[async_trait]
impl LineTransport for MockLine {
    fn port_name(&self) -> &str {
        &self.name
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        check_outbound(line)?;
        let mut st = self.state.lock();
        if st.closed {
            return Err(TransportError::Closed(self.name.clone()));
        }
        let line = trim_line(line).to_string();
        st.outbound.push(line.clone());
        let replies = st
            .firmware
            .as_mut()
            .map(|fw| fw.on_line(&line))
            .unwrap_or_default();
        st.inbound.extend(replies);
        if let Some(batch) = st.on_write.pop_front() {
            st.inbound.extend(batch);
        }
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let (stall, delay) = {
            let mut st = self.state.lock();
            if st.closed {
                return Err(TransportError::Closed(self.name.clone()));
            }
            st.reads += 1;
            (st.stall_reads, st.read_delay)
        };
        if stall {
            std::future::pending::<()>().await;
        }
        match delay {
            Some(d) => tokio::time::sleep(d).await,
            None => tokio::task::yield_now().await,
        }
        let next = self.state.lock().inbound.pop_front();
        Ok(next.unwrap_or_default())
    }

    async fn clear_input(&mut self) -> Result<()> {
        self.state.lock().inbound.clear();
        Ok(())
    }
}

impl MockHandle {
    /// Queue lines the device will "send".
    pub fn push_inbound<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .lock()
            .inbound
            .extend(lines.into_iter().map(Into::into));
    }

    /// Queue lines that only arrive once the next line is written, so an
    /// input flush before that write cannot discard them. Each call scripts
    /// one further write.
    pub fn reply_on_next_write<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .lock()
            .on_write
            .push_back(lines.into_iter().map(Into::into).collect());
    }

    /// Every line written so far, in order.
    pub fn outbound(&self) -> Vec<String> {
        self.state.lock().outbound.clone()
    }

    pub fn clear_outbound(&self) {
        self.state.lock().outbound.clear();
    }

    /// Number of `read_line` calls made so far.
    pub fn reads(&self) -> usize {
        self.state.lock().reads
    }

    /// Inbound lines not yet consumed.
    pub fn pending_inbound(&self) -> usize {
        self.state.lock().inbound.len()
    }

    /// Make every subsequent read hang until the caller's deadline fires.
    pub fn set_stall_reads(&self, stall: bool) {
        self.state.lock().stall_reads = stall;
    }

    /// Simulate link latency on every read.
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        self.state.lock().read_delay = delay;
    }

    /// Simulate an unplugged cable.
    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    /// Arguments the simulated firmware received for `command`, oldest first.
    pub fn args_for(&self, command: &str) -> Vec<Vec<String>> {
        self.state
            .lock()
            .firmware
            .as_ref()
            .and_then(|fw| fw.received.get(command).cloned())
            .unwrap_or_default()
    }
}

/// Simulated device firmware speaking the enumerate/echo handshake.
///
/// Command signatures use the `name[>N][<M]` grammar. Responses default to
/// `"0"` per declared output line unless overridden with [`respond`](Self::respond).
#[derive(Debug, Clone, Default)]
pub struct MockFirmware {
    signatures: Vec<String>,
    responses: HashMap<String, Vec<String>>,
    enumerating: Option<usize>,
    pending: Option<PendingCall>,
    received: HashMap<String, Vec<Vec<String>>>,
}

#[derive(Debug, Clone)]
struct PendingCall {
    name: String,
    remaining: usize,
    args: Vec<String>,
}

impl MockFirmware {
    pub fn new<I, S>(signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            signatures: signatures.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Fixed output lines for `command`.
    pub fn respond<I, S>(mut self, command: &str, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.responses.insert(
            command.to_string(),
            lines.into_iter().map(Into::into).collect(),
        );
        self
    }

    fn on_line(&mut self, line: &str) -> Vec<String> {
        if line == ENUMERATE {
            self.pending = None;
            self.enumerating = Some(0);
            return vec![self.signature_or_end(0)];
        }
        if let Some(idx) = self.enumerating {
            let expected = self.signatures.get(idx).map(|s| split_signature(s).0);
            if expected == Some(line) {
                let next = idx + 1;
                self.enumerating = (next < self.signatures.len()).then_some(next);
                return vec![self.signature_or_end(next)];
            }
            return Vec::new();
        }
        if let Some(mut call) = self.pending.take() {
            call.args.push(line.to_string());
            call.remaining -= 1;
            if call.remaining > 0 {
                self.pending = Some(call);
                return Vec::new();
            }
            self.received
                .entry(call.name.clone())
                .or_default()
                .push(call.args);
            return self.outputs_for(&call.name);
        }
        let Some((inputs, _)) = self.arity_of(line) else {
            return Vec::new();
        };
        if inputs > 0 {
            self.pending = Some(PendingCall {
                name: line.to_string(),
                remaining: inputs,
                args: Vec::new(),
            });
            return Vec::new();
        }
        self.received
            .entry(line.to_string())
            .or_default()
            .push(Vec::new());
        self.outputs_for(line)
    }

    fn signature_or_end(&self, idx: usize) -> String {
        self.signatures
            .get(idx)
            .cloned()
            .unwrap_or_else(|| END_OF_CATALOG.to_string())
    }

    fn arity_of(&self, name: &str) -> Option<(usize, usize)> {
        self.signatures.iter().find_map(|sig| {
            let (base, inputs, outputs) = split_signature(sig);
            (base == name).then_some((inputs, outputs))
        })
    }

    fn outputs_for(&self, name: &str) -> Vec<String> {
        let outputs = self.arity_of(name).map(|(_, o)| o).unwrap_or(0);
        match self.responses.get(name) {
            Some(lines) => lines.iter().take(outputs).cloned().collect(),
            None => vec!["0".to_string(); outputs],
        }
    }
}

/// Firmware-side reading of `name[>N][<M]`: (base, inputs, outputs).
fn split_signature(sig: &str) -> (&str, usize, usize) {
    let end = sig.find(['>', '<']).unwrap_or(sig.len());
    let base = &sig[..end];
    let mut inputs = 0;
    let mut outputs = 0;
    let mut rest = &sig[end..];
    while let Some(marker) = rest.chars().next() {
        if marker != '>' && marker != '<' {
            break;
        }
        let digits: String = rest[1..].chars().take_while(char::is_ascii_digit).collect();
        let n = digits.parse().unwrap_or(0);
        if marker == '>' {
            outputs = n;
        } else {
            inputs = n;
        }
        rest = &rest[1 + digits.len()..];
    }
    (base, inputs, outputs)
}
