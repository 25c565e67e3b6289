use crate::{
    builtin_catalog, discover, invoker::check_arity, Capabilities, CommandCatalog, ConnectionState, DeviceDescriptor,
    DeviceError, DeviceId, DeviceRecord, DeviceRegistry, DeviceStatus, DiscoveryPolicy, ExecutionLog, ExecutionOutcome,
    ExecutionRecord, Invoker, InvokerConfig, LastInvocation, MetricsHub, DeviceQueue, Result,
};
use line_transport::{LineTransport, SharedLine, TransportError};
use parking_lot::{Mutex, RwLock};
use safety_guard::SafetyInterlock;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Bound on the best-effort input flush after a timed-out call.
const FLUSH_AFTER_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub invoker: InvokerConfig,
    pub discovery: DiscoveryPolicy,
    pub log_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            invoker: InvokerConfig::default(),
            discovery: DiscoveryPolicy::default(),
            log_capacity: 500,
        }
    }
}

/// One command to run on one device.
///
/// Running a request against a device that is missing or lost is a no-op:
/// nothing is queued or logged and the hub answers with
/// [`DeviceError::Disconnected`], for which
/// [`DeviceError::is_notification`] is true. Callers report it and carry on.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub device: DeviceId,
    pub command: String,
    /// Missing means no arguments.
    pub args: Option<Vec<String>>,
    /// Overrides the per-operation deadline for this call only.
    pub deadline: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(device: DeviceId, command: impl Into<String>) -> Self {
        Self {
            device,
            command: command.into(),
            args: None,
            deadline: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Owner of every connected device and the only way to talk to one.
pub struct DeviceHub {
    registry: RwLock<DeviceRegistry>,
    queue: DeviceQueue,
    interlock: Arc<SafetyInterlock>,
    log: Mutex<ExecutionLog>,
    metrics: MetricsHub,
    invoker: Invoker,
    discovery: DiscoveryPolicy,
}

impl DeviceHub {
    pub fn new(config: HubConfig, interlock: Arc<SafetyInterlock>) -> Result<Self> {
        let metrics = MetricsHub::new().map_err(DeviceError::Metrics)?;
        Ok(Self {
            registry: RwLock::new(DeviceRegistry::default()),
            queue: DeviceQueue::new(),
            interlock,
            log: Mutex::new(ExecutionLog::new(config.log_capacity)),
            metrics,
            invoker: Invoker::new(config.invoker),
            discovery: config.discovery,
        })
    }

    pub fn interlock(&self) -> &Arc<SafetyInterlock> {
        &self.interlock
    }

    pub fn metrics(&self) -> &MetricsHub {
        &self.metrics
    }

    /// Open a device: install its catalog and register it.
    ///
    /// The catalog comes from the descriptor's fixed list if present, else the
    /// built-in list for kinds with unreliable enumeration, else the discovery
    /// handshake over `line`.
    pub async fn connect(&self, descriptor: &DeviceDescriptor, mut line: Box<dyn LineTransport>) -> Result<DeviceRecord> {
        let id = descriptor.id();
        if self.registry.read().get(&id).is_some_and(DeviceRecord::is_connected) {
            return Err(DeviceError::Validation(format!("{id} is already connected")));
        }

        let kind = descriptor.kind();
        let catalog = if let Some(sigs) = &descriptor.catalog {
            CommandCatalog::from_signatures(sigs).map_err(|e| DeviceError::Validation(e.to_string()))?
        } else if let Some(catalog) = builtin_catalog(kind) {
            tracing::info!(device = %id, ?kind, "using built-in catalog instead of discovery");
            catalog
        } else {
            let outcome = discover(&mut *line, &self.discovery).await?;
            if !outcome.complete {
                tracing::warn!(device = %id, commands = outcome.catalog.len(), "discovery incomplete");
            }
            outcome.catalog
        };
        if catalog.is_empty() {
            return Err(DeviceError::DiscoveryFailed { port: descriptor.port.clone() });
        }

        let record = DeviceRecord {
            id: id.clone(),
            name: descriptor.name.clone(),
            role: descriptor.role(),
            kind,
            capabilities: Capabilities::from_catalog(&catalog),
            catalog,
            state: ConnectionState::Connected,
            status: DeviceStatus::Idle,
            last: None,
        };
        let link: SharedLine = Arc::new(tokio::sync::Mutex::new(line));
        {
            let mut reg = self.registry.write();
            if reg.get(&id).is_some_and(DeviceRecord::is_connected) {
                return Err(DeviceError::Validation(format!("{id} is already connected")));
            }
            reg.insert(record.clone(), link);
            self.metrics.dev.devices_connected.set(reg.connected_count() as i64);
        }
        tracing::info!(
            device = %id,
            name = %record.name,
            role = ?record.role,
            commands = record.catalog.len(),
            "device connected"
        );
        Ok(record)
    }

    /// Forget a device and close its queue. Already queued calls still drain.
    pub fn disconnect(&self, id: &DeviceId) -> Result<DeviceRecord> {
        let removed = {
            let mut reg = self.registry.write();
            let removed = reg.remove(id);
            self.metrics.dev.devices_connected.set(reg.connected_count() as i64);
            removed
        };
        self.queue.close(id);
        match removed {
            Some(record) => {
                tracing::info!(device = %id, "device disconnected");
                Ok(record)
            }
            None => Err(DeviceError::Disconnected(id.clone())),
        }
    }

    pub fn device(&self, id: &DeviceId) -> Option<DeviceRecord> {
        self.registry.read().get(id).cloned()
    }

    /// Every registered device, in port order.
    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.registry.read().iter().cloned().collect()
    }

    pub fn connected(&self) -> Vec<DeviceRecord> {
        self.registry.read().iter().filter(|d| d.is_connected()).cloned().collect()
    }

    pub fn recent_executions(&self, n: usize) -> Vec<ExecutionRecord> {
        self.log.lock().recent(n)
    }

    /// Run one command through lookup, interlock, validation, the device
    /// queue and the invoker.
    ///
    /// Every call that gets past lookup leaves exactly one execution record.
    /// A missing or lost device yields [`DeviceError::Disconnected`] and is
    /// only warned about.
    pub async fn execute(&self, req: ExecutionRequest) -> Result<Option<Vec<String>>> {
        let ExecutionRequest {
            device,
            command,
            args,
            deadline,
        } = req;
        let args = args.unwrap_or_default();

        let found = {
            let reg = self.registry.read();
            match (reg.get(&device), reg.link(&device)) {
                (Some(record), Some(link)) if record.is_connected() => {
                    Some((record.catalog.get(&command).cloned(), link))
                }
                _ => None,
            }
        };
        let Some((descriptor, link)) = found else {
            tracing::warn!(device = %device, command = %command, "device not connected; command dropped");
            return Err(DeviceError::Disconnected(device));
        };

        if let Err(violation) = self.interlock.check(&command) {
            return self.reject(&device, &command, args, violation.into());
        }
        let Some(descriptor) = descriptor else {
            let err = DeviceError::UnknownCommand { command: command.clone() };
            return self.reject(&device, &command, args, err);
        };
        if let Err(err) = check_arity(&descriptor, &args) {
            return self.reject(&device, &command, args, err);
        }

        let invoker = match deadline {
            Some(d) => self.invoker.with_deadline(d),
            None => self.invoker.clone(),
        };
        let task_args = args.clone();
        let task = async move {
            let mut guard = link.lock().await;
            let res = invoker.invoke(&mut **guard, &descriptor, &task_args).await;
            if res.as_ref().is_err_and(DeviceError::is_timeout) {
                // Drop whatever half-answer is still in flight.
                let _ = tokio::time::timeout(FLUSH_AFTER_TIMEOUT, guard.clear_input()).await;
            }
            res
        };
        let result = match self.queue.enqueue(&device, task).await {
            Ok(res) => res,
            Err(e) => Err(DeviceError::from(e)),
        };
        self.settle(&device, &command, args, &result);
        result
    }

    /// Log a call refused before it reached the queue.
    fn reject(&self, device: &DeviceId, command: &str, args: Vec<String>, err: DeviceError) -> Result<Option<Vec<String>>> {
        let result = Err(err);
        self.settle(device, command, args, &result);
        result
    }

    /// Bookkeeping shared by every path that produced an outcome.
    fn settle(&self, device: &DeviceId, command: &str, args: Vec<String>, result: &Result<Option<Vec<String>>>) {
        let outcome = match result {
            Ok(_) => ExecutionOutcome::Ok,
            Err(DeviceError::SafetyBlocked(_)) => ExecutionOutcome::Blocked,
            Err(DeviceError::ProtocolTimeout { .. }) => ExecutionOutcome::Timeout,
            Err(DeviceError::UnknownCommand { .. } | DeviceError::Validation(_)) => ExecutionOutcome::Rejected,
            Err(_) => ExecutionOutcome::Failed,
        };
        let status = match outcome {
            ExecutionOutcome::Ok => DeviceStatus::Ok,
            ExecutionOutcome::Blocked => DeviceStatus::Blocked,
            ExecutionOutcome::Timeout => DeviceStatus::Timeout,
            ExecutionOutcome::Rejected | ExecutionOutcome::Failed => DeviceStatus::Error,
        };
        let link_closed = matches!(result, Err(DeviceError::Transport(TransportError::Closed(_))));
        let at = OffsetDateTime::now_utc();

        {
            let mut reg = self.registry.write();
            if let Some(record) = reg.get_mut(device) {
                record.status = status;
                record.last = Some(LastInvocation {
                    command: command.to_string(),
                    status,
                    at,
                });
                if link_closed {
                    record.state = ConnectionState::Lost;
                }
            }
            if link_closed {
                self.metrics.dev.devices_connected.set(reg.connected_count() as i64);
            }
        }

        self.metrics.dev.commands.inc();
        match outcome {
            ExecutionOutcome::Timeout => self.metrics.dev.timeouts.inc(),
            ExecutionOutcome::Blocked => self.metrics.dev.blocked.inc(),
            _ => {}
        }

        let record = ExecutionRecord {
            at,
            device: device.clone(),
            command: command.to_string(),
            args,
            result: result.as_ref().ok().cloned().flatten(),
            error: result.as_ref().err().map(ToString::to_string),
            outcome,
        };
        match &record.error {
            None => tracing::info!(device = %device, command, outcome = ?outcome, "{}", record.summary()),
            Some(_) => tracing::warn!(device = %device, command, outcome = ?outcome, "{}", record.summary()),
        }
        if link_closed {
            tracing::warn!(device = %device, "link closed; device marked lost");
        }
        self.log.lock().push(record);
    }
}
