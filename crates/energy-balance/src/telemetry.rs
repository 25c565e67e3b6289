use crate::Testbed;
use device_registry::{Capabilities, DeviceHub, DeviceId, DeviceRecord, ExecutionRequest};
use regex::Regex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;

/// Latest reading for one device. Overwritten on every sweep.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySample {
    pub device: DeviceId,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub raw_voltage: Option<f64>,
    pub raw_power_w: Option<f64>,
    /// Voltage after bounds checking (and the outlier filter when enabled).
    pub voltage: Option<f64>,
    /// Power in watts after bounds checking (and the outlier filter when enabled).
    pub power_w: Option<f64>,
    pub capabilities: Capabilities,
}

impl TelemetrySample {
    pub fn empty(device: DeviceId) -> Self {
        Self {
            device,
            at: OffsetDateTime::now_utc(),
            raw_voltage: None,
            raw_power_w: None,
            voltage: None,
            power_w: None,
            capabilities: Capabilities::default(),
        }
    }

    /// Magnitude of the sanitized power, in kW.
    pub fn kw(&self) -> Option<f64> {
        self.power_w.map(|w| w.abs() / 1000.0)
    }
}

fn number_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?").ok())
        .as_ref()
}

/// First numeric token in a response line, e.g. `V=229.8V` gives 229.8.
pub fn first_number(text: &str) -> Option<f64> {
    let m = number_regex()?.find(text)?;
    m.as_str().parse().ok()
}

/// Line of a composite read-all response carrying voltage.
const READ_ALL_VOLTAGE_LINE: usize = 0;
/// Line of a composite read-all response carrying power.
const READ_ALL_POWER_LINE: usize = 1;

/// Issue the read commands a device supports and collect raw numbers.
///
/// Dedicated voltage and power reads go first; the composite read fills in
/// whatever is still missing. Errors are logged and skipped.
pub async fn read_raw(hub: &DeviceHub, record: &DeviceRecord, gap: Duration) -> TelemetrySample {
    let caps = &record.capabilities;
    let mut sample = TelemetrySample::empty(record.id.clone());
    sample.capabilities = caps.clone();
    let mut issued = 0usize;

    if let Some(cmd) = &caps.read_voltage {
        sample.raw_voltage = read_line(hub, &record.id, cmd, 0, gap, &mut issued).await;
    }
    if let Some(cmd) = &caps.read_power {
        sample.raw_power_w = read_line(hub, &record.id, cmd, 0, gap, &mut issued).await;
    }
    if let Some(cmd) = &caps.read_all {
        if sample.raw_voltage.is_none() || sample.raw_power_w.is_none() {
            pause(gap, &mut issued).await;
            if let Some(lines) = run(hub, &record.id, cmd).await {
                let at = |i: usize| lines.get(i).and_then(|l| first_number(l));
                sample.raw_voltage = sample.raw_voltage.or_else(|| at(READ_ALL_VOLTAGE_LINE));
                sample.raw_power_w = sample.raw_power_w.or_else(|| at(READ_ALL_POWER_LINE));
            }
        }
    }
    sample.at = OffsetDateTime::now_utc();
    sample
}

async fn read_line(
    hub: &DeviceHub,
    device: &DeviceId,
    cmd: &str,
    line: usize,
    gap: Duration,
    issued: &mut usize,
) -> Option<f64> {
    pause(gap, issued).await;
    let lines = run(hub, device, cmd).await?;
    lines.get(line).and_then(|l| first_number(l))
}

async fn pause(gap: Duration, issued: &mut usize) {
    if *issued > 0 && !gap.is_zero() {
        tokio::time::sleep(gap).await;
    }
    *issued += 1;
}

async fn run(hub: &DeviceHub, device: &DeviceId, cmd: &str) -> Option<Vec<String>> {
    match hub.execute(ExecutionRequest::new(device.clone(), cmd)).await {
        Ok(lines) => lines,
        Err(e) if e.is_notification() => None,
        Err(e) => {
            tracing::debug!(device = %device, command = cmd, error = %e, "telemetry read failed");
            None
        }
    }
}

/// Timer-driven sweep of read commands over every connected device.
pub struct TelemetryPoller {
    interval: Duration,
    command_gap: Duration,
    paused: AtomicBool,
}

impl TelemetryPoller {
    pub fn new(interval: Duration, command_gap: Duration) -> Self {
        Self {
            interval,
            command_gap,
            paused: AtomicBool::new(false),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Poll every connected device once, then refresh inferred demand.
    /// Returns how many devices produced a sample.
    pub async fn sweep(&self, testbed: &Testbed) -> usize {
        let mut polled = 0;
        for record in testbed.hub().connected() {
            if !record.capabilities.has_telemetry() {
                continue;
            }
            let raw = read_raw(testbed.hub(), &record, self.command_gap).await;
            testbed.ingest(raw);
            polled += 1;
        }
        let inferred = testbed.update_inference();
        tracing::debug!(devices = polled, inferred_kw = ?inferred, "telemetry sweep done");
        polled
    }

    /// Sweep on every tick until `shutdown` flips to true.
    pub async fn run(&self, testbed: Arc<Testbed>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "telemetry poller started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.is_paused() {
                        self.sweep(&testbed).await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("telemetry poller stopped");
    }
}
