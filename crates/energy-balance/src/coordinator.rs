use crate::store::{keys, load, save, KeyValueStore};
use crate::{
    sanitize_power, sanitize_voltage, BalanceError, ConnectionGraph, DemandInference, Edge, Endpoint, Field,
    InferenceTuning, KwReading, LastApplied, OutlierFilter, PowerEstimate, PowerEstimator, Result, TelemetrySample,
};
use device_registry::{DeviceDescriptor, DeviceHub, DeviceId, DeviceKind, DeviceRecord, DeviceRole};
use line_transport::LineTransport;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Knobs the coordinator reads on every decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestbedSettings {
    pub prefer_manual: bool,
    pub outlier_filter: bool,
}

/// Persisted shape of the auto-estimate switch and its tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct AutoEstimate {
    enabled: bool,
    #[serde(flatten)]
    tuning: InferenceTuning,
}

/// kW picture of one device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceEnergy {
    pub id: DeviceId,
    pub name: String,
    pub role: DeviceRole,
    pub kind: DeviceKind,
    pub connected: bool,
    pub reading: KwReading,
}

/// Aggregate supply and demand at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct EnergySnapshot {
    pub devices: Vec<DeviceEnergy>,
    pub total_supply_kw: f64,
    /// Σ edge kW.
    pub declared_demand_kw: f64,
    pub inferred_demand_kw: Option<f64>,
    pub edges: Vec<Edge>,
}

/// Shared state of a running console: devices, telemetry, estimates, the
/// connection graph and demand inference, backed by a key-value store.
///
/// Locks are never held across an `.await`.
pub struct Testbed {
    hub: Arc<DeviceHub>,
    store: Arc<dyn KeyValueStore>,
    settings: Mutex<TestbedSettings>,
    topology: Mutex<Vec<DeviceDescriptor>>,
    samples: Mutex<HashMap<DeviceId, TelemetrySample>>,
    filter: Mutex<OutlierFilter>,
    estimates: Mutex<BTreeMap<String, PowerEstimate>>,
    graph: Mutex<ConnectionGraph>,
    inference: Mutex<DemandInference>,
}

impl Testbed {
    /// Build a coordinator and restore persisted state from `store`.
    pub fn new(hub: Arc<DeviceHub>, store: Arc<dyn KeyValueStore>, settings: TestbedSettings) -> Result<Self> {
        let edges: Vec<Edge> = load(store.as_ref(), keys::EDGES)?.unwrap_or_default();
        let estimates: BTreeMap<String, PowerEstimate> =
            load(store.as_ref(), keys::POWER_ESTIMATES)?.unwrap_or_default();
        let auto: Option<AutoEstimate> = load(store.as_ref(), keys::AUTO_ESTIMATE)?;
        let inference = match auto {
            Some(a) => DemandInference::new(a.enabled, a.tuning),
            None => DemandInference::new(false, InferenceTuning::default()),
        };
        tracing::debug!(edges = edges.len(), estimates = estimates.len(), "restored console state");
        Ok(Self {
            hub,
            store,
            settings: Mutex::new(settings),
            topology: Mutex::new(Vec::new()),
            samples: Mutex::new(HashMap::new()),
            filter: Mutex::new(OutlierFilter::new()),
            estimates: Mutex::new(estimates),
            graph: Mutex::new(ConnectionGraph::from_edges(edges)),
            inference: Mutex::new(inference),
        })
    }

    pub fn hub(&self) -> &DeviceHub {
        &self.hub
    }

    pub fn store(&self) -> &dyn KeyValueStore {
        self.store.as_ref()
    }

    pub fn settings(&self) -> TestbedSettings {
        *self.settings.lock()
    }

    pub fn set_prefer_manual(&self, prefer: bool) {
        self.settings.lock().prefer_manual = prefer;
    }

    pub fn set_outlier_filter(&self, enabled: bool) {
        self.settings.lock().outlier_filter = enabled;
        if !enabled {
            self.filter.lock().clear();
        }
    }

    // ---- topology and connections ----

    /// Devices the operator configured, connected or not.
    pub fn set_topology(&self, descriptors: Vec<DeviceDescriptor>) {
        *self.topology.lock() = descriptors;
    }

    pub fn topology(&self) -> Vec<DeviceDescriptor> {
        self.topology.lock().clone()
    }

    /// Connect a device. Topology is left alone: a device connected outside
    /// the configured set is only known while the hub holds its record.
    pub async fn connect(&self, descriptor: &DeviceDescriptor, line: Box<dyn LineTransport>) -> Result<DeviceRecord> {
        Ok(self.hub.connect(descriptor, line).await?)
    }

    /// Disconnect and forget the device's telemetry and filter history.
    pub fn disconnect(&self, id: &DeviceId) -> Result<DeviceRecord> {
        let record = self.hub.disconnect(id)?;
        self.samples.lock().remove(id);
        self.filter.lock().clear_device(id);
        Ok(record)
    }

    fn known_ids(&self) -> HashSet<DeviceId> {
        let mut ids: HashSet<DeviceId> = self.hub.devices().into_iter().map(|d| d.id).collect();
        ids.extend(self.topology.lock().iter().map(DeviceDescriptor::id));
        ids
    }

    // ---- telemetry ----

    /// Sanitize a raw sample, optionally filter it, and make it current.
    pub fn ingest(&self, mut sample: TelemetrySample) {
        let mut voltage = sanitize_voltage(sample.raw_voltage);
        let mut power = sanitize_power(sample.raw_power_w);
        if self.settings().outlier_filter {
            let mut filter = self.filter.lock();
            voltage = filter.accept(&sample.device, Field::Voltage, voltage);
            power = filter.accept(&sample.device, Field::Power, power);
        }
        if sample.raw_voltage.is_some() && voltage.is_none() {
            tracing::debug!(device = %sample.device, raw = ?sample.raw_voltage, "voltage reading dropped");
        }
        if sample.raw_power_w.is_some() && power.is_none() {
            tracing::debug!(device = %sample.device, raw = ?sample.raw_power_w, "power reading dropped");
        }
        sample.voltage = voltage;
        sample.power_w = power;
        self.samples.lock().insert(sample.device.clone(), sample);
    }

    pub fn sample(&self, id: &DeviceId) -> Option<TelemetrySample> {
        self.samples.lock().get(id).cloned()
    }

    pub fn clear_filter(&self) {
        self.filter.lock().clear();
    }

    // ---- estimates ----

    pub fn set_estimate(&self, device_name: &str, estimate: PowerEstimate) -> Result<()> {
        estimate.validate()?;
        let mut estimates = self.estimates.lock();
        estimates.insert(device_name.to_string(), estimate);
        save(self.store.as_ref(), keys::POWER_ESTIMATES, &*estimates)?;
        Ok(())
    }

    pub fn remove_estimate(&self, device_name: &str) -> Result<Option<PowerEstimate>> {
        let mut estimates = self.estimates.lock();
        let removed = estimates.remove(device_name);
        if removed.is_some() {
            save(self.store.as_ref(), keys::POWER_ESTIMATES, &*estimates)?;
        }
        Ok(removed)
    }

    pub fn estimate(&self, device_name: &str) -> Option<PowerEstimate> {
        self.estimates.lock().get(device_name).copied()
    }

    pub fn estimates(&self) -> BTreeMap<String, PowerEstimate> {
        self.estimates.lock().clone()
    }

    /// Present-value kW of a device under the current preference.
    pub fn kw_of(&self, record: &DeviceRecord) -> KwReading {
        let estimator = PowerEstimator::new(self.settings().prefer_manual);
        let sample = self.sample(&record.id);
        let estimate = self.estimate(&record.name);
        estimator.compute(sample.as_ref(), estimate.as_ref())
    }

    fn endpoint(&self, record: &DeviceRecord) -> Endpoint {
        Endpoint {
            id: record.id.clone(),
            role: record.role,
            kw: self.kw_of(record).kw,
        }
    }

    // ---- connection graph ----

    /// Normalized edge list; persisted again if normalization changed it.
    pub fn edges(&self) -> Result<Vec<Edge>> {
        let known = self.known_ids();
        let mut graph = self.graph.lock();
        if graph.normalize(&known) {
            save(self.store.as_ref(), keys::EDGES, graph.edges())?;
        }
        Ok(graph.edges().to_vec())
    }

    fn record(&self, id: &DeviceId) -> Result<DeviceRecord> {
        self.hub.device(id).ok_or_else(|| BalanceError::UnknownDevice(id.clone()))
    }

    pub fn add_edge(&self, from: &DeviceId, to: &DeviceId) -> Result<Edge> {
        let from = self.endpoint(&self.record(from)?);
        let to = self.endpoint(&self.record(to)?);
        let known = self.known_ids();
        let mut graph = self.graph.lock();
        graph.normalize(&known);
        let edge = graph.add_edge(&from, &to)?;
        save(self.store.as_ref(), keys::EDGES, graph.edges())?;
        tracing::info!(from = %edge.from, to = %edge.to, kw = edge.kw, "edge added");
        Ok(edge)
    }

    pub fn edit_edge(&self, from: &DeviceId, to: &DeviceId, kw: f64) -> Result<()> {
        let mut graph = self.graph.lock();
        graph.edit_edge(from, to, kw)?;
        save(self.store.as_ref(), keys::EDGES, graph.edges())?;
        tracing::info!(from = %from, to = %to, kw, "edge edited");
        Ok(())
    }

    pub fn remove_edge(&self, from: &DeviceId, to: &DeviceId) -> Result<Edge> {
        let mut graph = self.graph.lock();
        let edge = graph.remove_edge(from, to)?;
        save(self.store.as_ref(), keys::EDGES, graph.edges())?;
        tracing::info!(from = %from, to = %to, "edge removed");
        Ok(edge)
    }

    /// Wire every unconnected consumer to the provider with most headroom.
    pub fn auto_connect(&self) -> Result<Vec<Edge>> {
        let connected = self.hub.connected();
        let (providers, consumers): (Vec<_>, Vec<_>) = connected
            .iter()
            .map(|r| self.endpoint(r))
            .partition(|e| e.role == DeviceRole::Provider);
        let known = self.known_ids();
        let mut graph = self.graph.lock();
        graph.normalize(&known);
        let added = graph.auto_connect(&providers, &consumers);
        if !added.is_empty() {
            save(self.store.as_ref(), keys::EDGES, graph.edges())?;
            tracing::info!(added = added.len(), "auto-connected consumers");
        }
        Ok(added)
    }

    // ---- demand inference ----

    pub fn set_auto_estimate(&self, enabled: bool) -> Result<()> {
        let tuning = {
            let mut inf = self.inference.lock();
            inf.set_enabled(enabled);
            inf.tuning()
        };
        self.persist_auto_estimate(enabled, tuning)
    }

    pub fn set_inference_tuning(&self, tuning: InferenceTuning) -> Result<InferenceTuning> {
        let (enabled, tuning) = {
            let mut inf = self.inference.lock();
            inf.set_tuning(tuning);
            (inf.is_enabled(), inf.tuning())
        };
        self.persist_auto_estimate(enabled, tuning)?;
        Ok(tuning)
    }

    fn persist_auto_estimate(&self, enabled: bool, tuning: InferenceTuning) -> Result<()> {
        save(self.store.as_ref(), keys::AUTO_ESTIMATE, &AutoEstimate { enabled, tuning })?;
        Ok(())
    }

    pub fn auto_estimate_enabled(&self) -> bool {
        self.inference.lock().is_enabled()
    }

    pub fn inference_tuning(&self) -> InferenceTuning {
        self.inference.lock().tuning()
    }

    /// Feed the current totals into demand inference.
    pub fn update_inference(&self) -> Option<f64> {
        let snapshot = self.totals();
        self.inference.lock().update(snapshot.1, snapshot.0)
    }

    /// (total provider supply, declared demand) over connected devices.
    fn totals(&self) -> (f64, f64) {
        let supply: f64 = self
            .hub
            .connected()
            .iter()
            .filter(|r| r.role == DeviceRole::Provider)
            .filter_map(|r| self.kw_of(r).kw)
            .sum();
        let demand = self.edges().map(|e| e.iter().map(|e| e.kw).sum::<f64>()).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "could not persist normalized edges");
            self.graph.lock().total_kw()
        });
        (supply, demand)
    }

    pub fn snapshot(&self) -> Result<EnergySnapshot> {
        let devices: Vec<DeviceEnergy> = self
            .hub
            .devices()
            .into_iter()
            .map(|r| DeviceEnergy {
                reading: self.kw_of(&r),
                connected: r.is_connected(),
                id: r.id,
                name: r.name,
                role: r.role,
                kind: r.kind,
            })
            .collect();
        let total_supply_kw = devices
            .iter()
            .filter(|d| d.connected && d.role == DeviceRole::Provider)
            .filter_map(|d| d.reading.kw)
            .sum();
        let edges = self.edges()?;
        Ok(EnergySnapshot {
            devices,
            total_supply_kw,
            declared_demand_kw: edges.iter().map(|e| e.kw).sum(),
            inferred_demand_kw: self.inference.lock().last(),
            edges,
        })
    }

    // ---- mode 2 bookkeeping ----

    pub fn mode2_enabled(&self) -> bool {
        match load::<bool>(self.store.as_ref(), keys::MODE2_ENABLED) {
            Ok(v) => v.unwrap_or(false),
            Err(e) => {
                tracing::warn!(error = %e, "mode 2 flag unreadable; treating as off");
                false
            }
        }
    }

    pub fn set_mode2(&self, enabled: bool) -> Result<()> {
        save(self.store.as_ref(), keys::MODE2_ENABLED, &enabled)?;
        tracing::info!(enabled, "mode 2 toggled");
        Ok(())
    }

    pub fn last_applied(&self) -> Option<LastApplied> {
        load(self.store.as_ref(), keys::LAST_APPLIED).ok().flatten()
    }

    pub fn set_last_applied(&self, applied: &LastApplied) -> Result<()> {
        save(self.store.as_ref(), keys::LAST_APPLIED, applied)?;
        Ok(())
    }
}
