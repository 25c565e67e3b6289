use crate::Testbed;
use device_registry::{is_generator_name, DeviceId, DeviceKind, DeviceRecord, DeviceRole, ExecutionRequest};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;

/// Setpoints closer than this to the last applied one are not re-sent.
const DISPATCH_EPSILON_KW: f64 = 0.01;

/// Last setpoint that reached a generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastApplied {
    pub generator: DeviceId,
    pub target_kw: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BalanceOutcome {
    Dispatched,
    /// Same target as last time for this generator.
    Suppressed,
    /// Safe mode is engaged; numbers computed, nothing sent.
    SafeMode,
    /// No generator is connected. `configured_but_offline` tells a
    /// configured generator that is not up from a testbed without one.
    NoGenerator { configured_but_offline: bool },
    /// A generator is connected but none of them exposes a load setter.
    NoLoadSetter,
    /// Another balance pass is still running.
    Busy,
    Failed { error: String },
}

/// Numbers and outcome of one balance pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceReport {
    pub demand_kw: f64,
    pub other_supply_kw: f64,
    pub deficit_kw: f64,
    pub cap_kw: Option<f64>,
    pub target_kw: Option<f64>,
    pub generator: Option<DeviceId>,
    /// Further generators that were ignored because the first one was used.
    pub ignored_generators: Vec<DeviceId>,
    pub outcome: BalanceOutcome,
}

impl BalanceReport {
    fn empty(outcome: BalanceOutcome) -> Self {
        Self {
            demand_kw: 0.0,
            other_supply_kw: 0.0,
            deficit_kw: 0.0,
            cap_kw: None,
            target_kw: None,
            generator: None,
            ignored_generators: Vec::new(),
            outcome,
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        !self.ignored_generators.is_empty()
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Pure setpoint computation: `min(max(0, demand - other), cap)` to 2 decimals.
pub fn balance_target(demand_kw: f64, other_supply_kw: f64, cap_kw: Option<f64>) -> (f64, f64) {
    let deficit = (demand_kw - other_supply_kw).max(0.0);
    let target = match cap_kw {
        Some(cap) => deficit.min(cap.max(0.0)),
        None => deficit,
    };
    (deficit, round2(target))
}

/// Mode 2: keep the generator covering whatever the other providers do not.
pub struct BalanceController {
    interval: Duration,
    in_flight: AtomicBool,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl BalanceController {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Run one pass. Overlapping calls return [`BalanceOutcome::Busy`].
    pub async fn balance_once(&self, testbed: &Testbed) -> BalanceReport {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return BalanceReport::empty(BalanceOutcome::Busy);
        }
        let _guard = InFlight(&self.in_flight);
        let report = self.pass(testbed).await;
        match &report.outcome {
            BalanceOutcome::Dispatched => tracing::info!(
                generator = ?report.generator,
                target_kw = ?report.target_kw,
                demand_kw = report.demand_kw,
                other_supply_kw = report.other_supply_kw,
                "generator setpoint applied"
            ),
            BalanceOutcome::Failed { error } => tracing::warn!(generator = ?report.generator, error = %error, "setpoint dispatch failed"),
            other => tracing::debug!(outcome = ?other, target_kw = ?report.target_kw, "balance pass"),
        }
        report
    }

    async fn pass(&self, testbed: &Testbed) -> BalanceReport {
        let mut generators: Vec<DeviceRecord> = testbed
            .hub()
            .connected()
            .into_iter()
            .filter(|r| r.kind == DeviceKind::Generator)
            .collect();
        generators.sort_by(|a, b| a.id.cmp(&b.id));

        if generators.is_empty() {
            let configured_but_offline = testbed.topology().iter().any(|d| is_generator_name(&d.name))
                || testbed.hub().devices().iter().any(|r| r.kind == DeviceKind::Generator);
            if configured_but_offline {
                tracing::warn!("generator configured but not connected");
            }
            return BalanceReport::empty(BalanceOutcome::NoGenerator { configured_but_offline });
        }

        let chosen = generators.iter().position(|g| g.capabilities.set_load.is_some()).unwrap_or(0);
        let generator = generators.remove(chosen);
        let ignored_generators: Vec<DeviceId> = generators.into_iter().map(|g| g.id).collect();
        if !ignored_generators.is_empty() {
            tracing::warn!(using = %generator.id, ignored = ignored_generators.len(), "more than one generator connected");
        }
        let Some(command) = generator.capabilities.set_load.clone() else {
            tracing::warn!(generator = %generator.id, "connected generator has no load setter");
            return BalanceReport {
                generator: Some(generator.id),
                ignored_generators,
                ..BalanceReport::empty(BalanceOutcome::NoLoadSetter)
            };
        };

        let demand_kw: f64 = match testbed.edges() {
            Ok(edges) => edges.iter().map(|e| e.kw).sum(),
            Err(e) => {
                return BalanceReport {
                    generator: Some(generator.id),
                    ignored_generators,
                    ..BalanceReport::empty(BalanceOutcome::Failed { error: e.to_string() })
                }
            }
        };
        let other_supply_kw: f64 = testbed
            .hub()
            .connected()
            .iter()
            .filter(|r| r.role == DeviceRole::Provider && r.kind != DeviceKind::Generator)
            .filter_map(|r| testbed.kw_of(r).kw)
            .sum();
        let cap_kw = testbed.estimate(&generator.name).and_then(|e| e.capacity_kw());
        let (deficit_kw, target_kw) = balance_target(demand_kw, other_supply_kw, cap_kw);

        let mut report = BalanceReport {
            demand_kw,
            other_supply_kw,
            deficit_kw,
            cap_kw,
            target_kw: Some(target_kw),
            generator: Some(generator.id.clone()),
            ignored_generators,
            outcome: BalanceOutcome::Dispatched,
        };

        if let Some(last) = testbed.last_applied() {
            if last.generator == generator.id && (last.target_kw - target_kw).abs() < DISPATCH_EPSILON_KW {
                report.outcome = BalanceOutcome::Suppressed;
                return report;
            }
        }

        if testbed.hub().interlock().is_engaged() {
            report.outcome = BalanceOutcome::SafeMode;
            return report;
        }

        let request = ExecutionRequest::new(generator.id.clone(), command).with_args([format!("{target_kw:.2}")]);
        match testbed.hub().execute(request).await {
            Ok(_) => {
                let applied = LastApplied {
                    generator: generator.id,
                    target_kw,
                    at: OffsetDateTime::now_utc(),
                };
                if let Err(e) = testbed.set_last_applied(&applied) {
                    tracing::warn!(error = %e, "could not persist last applied setpoint");
                }
            }
            Err(device_registry::DeviceError::SafetyBlocked(_)) => report.outcome = BalanceOutcome::SafeMode,
            Err(e) => {
                report.outcome = BalanceOutcome::Failed { error: e.to_string() };
            }
        }
        report
    }

    /// Balance on every tick while mode 2 is enabled, until `shutdown` flips.
    pub async fn run(&self, testbed: Arc<Testbed>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "balance loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if testbed.mode2_enabled() {
                        self.balance_once(&testbed).await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("balance loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_covers_the_deficit() {
        assert_eq!(balance_target(10.0, 4.0, None), (6.0, 6.0));
        assert_eq!(balance_target(10.0, 4.0, Some(3.0)), (6.0, 3.0));
        assert_eq!(balance_target(2.0, 4.0, None), (0.0, 0.0));
    }

    #[test]
    fn target_is_rounded_to_cents() {
        assert_eq!(balance_target(1.0 / 3.0, 0.0, None).1, 0.33);
        assert_eq!(balance_target(2.0 / 3.0, 0.0, None).1, 0.67);
    }

    #[test]
    fn report_flags_ambiguity() {
        let mut r = BalanceReport::empty(BalanceOutcome::Busy);
        assert!(!r.is_ambiguous());
        r.ignored_generators.push(DeviceId::from("gen2"));
        assert!(r.is_ambiguous());
    }
}
