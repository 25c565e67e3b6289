use serde::{Deserialize, Serialize};

pub const ALPHA_RANGE: (f64, f64) = (0.05, 0.95);
pub const MAX_STEP_RANGE: (f64, f64) = (0.1, 20.0);

/// Tuning for [`DemandInference`], persisted with the enable flag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InferenceTuning {
    pub alpha: f64,
    pub max_step_kw: f64,
}

impl Default for InferenceTuning {
    fn default() -> Self {
        Self {
            alpha: 0.35,
            max_step_kw: 1.0,
        }
    }
}

impl InferenceTuning {
    /// Clamp into the supported ranges; non-finite values fall back to defaults.
    pub fn clamped(self) -> Self {
        let d = Self::default();
        let fix = |v: f64, (lo, hi): (f64, f64), fallback: f64| {
            if v.is_finite() {
                v.clamp(lo, hi)
            } else {
                fallback
            }
        };
        Self {
            alpha: fix(self.alpha, ALPHA_RANGE, d.alpha),
            max_step_kw: fix(self.max_step_kw, MAX_STEP_RANGE, d.max_step_kw),
        }
    }
}

/// Infers aggregate demand from aggregate supply when consumers report nothing.
///
/// Each update moves toward `max(manual, supply)` by at most `max_step_kw`,
/// then smooths with factor `alpha`.
#[derive(Debug, Clone, Default)]
pub struct DemandInference {
    enabled: bool,
    tuning: InferenceTuning,
    previous: Option<f64>,
}

impl DemandInference {
    pub fn new(enabled: bool, tuning: InferenceTuning) -> Self {
        Self {
            enabled,
            tuning: tuning.clamped(),
            previous: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn tuning(&self) -> InferenceTuning {
        self.tuning
    }

    pub fn last(&self) -> Option<f64> {
        if self.enabled {
            self.previous
        } else {
            None
        }
    }

    /// Toggling always starts over.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.previous = None;
    }

    pub fn set_tuning(&mut self, tuning: InferenceTuning) {
        self.tuning = tuning.clamped();
    }

    pub fn update(&mut self, manual_demand_kw: f64, total_supply_kw: f64) -> Option<f64> {
        if !self.enabled || !total_supply_kw.is_finite() || total_supply_kw <= 0.0 {
            return None;
        }
        let manual = if manual_demand_kw.is_finite() { manual_demand_kw } else { 0.0 };
        let target = manual.max(total_supply_kw);
        let next = match self.previous {
            None => target,
            Some(prev) => {
                let step = self.tuning.max_step_kw;
                let stepped = prev + (target - prev).clamp(-step, step);
                prev + self.tuning.alpha * (stepped - prev)
            }
        };
        self.previous = Some(next);
        Some(next)
    }
}
