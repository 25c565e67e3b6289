use crate::{BalanceError, Result, TelemetrySample};
use serde::{Deserialize, Serialize};

/// Operator nameplate estimate for one device, persisted by device name.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PowerEstimate {
    Consumer {
        rated_w: f64,
        #[serde(default)]
        utilization: Option<f64>,
    },
    Provider {
        capacity_kw: f64,
        #[serde(default)]
        availability: Option<f64>,
    },
}

impl PowerEstimate {
    pub fn consumer(rated_w: f64, utilization: Option<f64>) -> Result<Self> {
        let est = PowerEstimate::Consumer { rated_w, utilization };
        est.validate()?;
        Ok(est)
    }

    pub fn provider(capacity_kw: f64, availability: Option<f64>) -> Result<Self> {
        let est = PowerEstimate::Provider { capacity_kw, availability };
        est.validate()?;
        Ok(est)
    }

    pub fn validate(&self) -> Result<()> {
        let (label, value) = match *self {
            PowerEstimate::Consumer { rated_w, .. } => ("rated W", rated_w),
            PowerEstimate::Provider { capacity_kw, .. } => ("capacity kW", capacity_kw),
        };
        if !value.is_finite() || value < 0.0 {
            return Err(BalanceError::Validation(format!("{label} must be a finite number >= 0, got {value}")));
        }
        Ok(())
    }

    /// Present-value kW: `ratedW * u / 1000` or `capacityKW * a`, with the
    /// factor clamped to `[0, 1]` and a missing or non-finite factor read as 1.
    pub fn kw(&self) -> f64 {
        match *self {
            PowerEstimate::Consumer { rated_w, utilization } => rated_w * unit_factor(utilization) / 1000.0,
            PowerEstimate::Provider { capacity_kw, availability } => capacity_kw * unit_factor(availability),
        }
    }

    /// Nameplate capacity, for providers only.
    pub fn capacity_kw(&self) -> Option<f64> {
        match *self {
            PowerEstimate::Provider { capacity_kw, .. } => Some(capacity_kw),
            PowerEstimate::Consumer { .. } => None,
        }
    }
}

fn unit_factor(f: Option<f64>) -> f64 {
    match f {
        Some(f) if f.is_finite() => f.clamp(0.0, 1.0),
        _ => 1.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KwSource {
    Telemetry,
    Estimate,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct KwReading {
    pub kw: Option<f64>,
    pub source: KwSource,
}

impl KwReading {
    pub const NONE: KwReading = KwReading {
        kw: None,
        source: KwSource::None,
    };
}

/// Picks between measured power and the operator's estimate.
#[derive(Debug, Clone, Copy, Default)]
pub struct PowerEstimator {
    /// Try the estimate before telemetry.
    pub prefer_manual: bool,
}

impl PowerEstimator {
    pub fn new(prefer_manual: bool) -> Self {
        Self { prefer_manual }
    }

    /// kW for one device. The preferred source is used when it has a value,
    /// otherwise the other one.
    pub fn compute(&self, sample: Option<&TelemetrySample>, estimate: Option<&PowerEstimate>) -> KwReading {
        let measured = sample.and_then(TelemetrySample::kw).map(|kw| KwReading {
            kw: Some(kw),
            source: KwSource::Telemetry,
        });
        let estimated = estimate.map(|e| KwReading {
            kw: Some(e.kw()),
            source: KwSource::Estimate,
        });
        let (first, second) = if self.prefer_manual {
            (estimated, measured)
        } else {
            (measured, estimated)
        };
        first.or(second).unwrap_or(KwReading::NONE)
    }
}
