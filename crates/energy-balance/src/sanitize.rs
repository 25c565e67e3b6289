use device_registry::DeviceId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Physical bound for a voltage reading, in volts.
pub const MAX_VOLTAGE: f64 = 1000.0;
/// Physical bound for the magnitude of a power reading, in watts.
pub const MAX_POWER_W: f64 = 1000.0;

/// Voltage in `[0, 1000]`, else `None`.
pub fn sanitize_voltage(v: Option<f64>) -> Option<f64> {
    v.filter(|v| v.is_finite() && (0.0..=MAX_VOLTAGE).contains(v))
}

/// Power with `|p| <= 1000`, else `None`. Negative power is export.
pub fn sanitize_power(p: Option<f64>) -> Option<f64> {
    p.filter(|p| p.is_finite() && p.abs() <= MAX_POWER_W)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Voltage,
    Power,
}

impl Field {
    fn abs_floor(self) -> f64 {
        match self {
            Field::Voltage => 5.0,
            Field::Power => 50.0,
        }
    }
}

const HISTORY: usize = 5;
const MIN_HISTORY: usize = 3;
const REL_TOL: f64 = 0.5;
const MAX_REJECT_STREAK: u32 = 3;

#[derive(Debug, Default)]
struct Track {
    accepted: VecDeque<f64>,
    rejected_in_row: u32,
}

/// Rejects readings that jump away from the recent median.
///
/// A reading `v` is dropped when `|v - m| > max(floor, 0.5 * |m|)` where `m`
/// is the median of the last five accepted values. Fewer than three values in
/// history means everything passes. After three rejections in a row the next
/// reading is taken as a genuine step change and the history restarts from it.
#[derive(Debug, Default)]
pub struct OutlierFilter {
    tracks: HashMap<(DeviceId, Field), Track>,
}

impl OutlierFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, device: &DeviceId, field: Field, value: Option<f64>) -> Option<f64> {
        let v = value?;
        let track = self.tracks.entry((device.clone(), field)).or_default();

        if track.accepted.len() >= MIN_HISTORY {
            let m = median(&track.accepted);
            let tol = field.abs_floor().max(REL_TOL * m.abs());
            if (v - m).abs() > tol {
                if track.rejected_in_row < MAX_REJECT_STREAK {
                    track.rejected_in_row += 1;
                    tracing::debug!(device = %device, ?field, value = v, median = m, "outlier rejected");
                    return None;
                }
                tracing::info!(device = %device, ?field, value = v, "step change accepted; history restarted");
                track.accepted.clear();
            }
        }

        track.rejected_in_row = 0;
        if track.accepted.len() == HISTORY {
            track.accepted.pop_front();
        }
        track.accepted.push_back(v);
        Some(v)
    }

    /// Forget every history for `device`.
    pub fn clear_device(&mut self, device: &DeviceId) {
        self.tracks.retain(|(id, _), _| id != device);
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    pub fn history(&self, device: &DeviceId, field: Field) -> Vec<f64> {
        self.tracks
            .get(&(device.clone(), field))
            .map(|t| t.accepted.iter().copied().collect())
            .unwrap_or_default()
    }
}

fn median(values: &VecDeque<f64>) -> f64 {
    let mut sorted: Vec<f64> = values.iter().copied().collect();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
