//! Adaptive low-pass filter for irregularly sampled RSSI
//!
//! One-euro style: the cutoff frequency rises with the (itself smoothed)
//! rate of change, so a moving device is followed quickly while a resting
//! one is smoothed hard. All rates are per millisecond.

use serde::Deserialize;
use std::f64::consts::PI;

/// Base cutoff (per ms)
pub const DEFAULT_FCMIN: f64 = 1e-5;
/// Cutoff slope against the derivative magnitude
pub const DEFAULT_BETA: f64 = 1e-7;
/// Cutoff used to smooth the derivative (per ms)
pub const DEFAULT_DCUTOFF: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct FilterParams {
    #[serde(default = "default_fcmin")]
    pub fcmin: f64,
    #[serde(default = "default_beta")]
    pub beta: f64,
    #[serde(default = "default_dcutoff")]
    pub dcutoff: f64,
}

fn default_fcmin() -> f64 {
    DEFAULT_FCMIN
}

fn default_beta() -> f64 {
    DEFAULT_BETA
}

fn default_dcutoff() -> f64 {
    DEFAULT_DCUTOFF
}

impl Default for FilterParams {
    fn default() -> Self {
        Self { fcmin: DEFAULT_FCMIN, beta: DEFAULT_BETA, dcutoff: DEFAULT_DCUTOFF }
    }
}

impl FilterParams {
    /// Replace non-positive or non-finite values with the defaults
    pub fn sanitized(self) -> Self {
        let pick = |v: f64, d: f64| if v.is_finite() && v > 0.0 { v } else { d };
        Self {
            fcmin: pick(self.fcmin, DEFAULT_FCMIN),
            beta: if self.beta.is_finite() && self.beta >= 0.0 { self.beta } else { DEFAULT_BETA },
            dcutoff: pick(self.dcutoff, DEFAULT_DCUTOFF),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FilterState {
    value: f64,
    derivative: f64,
    at_ms: u64,
}

#[derive(Debug, Clone)]
pub struct AdaptiveFilter {
    params: FilterParams,
    state: Option<FilterState>,
}

/// Smoothing factor for a first-order low-pass at `cutoff` over `te_ms`
#[inline]
fn alpha(cutoff: f64, te_ms: f64) -> f64 {
    let tau = 1.0 / (2.0 * PI * cutoff);
    1.0 / (1.0 + tau / te_ms)
}

impl AdaptiveFilter {
    pub fn new(params: FilterParams) -> Self {
        Self { params: params.sanitized(), state: None }
    }

    /// Feed one raw sample, returning the smoothed value
    pub fn update(&mut self, raw: f64, at_ms: u64) -> f64 {
        let Some(prev) = self.state else {
            self.state = Some(FilterState { value: raw, derivative: 0.0, at_ms });
            return raw;
        };

        // Zero or negative interval: pass through, keep the derivative estimate
        if at_ms <= prev.at_ms {
            self.state = Some(FilterState { value: raw, derivative: prev.derivative, at_ms: prev.at_ms });
            return raw;
        }

        let te = (at_ms - prev.at_ms) as f64;
        let dx = (raw - prev.value) / te;
        let a_d = alpha(self.params.dcutoff, te);
        let derivative = prev.derivative + a_d * (dx - prev.derivative);

        let cutoff = self.params.fcmin + self.params.beta * derivative.abs();
        let a = alpha(cutoff, te);
        let value = prev.value + a * (raw - prev.value);

        self.state = Some(FilterState { value, derivative, at_ms });
        value
    }

    /// Last smoothed value, if any sample has been applied
    pub fn value(&self) -> Option<f64> {
        self.state.map(|s| s.value)
    }

    /// Smoothed rate of change (units per ms)
    pub fn derivative(&self) -> f64 {
        self.state.map_or(0.0, |s| s.derivative)
    }

    pub fn params(&self) -> FilterParams {
        self.params
    }
}

impl Default for AdaptiveFilter {
    fn default() -> Self {
        Self::new(FilterParams::default())
    }
}
