// ── Basal profile ──
//
// The pump stores one basal factor per hour of day as an integer in
// milli-IU per hour. Only a subset of values is representable: rates in
// [0.05, 1.00) IU/h snap to 0.01 IU steps, everything else to 0.05 IU.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Number of hourly factors in a profile.
pub const HOURS_PER_DAY: usize = 24;

const FINE_BAND: std::ops::Range<u32> = 50..1000;
const FINE_STEP: u32 = 10;
const COARSE_STEP: u32 = 50;

/// Source of hourly basal rates in IU/h, e.g. a therapy profile from a
/// treatment database.
pub trait TherapyProfile {
    /// Basal rate in IU/h for `hour` (0..24, UTC).
    fn hourly_rate(&self, hour: usize) -> f64;
}

impl TherapyProfile for [f64] {
    fn hourly_rate(&self, hour: usize) -> f64 {
        self.get(hour).copied().unwrap_or_default()
    }
}

/// Snap a milli-IU factor onto the pump's grid (round half up).
pub fn quantize_factor(milli_units: u32) -> u32 {
    let step = if FINE_BAND.contains(&milli_units) {
        FINE_STEP
    } else {
        COARSE_STEP
    };
    milli_units.saturating_add(step / 2) / step * step
}

/// Convert an IU/h rate into a quantized milli-IU factor.
///
/// Digits below a milli-IU are dropped, not rounded, so the grid
/// rounding in [`quantize_factor`] is the only rounding step: 0.4249
/// maps to 420, not 430. Negative and non-finite rates become zero.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::as_conversions
)]
pub fn quantize_rate(rate: f64) -> u32 {
    if !rate.is_finite() || rate <= 0.0 {
        return 0;
    }
    // Micro-units absorb float noise such as 1.001 * 1000 = 1000.999...
    // Saturating float-to-int cast; the value is non-negative here.
    let micro_units = (rate * 1_000_000.0).round() as u64;
    let milli_units = u32::try_from(micro_units / 1000).unwrap_or(u32::MAX);
    quantize_factor(milli_units)
}

/// A full day of quantized hourly basal factors.
///
/// Two profiles are equal iff every factor is equal; there is no tolerance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u32>", into = "Vec<u32>")]
pub struct BasalProfile {
    factors: [u32; HOURS_PER_DAY],
}

impl BasalProfile {
    pub fn from_therapy_profile<P: TherapyProfile + ?Sized>(profile: &P) -> Self {
        let mut factors = [0u32; HOURS_PER_DAY];
        for (hour, factor) in factors.iter_mut().enumerate() {
            *factor = quantize_rate(profile.hourly_rate(hour));
        }
        Self { factors }
    }

    /// Build from exactly [`HOURS_PER_DAY`] rates in IU/h.
    pub fn from_rates(rates: &[f64]) -> Result<Self, CoreError> {
        if rates.len() != HOURS_PER_DAY {
            return Err(CoreError::Validation {
                message: format!(
                    "basal profile needs {HOURS_PER_DAY} hourly rates, got {}",
                    rates.len()
                ),
            });
        }
        Ok(Self::from_therapy_profile(rates))
    }

    /// Build from milli-IU factors, snapping each onto the pump's grid.
    pub fn from_factors(factors: &[u32]) -> Result<Self, CoreError> {
        let factors: [u32; HOURS_PER_DAY] =
            factors.try_into().map_err(|_| CoreError::Validation {
                message: format!(
                    "basal profile needs {HOURS_PER_DAY} hourly factors, got {}",
                    factors.len()
                ),
            })?;
        Ok(Self {
            factors: factors.map(quantize_factor),
        })
    }

    pub fn factors(&self) -> &[u32; HOURS_PER_DAY] {
        &self.factors
    }

    pub fn factor_at(&self, hour: usize) -> Option<u32> {
        self.factors.get(hour).copied()
    }

    /// Sum of all factors in milli-IU.
    pub fn daily_total(&self) -> u32 {
        self.factors.iter().sum()
    }
}

impl TherapyProfile for BasalProfile {
    fn hourly_rate(&self, hour: usize) -> f64 {
        f64::from(self.factor_at(hour).unwrap_or_default()) / 1000.0
    }
}

impl TryFrom<Vec<u32>> for BasalProfile {
    type Error = CoreError;

    fn try_from(value: Vec<u32>) -> Result<Self, Self::Error> {
        Self::from_factors(&value)
    }
}

impl From<BasalProfile> for Vec<u32> {
    fn from(profile: BasalProfile) -> Self {
        profile.factors.to_vec()
    }
}

impl fmt::Display for BasalProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (hour, factor) in self.factors.iter().enumerate() {
            if hour > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}.{:03}", factor / 1000, factor % 1000)?;
        }
        Ok(())
    }
}
