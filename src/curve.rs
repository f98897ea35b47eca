//! Per-class power curves: lookup and interpolation between frequency,
//! voltage, power draw, and throughput.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{FleetError, FleetResult};

/// One measured operating point of a device class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerCurvePoint {
    /// Chip frequency (MHz).
    pub frequency_mhz: u32,
    /// Wall power draw at this frequency (W).
    pub power_w: f32,
    /// Hash throughput (TH/s).
    pub throughput_ths: f32,
    /// Supply voltage (V).
    pub voltage: f32,
}

impl PowerCurvePoint {
    pub const fn new(frequency_mhz: u32, power_w: f32, throughput_ths: f32, voltage: f32) -> Self {
        Self {
            frequency_mhz,
            power_w,
            throughput_ths,
            voltage,
        }
    }
}

/// Operating setting resolved from a curve, possibly between two points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CurveSetting {
    pub frequency_mhz: u32,
    pub voltage: f32,
    pub power_w: f32,
    pub throughput_ths: f32,
}

impl From<&PowerCurvePoint> for CurveSetting {
    fn from(p: &PowerCurvePoint) -> Self {
        Self {
            frequency_mhz: p.frequency_mhz,
            voltage: p.voltage,
            power_w: p.power_w,
            throughput_ths: p.throughput_ths,
        }
    }
}

/// Antminer S9 measurements (frequency MHz, power W, TH/s, V).
const S9_POINTS: [PowerCurvePoint; 14] = [
    PowerCurvePoint::new(250, 470.0, 5.4, 8.0),
    PowerCurvePoint::new(300, 565.0, 6.5, 8.1),
    PowerCurvePoint::new(350, 660.0, 7.5, 8.2),
    PowerCurvePoint::new(387, 875.0, 10.0, 8.4),
    PowerCurvePoint::new(450, 950.0, 11.0, 8.5),
    PowerCurvePoint::new(481, 1020.0, 11.0, 8.6),
    PowerCurvePoint::new(525, 1145.0, 12.0, 8.7),
    PowerCurvePoint::new(550, 1250.0, 12.5, 8.8),
    PowerCurvePoint::new(575, 1285.0, 13.0, 8.8),
    PowerCurvePoint::new(600, 1350.0, 13.3, 8.9),
    PowerCurvePoint::new(650, 1460.0, 13.7, 8.9),
    PowerCurvePoint::new(700, 1650.0, 15.0, 9.0),
    PowerCurvePoint::new(750, 1850.0, 16.0, 9.1),
    PowerCurvePoint::new(800, 1900.0, 17.0, 9.2),
];

/// Name of the built-in S9 curve.
pub const S9_CURVE: &str = "s9";

/// An ordered, immutable frequency → power mapping for one device class.
///
/// Points are sorted by frequency on construction. If power is not
/// non-decreasing in frequency the curve is flagged inconsistent and
/// [`PowerCurve::setting_for_power`] falls back to nearest-point lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerCurve {
    name: String,
    points: Vec<PowerCurvePoint>,
    consistent: bool,
}

impl PowerCurve {
    /// Builds a curve from unordered points.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::CurveUnavailable`] if `points` is empty.
    pub fn new(name: impl Into<String>, mut points: Vec<PowerCurvePoint>) -> FleetResult<Self> {
        let name = name.into();
        if points.is_empty() {
            return Err(FleetError::CurveUnavailable(name));
        }
        points.sort_by_key(|p| p.frequency_mhz);
        points.dedup_by_key(|p| p.frequency_mhz);

        let consistent = points.windows(2).all(|w| w[1].power_w >= w[0].power_w);
        if !consistent {
            warn!(
                curve = %name,
                error = %FleetError::InconsistentCurve(name.clone()),
                "falling back to nearest-point lookup"
            );
        }

        Ok(Self {
            name,
            points,
            consistent,
        })
    }

    /// The built-in Antminer S9 curve (250–800 MHz).
    pub fn s9() -> Self {
        Self {
            name: S9_CURVE.to_string(),
            points: S9_POINTS.to_vec(),
            consistent: true,
        }
    }

    /// Returns a copy restricted to points within `[min_mhz, max_mhz]`.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::CurveUnavailable`] if no point falls inside the window.
    pub fn restricted(&self, min_mhz: u32, max_mhz: u32) -> FleetResult<Self> {
        let points: Vec<_> = self
            .points
            .iter()
            .copied()
            .filter(|p| (min_mhz..=max_mhz).contains(&p.frequency_mhz))
            .collect();
        Self::new(self.name.clone(), points)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn points(&self) -> &[PowerCurvePoint] {
        &self.points
    }

    /// `false` when the source data violated power monotonicity.
    pub fn is_consistent(&self) -> bool {
        self.consistent
    }

    /// Lowest-frequency point.
    pub fn floor(&self) -> &PowerCurvePoint {
        &self.points[0]
    }

    /// Highest-frequency point.
    pub fn ceiling(&self) -> &PowerCurvePoint {
        &self.points[self.points.len() - 1]
    }

    /// Returns the two points whose power brackets `power_w`.
    ///
    /// Outside the curve both entries are the nearest end point.
    pub fn bracket(&self, power_w: f32) -> (&PowerCurvePoint, &PowerCurvePoint) {
        if power_w <= self.floor().power_w {
            return (self.floor(), self.floor());
        }
        if power_w >= self.ceiling().power_w {
            return (self.ceiling(), self.ceiling());
        }
        self.points
            .windows(2)
            .find(|w| power_w <= w[1].power_w)
            .map_or((self.ceiling(), self.ceiling()), |w| (&w[0], &w[1]))
    }

    /// Resolves the setting whose power is closest to `target_w` without
    /// exceeding it, clamped to the curve's end points.
    ///
    /// Frequency is interpolated and rounded down to a whole MHz; power,
    /// voltage, and throughput are then re-evaluated at that frequency.
    pub fn setting_for_power(&self, target_w: f32) -> CurveSetting {
        if !self.consistent {
            return CurveSetting::from(self.nearest_by_power(target_w));
        }

        let (lo, hi) = self.bracket(target_w);
        if lo.frequency_mhz == hi.frequency_mhz || hi.power_w <= lo.power_w {
            return CurveSetting::from(lo);
        }

        let ratio = (target_w - lo.power_w) / (hi.power_w - lo.power_w);
        let span = (hi.frequency_mhz - lo.frequency_mhz) as f32;
        let frequency = lo.frequency_mhz + (ratio * span).floor() as u32;
        self.setting_at_frequency(frequency)
    }

    /// Linear interpolation of all quantities at `frequency_mhz`, clamped to
    /// the curve's end points.
    pub fn setting_at_frequency(&self, frequency_mhz: u32) -> CurveSetting {
        if frequency_mhz <= self.floor().frequency_mhz {
            return CurveSetting::from(self.floor());
        }
        if frequency_mhz >= self.ceiling().frequency_mhz {
            return CurveSetting::from(self.ceiling());
        }

        let Some(w) = self
            .points
            .windows(2)
            .find(|w| frequency_mhz <= w[1].frequency_mhz)
        else {
            return CurveSetting::from(self.ceiling());
        };
        let (lo, hi) = (&w[0], &w[1]);
        let ratio = (frequency_mhz - lo.frequency_mhz) as f32
            / (hi.frequency_mhz - lo.frequency_mhz) as f32;
        let lerp = |a: f32, b: f32| a + ratio * (b - a);

        CurveSetting {
            frequency_mhz,
            voltage: (lerp(lo.voltage, hi.voltage) * 100.0).round() / 100.0,
            power_w: lerp(lo.power_w, hi.power_w),
            throughput_ths: lerp(lo.throughput_ths, hi.throughput_ths),
        }
    }

    /// Exact or nearest-lower point for `frequency_mhz`.
    ///
    /// Frequencies below the curve resolve to the lowest point.
    pub fn point_for_frequency(&self, frequency_mhz: u32) -> &PowerCurvePoint {
        self.points
            .iter()
            .rev()
            .find(|p| p.frequency_mhz <= frequency_mhz)
            .unwrap_or(self.floor())
    }

    /// Point with minimum |power - target|; ties go to the lower frequency.
    fn nearest_by_power(&self, target_w: f32) -> &PowerCurvePoint {
        let mut best = self.floor();
        for p in &self.points {
            if (p.power_w - target_w).abs() < (best.power_w - target_w).abs() {
                best = p;
            }
        }
        best
    }
}

/// Named curves shared by reference across device classes.
#[derive(Debug, Clone, Default)]
pub struct CurveLibrary {
    curves: HashMap<String, Arc<PowerCurve>>,
}

impl CurveLibrary {
    /// Library pre-loaded with the built-in curves.
    pub fn builtin() -> Self {
        let mut lib = Self::default();
        lib.insert(PowerCurve::s9());
        lib
    }

    pub fn insert(&mut self, curve: PowerCurve) {
        self.curves.insert(curve.name().to_string(), Arc::new(curve));
    }

    /// # Errors
    ///
    /// Returns [`FleetError::CurveUnavailable`] if no curve is registered under `name`.
    pub fn get(&self, name: &str) -> FleetResult<Arc<PowerCurve>> {
        self.curves
            .get(name)
            .cloned()
            .ok_or_else(|| FleetError::CurveUnavailable(name.to_string()))
    }
}
