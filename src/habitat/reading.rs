// Habitat - Terrarium temperature, humidity, and water level monitor
//
// Copyright 2023 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::sensor::{DistanceCm, Humidity, TemperatureFahrenheit};
use std::fmt::{self, Formatter};

/// How full the water dish is, as a percentage.
///
/// Derived from a distance measurement so values below 0 or above 100 are possible
/// when the sensor reads outside its calibration points, unless clamping is enabled.
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct WaterLevel(f64);

impl From<WaterLevel> for f64 {
    fn from(v: WaterLevel) -> Self {
        v.0
    }
}

impl From<f64> for WaterLevel {
    fn from(v: f64) -> Self {
        Self(v)
    }
}

impl fmt::Display for WaterLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}% full", self.0)
    }
}

/// Round to a single decimal place, the resolution we report values at.
fn tenths(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Distances from the ultrasonic sensor at which the water dish is full and empty.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct WaterCalibration {
    pub full: DistanceCm,
    pub empty: DistanceCm,
    pub clamp: bool,
}

impl Default for WaterCalibration {
    fn default() -> Self {
        Self {
            full: DistanceCm::from(3.0),
            empty: DistanceCm::from(9.0),
            clamp: false,
        }
    }
}

impl WaterCalibration {
    /// Linearly map a distance between the `full` and `empty` calibration points to
    /// a percentage, 100% at `full` and 0% at `empty`.
    pub fn percent_full(&self, distance: DistanceCm) -> WaterLevel {
        let full = f64::from(self.full);
        let empty = f64::from(self.empty);
        let distance = tenths(f64::from(distance));

        let mut percent = tenths(100.0 * (empty - distance) / (empty - full));
        if self.clamp {
            percent = percent.clamp(0.0, 100.0);
        }

        WaterLevel(percent)
    }
}

/// Temperature and humidity at one end of the enclosure.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Climate {
    pub temperature: TemperatureFahrenheit,
    pub humidity: Humidity,
}

/// Every value measured during a single iteration of the monitor.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Reading {
    pub basking: Climate,
    pub cooling: Climate,
    pub water_distance: DistanceCm,
    pub water_level: WaterLevel,
}

impl Reading {
    /// Metric names and values in the order they are uploaded.
    pub fn measurements(&self) -> [(&'static str, f64); 5] {
        [
            ("basking_temp_f", self.basking.temperature.into()),
            ("cooling_temp_f", self.cooling.temperature.into()),
            ("basking_humidity_pct", self.basking.humidity.into()),
            ("cooling_humidity_pct", self.cooling.humidity.into()),
            ("water_level_pct", self.water_level.into()),
        ]
    }
}
