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

use crate::reading::Reading;
use std::fmt::{self, Formatter};

/// A value being checked against acceptable limits.
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum Metric {
    BaskingTemperature,
    CoolingTemperature,
    WaterLevel,
}

impl Metric {
    pub fn as_label(&self) -> &'static str {
        match self {
            Metric::BaskingTemperature => "basking_temperature",
            Metric::CoolingTemperature => "cooling_temperature",
            Metric::WaterLevel => "water_level",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Metric::BaskingTemperature => "Basking Temperature".fmt(f),
            Metric::CoolingTemperature => "Cooling Temperature".fmt(f),
            Metric::WaterLevel => "Water Level".fmt(f),
        }
    }
}

#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum Direction {
    Low,
    High,
}

impl Direction {
    pub fn as_label(&self) -> &'static str {
        match self {
            Direction::Low => "low",
            Direction::High => "high",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.as_label().fmt(f)
    }
}

/// A single value of a reading outside of its limits.
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub struct Abnormality {
    pub metric: Metric,
    pub direction: Direction,
}

impl Abnormality {
    pub fn new(metric: Metric, direction: Direction) -> Self {
        Self { metric, direction }
    }
}

impl fmt::Display for Abnormality {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} is too {}", self.metric, self.direction)
    }
}

/// Exclusive limits for a single value. Values strictly below `low` or strictly
/// above `high` are abnormal, a missing limit is never crossed.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Band {
    pub low: Option<f64>,
    pub high: Option<f64>,
}

impl Band {
    pub const fn new(low: Option<f64>, high: Option<f64>) -> Self {
        Self { low, high }
    }

    fn check(&self, value: f64) -> Option<Direction> {
        match (self.low, self.high) {
            (Some(low), _) if value < low => Some(Direction::Low),
            (_, Some(high)) if value > high => Some(Direction::High),
            _ => None,
        }
    }
}

/// Acceptable limits for each value measured in the enclosure.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Thresholds {
    /// Degrees fahrenheit
    pub basking: Band,
    /// Degrees fahrenheit
    pub cooling: Band,
    /// Percent full
    pub water: Band,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            basking: Band::new(Some(75.5), Some(102.0)),
            cooling: Band::new(Some(68.0), Some(95.0)),
            water: Band::new(Some(15.9), None),
        }
    }
}

impl Thresholds {
    /// Return every value of the reading outside its limits, empty if the
    /// reading is entirely normal.
    pub fn evaluate(&self, reading: &Reading) -> Vec<Abnormality> {
        let checks = [
            (Metric::BaskingTemperature, &self.basking, f64::from(reading.basking.temperature)),
            (Metric::CoolingTemperature, &self.cooling, f64::from(reading.cooling.temperature)),
            (Metric::WaterLevel, &self.water, f64::from(reading.water_level)),
        ];

        checks
            .iter()
            .filter_map(|(metric, band, value)| band.check(*value).map(|d| Abnormality::new(*metric, d)))
            .collect()
    }
}
