// Habitat - Terrarium temperature, humidity, and water level monitor
//
// Copyright 2021-2023 Nick Pillitteri
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
use crate::sensor::{SensorError, SensorId};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicU64;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ZoneLabels {
    zone: String,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: String,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResultLabels {
    result: String,
}

/// Outcome of an attempt to send a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationResult {
    Sent,
    Failed,
    Disabled,
    Throttled,
}

impl NotificationResult {
    pub fn as_label(&self) -> &'static str {
        match self {
            NotificationResult::Sent => "sent",
            NotificationResult::Failed => "failed",
            NotificationResult::Disabled => "disabled",
            NotificationResult::Throttled => "throttled",
        }
    }
}

/// Collection of Prometheus metrics updated by each iteration of the monitor.
/// Temperature in degrees fahrenheit, relative humidity, and water level are
/// emitted as gauges. Cheap to clone, clones share the same underlying values.
#[derive(Debug, Clone)]
pub struct HabitatMetrics {
    temperature: Family<ZoneLabels, Gauge<f64, AtomicU64>>,
    humidity: Family<ZoneLabels, Gauge<f64, AtomicU64>>,
    water_level: Gauge<f64, AtomicU64>,
    water_distance: Gauge<f64, AtomicU64>,
    last_reading: Gauge<f64, AtomicU64>,
    abnormal: Gauge,
    collections: Counter,
    errors: Family<KindLabels, Counter>,
    notifications: Family<ResultLabels, Counter>,
    uploads: Family<ResultLabels, Counter>,
}

impl HabitatMetrics {
    pub fn new(reg: &mut Registry) -> Self {
        let temperature = Family::<ZoneLabels, Gauge<f64, AtomicU64>>::default();
        let humidity = Family::<ZoneLabels, Gauge<f64, AtomicU64>>::default();
        let water_level = Gauge::<f64, AtomicU64>::default();
        let water_distance = Gauge::<f64, AtomicU64>::default();
        let last_reading = Gauge::<f64, AtomicU64>::default();
        let abnormal: Gauge = Gauge::default();
        let collections: Counter = Counter::default();
        let errors = Family::<KindLabels, Counter>::default();
        let notifications = Family::<ResultLabels, Counter>::default();
        let uploads = Family::<ResultLabels, Counter>::default();

        reg.register(
            "habitat_temperature_fahrenheit",
            "Temperature in fahrenheit by zone",
            temperature.clone(),
        );
        reg.register(
            "habitat_relative_humidity",
            "Relative humidity (0-100) by zone",
            humidity.clone(),
        );
        reg.register(
            "habitat_water_level_percent",
            "How full the water dish is (0-100, may exceed bounds)",
            water_level.clone(),
        );
        reg.register(
            "habitat_water_distance_centimeters",
            "Distance from the ultrasonic sensor to the water surface",
            water_distance.clone(),
        );
        reg.register(
            "habitat_last_read_timestamp",
            "Timestamp of last successful read",
            last_reading.clone(),
        );
        reg.register(
            "habitat_abnormal",
            "1 if the last reading was outside acceptable limits, 0 otherwise",
            abnormal.clone(),
        );
        reg.register("habitat_collections", "Number of attempted reads", collections.clone());
        reg.register("habitat_errors", "Number of failed reads by type", errors.clone());
        reg.register(
            "habitat_notifications",
            "Number of notification attempts by result",
            notifications.clone(),
        );
        reg.register("habitat_uploads", "Number of uploads by result", uploads.clone());

        Self {
            temperature,
            humidity,
            water_level,
            water_distance,
            last_reading,
            abnormal,
            collections,
            errors,
            notifications,
            uploads,
        }
    }

    pub fn record_attempt(&self) {
        self.collections.inc();
    }

    pub fn record_error(&self, e: &SensorError) {
        let labels = KindLabels {
            kind: e.kind().as_label().to_owned(),
        };

        self.errors.get_or_create(&labels).inc();
    }

    pub fn record_reading(&self, reading: &Reading) {
        for (id, climate) in [(SensorId::Basking, reading.basking), (SensorId::Cooling, reading.cooling)] {
            let labels = ZoneLabels {
                zone: id.as_label().to_owned(),
            };

            self.temperature.get_or_create(&labels).set(climate.temperature.into());
            self.humidity.get_or_create(&labels).set(climate.humidity.into());
        }

        self.water_level.set(reading.water_level.into());
        self.water_distance.set(reading.water_distance.into());

        // If we can't get the number of seconds since the epoch, skip the update
        let _ = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| self.last_reading.set(d.as_secs_f64()));
    }

    pub fn record_abnormal(&self, abnormal: bool) {
        self.abnormal.set(i64::from(abnormal));
    }

    pub fn record_notification(&self, result: NotificationResult) {
        let labels = ResultLabels {
            result: result.as_label().to_owned(),
        };

        self.notifications.get_or_create(&labels).inc();
    }

    pub fn record_upload(&self, ok: bool) {
        let labels = ResultLabels {
            result: if ok { "success" } else { "failure" }.to_owned(),
        };

        self.uploads.get_or_create(&labels).inc();
    }
}

#[cfg(test)]
mod test {
    use super::{HabitatMetrics, NotificationResult};
    use crate::reading::{Climate, Reading, WaterLevel};
    use crate::sensor::{DistanceCm, Humidity, SensorError, SensorErrorKind, TemperatureFahrenheit};
    use prometheus_client::encoding::text::encode;
    use prometheus_client::registry::Registry;

    fn render(reg: &Registry) -> String {
        let mut buf = String::new();
        encode(&mut buf, reg).unwrap();
        buf
    }

    #[test]
    fn test_record_reading() {
        let mut reg = Registry::default();
        let metrics = HabitatMetrics::new(&mut reg);

        metrics.record_reading(&Reading {
            basking: Climate {
                temperature: TemperatureFahrenheit::from(95.5),
                humidity: Humidity::from(20.0),
            },
            cooling: Climate {
                temperature: TemperatureFahrenheit::from(78.0),
                humidity: Humidity::from(30.0),
            },
            water_distance: DistanceCm::from(6.0),
            water_level: WaterLevel::from(50.0),
        });

        let text = render(&reg);
        assert!(text.contains("habitat_temperature_fahrenheit{zone=\"basking\"} 95.5"));
        assert!(text.contains("habitat_temperature_fahrenheit{zone=\"cooling\"} 78.0"));
        assert!(text.contains("habitat_relative_humidity{zone=\"cooling\"} 30.0"));
        assert!(text.contains("habitat_water_level_percent 50.0"));
    }

    #[test]
    fn test_record_outcomes() {
        let mut reg = Registry::default();
        let metrics = HabitatMetrics::new(&mut reg);

        metrics.record_attempt();
        metrics.record_attempt();
        metrics.record_error(&SensorError::KindMsg(SensorErrorKind::ReadTimeout, "timeout"));
        metrics.record_abnormal(true);
        metrics.record_notification(NotificationResult::Throttled);
        metrics.record_upload(false);

        let text = render(&reg);
        assert!(text.contains("habitat_collections_total 2"));
        assert!(text.contains("habitat_errors_total{kind=\"timeout\"} 1"));
        assert!(text.contains("habitat_abnormal 1"));
        assert!(text.contains("habitat_notifications_total{result=\"throttled\"} 1"));
        assert!(text.contains("habitat_uploads_total{result=\"failure\"} 1"));
    }
}
