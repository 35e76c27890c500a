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

use crate::alert::AlertChannel;
use crate::metrics::{HabitatMetrics, NotificationResult};
use crate::policy::{Abnormality, Thresholds};
use crate::reading::{Climate, Reading, WaterCalibration, WaterLevel};
use crate::sensor::{DistanceCm, SensorError, SensorId, SensorPort, TemperatureFahrenheit};
use crate::sink::{MetricsSink, SinkError};
use std::error::Error;
use std::fmt::{self, Formatter};
use std::future::Future;
use std::time::{Duration, SystemTime};
use tokio::time::{self, Instant};
use tracing::Instrument;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_UPLOAD_INTERVAL: Duration = Duration::from_secs(600);
pub const DEFAULT_PERSISTENCE: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_COOL_DOWN: Duration = Duration::from_secs(4 * 60 * 60);

const UNREACHABLE_MESSAGE: &str = "Sensor is unreachable!";

/// How many times to retry a failed sensor read and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }
}

/// Behavior of the monitor, see `Default` for the values used in the enclosure.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Send push notifications for persistent abnormal readings
    pub notify: bool,
    /// Write readings to the time-series backend
    pub upload: bool,
    /// Minimum time between writes to the time-series backend
    pub upload_interval: Duration,
    /// Time to sleep after each iteration
    pub poll_interval: Duration,
    /// How long readings must stay abnormal before notifying
    pub persistence: Duration,
    /// Minimum time between notifications
    pub cool_down: Duration,
    pub thresholds: Thresholds,
    pub calibration: WaterCalibration,
    pub climate_retry: RetryPolicy,
    pub distance_retry: RetryPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            notify: true,
            upload: true,
            upload_interval: DEFAULT_UPLOAD_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            persistence: DEFAULT_PERSISTENCE,
            cool_down: DEFAULT_COOL_DOWN,
            thresholds: Thresholds::default(),
            calibration: WaterCalibration::default(),
            climate_retry: RetryPolicy::new(20, Duration::from_millis(250)),
            distance_retry: RetryPolicy::new(20, Duration::from_millis(500)),
        }
    }
}

/// Where the monitor is in its abnormal reading debounce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The last reading was within limits
    Normal,
    /// Readings are abnormal but haven't been for long enough to notify
    AbnormalPending,
    /// Readings have been abnormal long enough that notifications are sent,
    /// subject to the cool down between them
    AbnormalNotifying,
}

/// Timestamps and flags the monitor carries between iterations. `None` means
/// something has never happened, which counts as infinitely long ago.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorState {
    last_abnormality_at: Option<Instant>,
    last_notification_at: Option<Instant>,
    last_reading_was_normal: bool,
    last_upload_at: Option<Instant>,
}

impl Default for MonitorState {
    fn default() -> Self {
        Self {
            last_abnormality_at: None,
            last_notification_at: None,
            last_reading_was_normal: true,
            last_upload_at: None,
        }
    }
}

impl MonitorState {
    /// Start of the current run of abnormal readings.
    pub fn last_abnormality_at(&self) -> Option<Instant> {
        self.last_abnormality_at
    }

    /// Last time a notification was sent or attempted.
    pub fn last_notification_at(&self) -> Option<Instant> {
        self.last_notification_at
    }

    pub fn last_reading_was_normal(&self) -> bool {
        self.last_reading_was_normal
    }

    pub fn last_upload_at(&self) -> Option<Instant> {
        self.last_upload_at
    }

    pub fn phase(&self, now: Instant, persistence: Duration) -> Phase {
        if self.last_reading_was_normal {
            Phase::Normal
        } else if elapsed_beyond(self.last_abnormality_at, now, persistence) {
            Phase::AbnormalNotifying
        } else {
            Phase::AbnormalPending
        }
    }

    fn notified(&mut self, now: Instant) {
        self.last_notification_at = Some(self.last_notification_at.map_or(now, |prev| prev.max(now)));
    }
}

/// True if strictly more than `limit` has passed between `at` and `now`, or `at` never happened.
fn elapsed_beyond(at: Option<Instant>, now: Instant, limit: Duration) -> bool {
    at.map_or(true, |t| now.saturating_duration_since(t) > limit)
}

fn hours(d: Duration) -> f64 {
    d.as_secs_f64() / 3600.0
}

/// Error that stops the monitor.
#[derive(Debug)]
pub enum MonitorError {
    /// A sensor kept failing after every retry was used up
    SensorUnreachable {
        sensor: &'static str,
        attempts: u32,
        source: SensorError,
    },
}

impl MonitorError {
    pub fn as_label(&self) -> &'static str {
        match self {
            MonitorError::SensorUnreachable { .. } => "sensor_unreachable",
        }
    }
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::SensorUnreachable {
                sensor,
                attempts,
                source,
            } => write!(f, "{} sensor unreachable after {} attempts: {}", sensor, attempts, source),
        }
    }
}

impl Error for MonitorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MonitorError::SensorUnreachable { source, .. } => Some(source),
        }
    }
}

/// Periodically read every sensor in the enclosure, notify when readings stay
/// outside acceptable limits, and upload readings for graphing.
pub struct HabitatMonitor<S, A, M> {
    config: MonitorConfig,
    sensors: S,
    alerts: A,
    sink: M,
    metrics: HabitatMetrics,
    state: MonitorState,
    iterations: u64,
}

impl<S, A, M> HabitatMonitor<S, A, M>
where
    S: SensorPort + Send,
    A: AlertChannel + Send + Sync,
    M: MetricsSink + Send + Sync,
{
    pub fn new(config: MonitorConfig, sensors: S, alerts: A, sink: M, metrics: HabitatMetrics) -> Self {
        Self {
            config,
            sensors,
            alerts,
            sink,
            metrics,
            state: MonitorState::default(),
            iterations: 0,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    /// Run iterations until `shutdown` completes, returning its output. Sensors
    /// that can't be read even after retrying stop the loop with an error.
    pub async fn run<F, T>(&mut self, shutdown: F) -> Result<T, MonitorError>
    where
        F: Future<Output = T>,
    {
        tokio::pin!(shutdown);

        loop {
            let stopped = tokio::select! {
                out = &mut shutdown => Some(out),
                res = self.cycle() => {
                    res?;
                    None
                }
            };

            if let Some(out) = stopped {
                tracing::info!(message = "stopping monitor", iterations = self.iterations);
                return Ok(out);
            }
        }
    }

    async fn cycle(&mut self) -> Result<(), MonitorError> {
        self.iterations += 1;
        let span = tracing::info_span!("iteration", n = self.iterations);

        self.iterate().instrument(span).await?;
        time::sleep(self.config.poll_interval).await;
        Ok(())
    }

    /// Read every sensor once (retrying failures), update the abnormal reading
    /// state, and upload the reading if enough time has passed since the last one.
    pub async fn iterate(&mut self) -> Result<Reading, MonitorError> {
        let (basking, cooling) = self.gather_climate().await?;
        let (water_distance, water_level) = self.gather_water_level().await?;

        let reading = Reading {
            basking,
            cooling,
            water_distance,
            water_level,
        };

        self.metrics.record_reading(&reading);

        let now = Instant::now();
        self.check_values(&reading, now).await;
        self.maybe_upload(&reading, now).await;

        Ok(reading)
    }

    async fn read_climate_once(&mut self) -> Result<(Climate, Climate), SensorError> {
        let (basking_c, basking_h) = self.sensors.read_climate(SensorId::Basking).await?;
        let (cooling_c, cooling_h) = self.sensors.read_climate(SensorId::Cooling).await?;

        let basking = Climate {
            temperature: TemperatureFahrenheit::from(basking_c),
            humidity: basking_h,
        };
        let cooling = Climate {
            temperature: TemperatureFahrenheit::from(cooling_c),
            humidity: cooling_h,
        };

        tracing::info!(
            message = "read basking climate",
            celsius = %basking_c,
            fahrenheit = %basking.temperature,
            humidity = %basking.humidity
        );
        tracing::info!(
            message = "read cooling climate",
            celsius = %cooling_c,
            fahrenheit = %cooling.temperature,
            humidity = %cooling.humidity
        );

        Ok((basking, cooling))
    }

    /// Read both climate sensors, retrying both if either fails.
    async fn gather_climate(&mut self) -> Result<(Climate, Climate), MonitorError> {
        let policy = self.config.climate_retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.metrics.record_attempt();

            let err = match self.read_climate_once().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };

            self.metrics.record_error(&err);
            if attempt > policy.retries {
                return Err(self.escalate("climate", attempt, err).await);
            }

            tracing::warn!(
                message = "climate sensor read failed, retrying",
                attempt = attempt,
                delay_ms = policy.delay.as_millis() as u64,
                error = %err
            );
            time::sleep(policy.delay).await;
        }
    }

    /// Range the water surface and convert it to how full the water dish is.
    async fn gather_water_level(&mut self) -> Result<(DistanceCm, WaterLevel), MonitorError> {
        let policy = self.config.distance_retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.metrics.record_attempt();

            let err = match self.sensors.read_distance().await {
                Ok(distance) => {
                    let level = self.config.calibration.percent_full(distance);
                    tracing::info!(message = "read water level", distance = %distance, level = %level);
                    return Ok((distance, level));
                }
                Err(e) => e,
            };

            self.metrics.record_error(&err);
            if attempt > policy.retries {
                return Err(self.escalate("distance", attempt, err).await);
            }

            tracing::warn!(
                message = "water level read failed, retrying",
                attempt = attempt,
                delay_ms = policy.delay.as_millis() as u64,
                error = %err
            );
            time::sleep(policy.delay).await;
        }
    }

    /// A sensor that can't be read is urgent, notify without waiting for the
    /// abnormal reading persistence window.
    async fn escalate(&mut self, sensor: &'static str, attempts: u32, source: SensorError) -> MonitorError {
        tracing::error!(
            message = "sensor is unreachable",
            sensor = sensor,
            attempts = attempts,
            error = %source
        );

        self.alert_abnormal(UNREACHABLE_MESSAGE, Instant::now()).await;
        MonitorError::SensorUnreachable {
            sensor,
            attempts,
            source,
        }
    }

    /// Check a reading against acceptable limits and notify if abnormal readings
    /// have persisted. Returns every abnormal value of the reading.
    ///
    /// The persistence window starts over each time readings go from normal to
    /// abnormal, so a value flapping around a limit doesn't cause a notification.
    pub async fn check_values(&mut self, reading: &Reading, now: Instant) -> Vec<Abnormality> {
        let abnormalities = self.config.thresholds.evaluate(reading);
        self.metrics.record_abnormal(!abnormalities.is_empty());

        if abnormalities.is_empty() {
            if !self.state.last_reading_was_normal {
                tracing::info!("readings returned to normal");
            }

            self.state.last_reading_was_normal = true;
            return abnormalities;
        }

        for a in abnormalities.iter() {
            tracing::warn!(
                message = "abnormal reading",
                metric = a.metric.as_label(),
                direction = a.direction.as_label(),
                alert = %a
            );
        }

        if self.state.last_reading_was_normal {
            tracing::info!("first abnormal reading detected");
            self.state.last_reading_was_normal = false;
            self.state.last_abnormality_at = Some(now);
            return abnormalities;
        }

        if elapsed_beyond(self.state.last_abnormality_at, now, self.config.persistence) {
            tracing::warn!(
                message = "persistent abnormal readings, notifying",
                persistence_mins = self.config.persistence.as_secs() / 60
            );

            let message = abnormalities
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            self.alert_abnormal(&message, now).await;
        } else {
            tracing::info!(
                message = "subsequent abnormal reading, waiting for persistence window",
                persistence_mins = self.config.persistence.as_secs() / 60
            );
        }

        abnormalities
    }

    /// Send a notification unless one was sent within the cool down. An attempt
    /// that fails still starts the cool down.
    async fn alert_abnormal(&mut self, message: &str, now: Instant) -> NotificationResult {
        let result = if !elapsed_beyond(self.state.last_notification_at, now, self.config.cool_down) {
            let since = self
                .state
                .last_notification_at
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or_default();

            tracing::info!(
                message = "notification already sent, waiting for cool down",
                hours_ago = %format!("{:.2}", hours(since)),
                cool_down_hours = %format!("{:.2}", hours(self.config.cool_down))
            );
            NotificationResult::Throttled
        } else if !self.config.notify {
            tracing::info!(message = "skipping notification as requested", notification = message);
            NotificationResult::Disabled
        } else {
            self.state.notified(now);
            match self.alerts.notify(message).await {
                Ok(_) => {
                    tracing::info!(message = "notification sent", notification = message);
                    NotificationResult::Sent
                }
                Err(e) => {
                    tracing::error!(message = "trouble sending notification", notification = message, error = %e);
                    NotificationResult::Failed
                }
            }
        };

        self.metrics.record_notification(result);
        result
    }

    /// Write the reading to the time-series backend if uploads are enabled and the
    /// upload interval has passed. Returns true if an upload was attempted.
    pub async fn maybe_upload(&mut self, reading: &Reading, now: Instant) -> bool {
        if !self.config.upload {
            return false;
        }

        if !elapsed_beyond(self.state.last_upload_at, now, self.config.upload_interval) {
            tracing::debug!(
                message = "waiting for upload interval",
                interval_secs = self.config.upload_interval.as_secs()
            );
            return false;
        }

        match self.sink.write_measurements(SystemTime::now(), &reading.measurements()).await {
            Ok(_) => {
                self.metrics.record_upload(true);
            }
            Err(SinkError::RejectedRecords(records)) => {
                self.metrics.record_upload(false);
                tracing::error!(message = "records rejected by time-series backend", count = records.len());
                for r in records.iter() {
                    tracing::error!(
                        message = "rejected record",
                        index = r.record_index,
                        reason = %r.reason,
                        existing_version = ?r.existing_version
                    );
                }
            }
            Err(e) => {
                self.metrics.record_upload(false);
                tracing::error!(message = "write records failed", error = %e);
            }
        }

        self.state.last_upload_at = Some(now);
        true
    }
}
