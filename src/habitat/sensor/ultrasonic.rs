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

use crate::sensor::core::{DistanceCm, EchoPin, SensorError, SensorErrorKind, TriggerPin};
use std::fmt::{Debug, Formatter};
use std::thread;
use std::time::{Duration, Instant};

/// Speed of sound in air at roughly 20c, in centimeters per second.
const SPEED_OF_SOUND_CM_PER_SEC: f64 = 34_300.0;
const TRIGGER_PULSE: Duration = Duration::from_micros(10);
pub const DEFAULT_ECHO_TIMEOUT: Duration = Duration::from_millis(100);

/// Measure distance with an HC-SR04 style ultrasonic sensor.
///
/// A 10us pulse on the trigger line makes the sensor emit a burst of sound. The
/// sensor then holds the echo line high until it hears the reflection, so the
/// length of the high period is the round trip time of the sound.
pub struct UltrasonicRanger {
    trigger: Box<dyn TriggerPin + Send + Sync + 'static>,
    echo: Box<dyn EchoPin + Send + Sync + 'static>,
    timeout: Duration,
}

impl UltrasonicRanger {
    pub fn from_pins<T, E>(trigger: T, echo: E) -> Self
    where
        T: TriggerPin + Send + Sync + 'static,
        E: EchoPin + Send + Sync + 'static,
    {
        Self {
            trigger: Box::new(trigger),
            echo: Box::new(echo),
            timeout: DEFAULT_ECHO_TIMEOUT,
        }
    }

    /// Give up on a ranging cycle if the echo hasn't completed within `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Range the distance to the nearest surface, blocking the calling thread until
    /// the echo returns or the timeout elapses.
    pub fn read(&mut self) -> Result<DistanceCm, SensorError> {
        self.trigger.set_high();
        thread::sleep(TRIGGER_PULSE);
        self.trigger.set_low();

        let deadline = Instant::now() + self.timeout;

        let mut start = Instant::now();
        while !self.echo.is_high() {
            start = Instant::now();
            if start >= deadline {
                return Err(SensorError::KindMsg(
                    SensorErrorKind::ReadTimeout,
                    "timeout waiting for echo to start",
                ));
            }
        }

        let mut stop = start;
        while self.echo.is_high() {
            stop = Instant::now();
            if stop >= deadline {
                return Err(SensorError::KindMsg(
                    SensorErrorKind::ReadTimeout,
                    "timeout waiting for echo to end",
                ));
            }
        }

        Self::distance(start, stop)
    }

    /// Convert the start and end of the echo pulse into a one-way distance.
    ///
    /// An echo that ends before (or at the same instant) it starts is a ranging
    /// artifact rather than a real measurement.
    fn distance(start: Instant, stop: Instant) -> Result<DistanceCm, SensorError> {
        match stop.checked_duration_since(start) {
            Some(elapsed) if !elapsed.is_zero() => {
                let distance = DistanceCm::from(elapsed.as_secs_f64() * SPEED_OF_SOUND_CM_PER_SEC / 2.0);
                tracing::debug!(
                    message = "measured echo pulse",
                    elapsed_us = elapsed.as_micros() as u64,
                    distance = %distance
                );
                Ok(distance)
            }
            _ => Err(SensorError::KindMsg(
                SensorErrorKind::Ranging,
                "echo pulse ended before it started",
            )),
        }
    }
}

impl Drop for UltrasonicRanger {
    fn drop(&mut self) {
        self.trigger.set_low();
        tracing::debug!(
            message = "released ultrasonic sensor pins",
            trigger = self.trigger.pin(),
            echo = self.echo.pin()
        );
    }
}

impl Debug for UltrasonicRanger {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UltrasonicRanger")
            .field("trigger", &self.trigger.pin())
            .field("echo", &self.echo.pin())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::UltrasonicRanger;
    use crate::sensor::core::{DistanceCm, SensorErrorKind};
    use crate::sensor::test::{PulseEchoPin, RecordingTriggerPin};
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    #[test]
    fn test_distance_from_round_trip() {
        let start = Instant::now();
        let stop = start + Duration::from_millis(1);

        let distance = UltrasonicRanger::distance(start, stop).unwrap();
        assert!((f64::from(distance) - 17.15).abs() < 1e-9);
    }

    #[test]
    fn test_distance_reversed_pulse() {
        let stop = Instant::now();
        let start = stop + Duration::from_micros(50);

        let res = UltrasonicRanger::distance(start, stop);
        assert_eq!(SensorErrorKind::Ranging, res.unwrap_err().kind());
    }

    #[test]
    fn test_distance_zero_length_pulse() {
        let start = Instant::now();

        let res = UltrasonicRanger::distance(start, start);
        assert_eq!(SensorErrorKind::Ranging, res.unwrap_err().kind());
    }

    #[test]
    fn test_read_no_echo() {
        let trigger = RecordingTriggerPin::default();
        let mut ranger =
            UltrasonicRanger::from_pins(trigger.clone(), PulseEchoPin::silent()).with_timeout(Duration::from_millis(5));

        let res = ranger.read();

        assert_eq!(SensorErrorKind::ReadTimeout, res.unwrap_err().kind());
        assert_eq!(1, trigger.pulses.load(Ordering::SeqCst));
        assert!(!trigger.high.load(Ordering::SeqCst));
    }

    #[test]
    fn test_read_echo() {
        let trigger = RecordingTriggerPin::default();
        let mut ranger = UltrasonicRanger::from_pins(trigger, PulseEchoPin::new(10, 5_000));

        let distance = ranger.read().unwrap();
        assert!(distance > DistanceCm::from(0.0));
    }

    #[test]
    fn test_drop_leaves_trigger_low() {
        let trigger = RecordingTriggerPin::default();
        trigger.high.store(true, Ordering::SeqCst);

        let ranger = UltrasonicRanger::from_pins(trigger.clone(), PulseEchoPin::silent());
        drop(ranger);

        assert!(!trigger.high.load(Ordering::SeqCst));
    }
}
