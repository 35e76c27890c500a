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

use crate::sensor::core::{DataPin, Humidity, SensorError, SensorErrorKind, TemperatureCelsius};
use rppal::gpio::Mode;
use std::fmt::{Debug, Formatter};
use std::thread;
use std::time::Duration;

/// Busy-loop iterations to wait for the data line to change state before giving up.
pub(crate) const MAX_CYCLES: u32 = 32_000;
/// Low/high transitions sent per frame: one acknowledgement plus 40 data bits.
pub(crate) const TRANSITIONS: usize = 41;
pub(crate) const FRAME_BYTES: usize = 5;

/// How long the data line spent low and high for each transition of a frame.
#[derive(Debug)]
struct PulseCounts {
    low: [u32; TRANSITIONS],
    high: [u32; TRANSITIONS],
}

impl PulseCounts {
    /// Sample the data line until every transition of a frame has been seen.
    ///
    /// The pin must already have been put in input mode after the start signal.
    /// If the line gets stuck in either state, a timeout error is returned and
    /// the read should be retried.
    fn capture(pin: &dyn DataPin) -> Result<Self, SensorError> {
        let mut low = [0u32; TRANSITIONS];
        let mut high = [0u32; TRANSITIONS];

        for i in 0..TRANSITIONS {
            while pin.is_low() {
                low[i] += 1;
                if low[i] >= MAX_CYCLES {
                    return Err(SensorError::KindMsg(
                        SensorErrorKind::ReadTimeout,
                        "timeout waiting for low pulse capture",
                    ));
                }
            }

            while pin.is_high() {
                high[i] += 1;
                if high[i] >= MAX_CYCLES {
                    return Err(SensorError::KindMsg(
                        SensorErrorKind::ReadTimeout,
                        "timeout waiting for high pulse capture",
                    ));
                }
            }
        }

        tracing::trace!(message = "captured data line pulses", low = ?low, high = ?high);
        Ok(Self { low, high })
    }

    /// Average time spent low across the 40 data bits.
    ///
    /// Every bit starts with a low period of the same length, so a high period longer
    /// than this is a `1` and a shorter one is a `0`.
    fn bit_threshold(&self) -> u32 {
        let data = &self.low[1..];
        data.iter().sum::<u32>() / data.len() as u32
    }
}

/// Five bytes sent by the sensor: humidity (2), temperature (2), checksum (1).
#[derive(Debug)]
struct Frame {
    bytes: [u8; FRAME_BYTES],
}

impl Frame {
    fn decode(pulses: &PulseCounts) -> Result<Self, SensorError> {
        let threshold = pulses.bit_threshold();
        let mut bytes = [0u8; FRAME_BYTES];

        // Skip the acknowledgement, bits arrive most significant first.
        for (i, &count) in pulses.high[1..].iter().enumerate() {
            let byte = &mut bytes[i / 8];
            *byte <<= 1;
            if count >= threshold {
                *byte |= 1;
            }
        }

        Self::verify(&bytes)?;
        Ok(Self { bytes })
    }

    /// The last byte must equal the low 8 bits of the sum of the first four.
    fn verify(bytes: &[u8; FRAME_BYTES]) -> Result<(), SensorError> {
        let expected = bytes[4];
        let computed = bytes[..4].iter().fold(0u8, |acc, &b| acc.wrapping_add(b));

        tracing::debug!(
            message = "verifying sensor frame checksum",
            computed = computed,
            expected = expected
        );

        if computed == expected {
            Ok(())
        } else {
            Err(SensorError::CheckSum(expected, computed))
        }
    }
}

impl From<Frame> for (TemperatureCelsius, Humidity) {
    /// Convert a verified frame into temperature and humidity.
    ///
    /// See https://cdn-shop.adafruit.com/datasheets/Digital+humidity+and+temperature+sensor+AM2302.pdf
    fn from(frame: Frame) -> Self {
        let b = frame.bytes;
        // Both values are tenths of a unit, the top bit of temperature is a sign bit.
        let raw_humidity = u16::from_be_bytes([b[0], b[1]]);
        let raw_temperature = u16::from_be_bytes([b[2] & 0x7F, b[3]]);

        let sign = if b[2] & 0x80 != 0 { -1.0 } else { 1.0 };
        let humidity = Humidity::from(f64::from(raw_humidity) / 10.0);
        let temperature = TemperatureCelsius::from(sign * f64::from(raw_temperature) / 10.0);

        tracing::debug!(
            message = "decoded sensor frame",
            raw_temperature = raw_temperature,
            raw_humidity = raw_humidity,
            temperature = %temperature,
            humidity = %humidity
        );

        (temperature, humidity)
    }
}

/// Read temperature in degrees celsius and relative humidity from a DHT22 sensor
pub struct DHT22Sensor {
    pin: Box<dyn DataPin + Send + Sync + 'static>,
}

impl DHT22Sensor {
    pub fn from_pin<T>(pin: T) -> Self
    where
        T: DataPin + Send + Sync + 'static,
    {
        Self { pin: Box::new(pin) }
    }

    /// Wake the sensor and ask it to transmit a frame.
    fn start_signal(&mut self) {
        self.pin.set_mode(Mode::Output);
        self.pin.set_high();
        thread::sleep(Duration::from_millis(10));
        // At least 1ms low is the actual request
        self.pin.set_low();
        thread::sleep(Duration::from_millis(20));
        self.pin.set_high();
        thread::sleep(Duration::from_micros(30));
        self.pin.set_mode(Mode::Input);
    }

    /// Read temperature and humidity from the sensor, blocking the calling thread
    /// for roughly 30ms.
    ///
    /// The sensor cannot be read more often than every two seconds and frequently
    /// returns garbled frames, so callers should expect to retry.
    pub fn read(&mut self) -> Result<(TemperatureCelsius, Humidity), SensorError> {
        self.start_signal();
        let pulses = PulseCounts::capture(self.pin.as_ref())?;
        let frame = Frame::decode(&pulses)?;
        Ok(frame.into())
    }
}

impl Debug for DHT22Sensor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DHT22Sensor").field("pin", &self.pin.pin()).finish()
    }
}
