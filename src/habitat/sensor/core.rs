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

use std::error::Error;
use std::fmt::{self, Formatter};

use async_trait::async_trait;
use rppal::gpio::{Gpio, InputPin, IoPin, Mode, OutputPin, Pin};

/// Temperature, in degrees celsius
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(transparent)]
pub struct TemperatureCelsius(f64);

impl From<TemperatureCelsius> for f64 {
    fn from(v: TemperatureCelsius) -> Self {
        v.0
    }
}

impl From<f64> for TemperatureCelsius {
    fn from(v: f64) -> Self {
        Self(v)
    }
}

impl fmt::Display for TemperatureCelsius {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}c", self.0)
    }
}

/// Temperature, in degrees fahrenheit
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct TemperatureFahrenheit(f64);

impl From<TemperatureCelsius> for TemperatureFahrenheit {
    fn from(c: TemperatureCelsius) -> Self {
        Self(c.0 * 9.0 / 5.0 + 32.0)
    }
}

impl From<TemperatureFahrenheit> for f64 {
    fn from(v: TemperatureFahrenheit) -> Self {
        v.0
    }
}

impl From<f64> for TemperatureFahrenheit {
    fn from(v: f64) -> Self {
        Self(v)
    }
}

impl fmt::Display for TemperatureFahrenheit {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}f", self.0)
    }
}

/// Relative humidity (from 0 to 100)
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(transparent)]
pub struct Humidity(f64);

impl From<Humidity> for f64 {
    fn from(v: Humidity) -> Self {
        v.0
    }
}

impl From<f64> for Humidity {
    fn from(v: f64) -> Self {
        Self(v)
    }
}

impl fmt::Display for Humidity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Distance between the ultrasonic sensor and the surface it ranged, in centimeters
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct DistanceCm(f64);

impl From<DistanceCm> for f64 {
    fn from(v: DistanceCm) -> Self {
        v.0
    }
}

impl From<f64> for DistanceCm {
    fn from(v: f64) -> Self {
        Self(v)
    }
}

impl fmt::Display for DistanceCm {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}cm", self.0)
    }
}

/// Which of the two climate sensors in the enclosure to read.
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum SensorId {
    /// Warm end of the enclosure, under the basking lamp
    Basking,
    /// Cool end of the enclosure
    Cooling,
}

impl SensorId {
    pub fn as_label(&self) -> &'static str {
        match self {
            SensorId::Basking => "basking",
            SensorId::Cooling => "cooling",
        }
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.as_label().fmt(f)
    }
}

/// Potential kinds of errors that can be encountered reading from a sensor
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum SensorErrorKind {
    Initialization,
    ReadTimeout,
    Checksum,
    Ranging,
    Interrupted,
}

impl SensorErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            SensorErrorKind::Initialization => "initialization",
            SensorErrorKind::ReadTimeout => "timeout",
            SensorErrorKind::Checksum => "checksum",
            SensorErrorKind::Ranging => "ranging",
            SensorErrorKind::Interrupted => "interrupted",
        }
    }
}

/// Error initializing or reading a sensor attached to GPIO pins
#[derive(Debug)]
pub enum SensorError {
    CheckSum(u8, u8),
    KindMsg(SensorErrorKind, &'static str),
    KindMsgCause(SensorErrorKind, &'static str, Box<dyn Error + Send + Sync>),
}

impl SensorError {
    pub fn kind(&self) -> SensorErrorKind {
        match self {
            SensorError::CheckSum(_, _) => SensorErrorKind::Checksum,
            SensorError::KindMsg(kind, _) => *kind,
            SensorError::KindMsgCause(kind, _, _) => *kind,
        }
    }
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SensorError::CheckSum(expected, got) => {
                write!(f, "checksum error: expected {}, got {}", expected, got)
            }
            SensorError::KindMsg(_, msg) => msg.fmt(f),
            SensorError::KindMsgCause(_, msg, ref e) => write!(f, "{}: {}", msg, e),
        }
    }
}

impl Error for SensorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SensorError::KindMsgCause(_, _, ref e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Source of raw climate and distance readings for the enclosure.
///
/// Implementations only perform a single read per call. Retrying reads that
/// fail transiently is left to the caller.
#[async_trait]
pub trait SensorPort {
    /// Read temperature and humidity from one of the two climate sensors.
    async fn read_climate(&mut self, sensor: SensorId) -> Result<(TemperatureCelsius, Humidity), SensorError>;

    /// Range the distance from the ultrasonic sensor to the water surface.
    async fn read_distance(&mut self) -> Result<DistanceCm, SensorError>;
}

fn acquire_pin(bcm_gpio_pin: u8) -> Result<Pin, SensorError> {
    let controller = Gpio::new().map_err(|e| {
        SensorError::KindMsgCause(
            SensorErrorKind::Initialization,
            "unable to create GPIO controller",
            Box::new(e),
        )
    })?;

    controller.get(bcm_gpio_pin).map_err(|e| {
        SensorError::KindMsgCause(
            SensorErrorKind::Initialization,
            "unable to acquire pin from controller",
            Box::new(e),
        )
    })
}

/// Create a new bidirectional `IoPin` based on the BCM GPIO pin number of the
/// data wire of a DHT22 sensor.
///
/// Note that the BCM GPIO pin number is NOT the same as the physical pin number.
/// See [pinout] for more information.
///
/// [pinout]: https://www.raspberrypi.com/documentation/computers/os.html#gpio-and-the-40-pin-header
pub fn open_pin(bcm_gpio_pin: u8) -> Result<IoPin, SensorError> {
    Ok(acquire_pin(bcm_gpio_pin)?.into_io(Mode::Input))
}

/// Create a new `OutputPin`, initially low, for the trigger line of an ultrasonic sensor.
pub fn open_trigger_pin(bcm_gpio_pin: u8) -> Result<OutputPin, SensorError> {
    Ok(acquire_pin(bcm_gpio_pin)?.into_output_low())
}

/// Create a new `InputPin` for the echo line of an ultrasonic sensor.
pub fn open_echo_pin(bcm_gpio_pin: u8) -> Result<InputPin, SensorError> {
    Ok(acquire_pin(bcm_gpio_pin)?.into_input())
}

/// Abstraction around an `rppal::gpio::IoPin` to allow for easier testing.
pub trait DataPin {
    fn is_low(&self) -> bool;
    fn is_high(&self) -> bool;
    fn pin(&self) -> u8;
    fn set_high(&mut self);
    fn set_low(&mut self);
    fn set_mode(&mut self, mode: Mode);
}

impl DataPin for IoPin {
    fn is_low(&self) -> bool {
        IoPin::is_low(self)
    }

    fn is_high(&self) -> bool {
        IoPin::is_high(self)
    }

    fn pin(&self) -> u8 {
        IoPin::pin(self)
    }

    fn set_high(&mut self) {
        IoPin::set_high(self);
    }

    fn set_low(&mut self) {
        IoPin::set_low(self);
    }

    fn set_mode(&mut self, mode: Mode) {
        IoPin::set_mode(self, mode);
    }
}

/// Output line used to start an ultrasonic ranging cycle.
pub trait TriggerPin {
    fn pin(&self) -> u8;
    fn set_high(&mut self);
    fn set_low(&mut self);
}

impl TriggerPin for OutputPin {
    fn pin(&self) -> u8 {
        OutputPin::pin(self)
    }

    fn set_high(&mut self) {
        OutputPin::set_high(self);
    }

    fn set_low(&mut self) {
        OutputPin::set_low(self);
    }
}

/// Input line held high by an ultrasonic sensor for as long as the echo took to return.
pub trait EchoPin {
    fn pin(&self) -> u8;
    fn is_high(&self) -> bool;
}

impl EchoPin for InputPin {
    fn pin(&self) -> u8 {
        InputPin::pin(self)
    }

    fn is_high(&self) -> bool {
        InputPin::is_high(self)
    }
}
