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

use crate::sensor::core::{
    open_echo_pin, open_pin, open_trigger_pin, DistanceCm, Humidity, SensorError, SensorErrorKind, SensorId,
    SensorPort, TemperatureCelsius,
};
use crate::sensor::dht22::DHT22Sensor;
use crate::sensor::ultrasonic::UltrasonicRanger;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tokio::task;
use tracing::{Instrument, Level};

/// BCM GPIO pin numbers of every sensor in the enclosure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinLayout {
    pub basking: u8,
    pub cooling: u8,
    pub trigger: u8,
    pub echo: u8,
}

#[derive(Debug)]
struct Devices {
    basking: DHT22Sensor,
    cooling: DHT22Sensor,
    ranger: UltrasonicRanger,
    // Fields drop in order, so this closes only after every pin has been reset
    released: oneshot::Sender<()>,
}

impl Drop for Devices {
    fn drop(&mut self) {
        tracing::info!(
            message = "releasing GPIO pins",
            basking = ?self.basking,
            cooling = ?self.cooling,
            ranger = ?self.ranger
        );
    }
}

impl Devices {
    fn climate(&mut self, sensor: SensorId) -> &mut DHT22Sensor {
        match sensor {
            SensorId::Basking => &mut self.basking,
            SensorId::Cooling => &mut self.cooling,
        }
    }
}

/// Completes once every pin held by a `GpioSensors` has been returned to its
/// original state.
///
/// A read running on the blocking thread pool keeps the pins until it finishes,
/// even after the `GpioSensors` that started it has been dropped.
#[derive(Debug)]
pub struct PinRelease(oneshot::Receiver<()>);

impl PinRelease {
    pub async fn wait(self) {
        // Nothing is ever sent, the sender closing is the signal
        let _ = self.0.await;
    }
}

/// Sensors wired to the GPIO header of the local machine.
///
/// Pins are held for as long as this value (or a read it started) lives.
/// Dropping it returns every pin to its original state, which is how hardware
/// gets released on shutdown. Use the `PinRelease` returned alongside it to
/// wait for that to happen.
#[derive(Debug)]
pub struct GpioSensors {
    layout: PinLayout,
    devices: Arc<Mutex<Devices>>,
}

impl GpioSensors {
    pub fn new(layout: PinLayout) -> Result<(Self, PinRelease), SensorError> {
        Ok(Self::from_devices(
            layout,
            DHT22Sensor::from_pin(open_pin(layout.basking)?),
            DHT22Sensor::from_pin(open_pin(layout.cooling)?),
            UltrasonicRanger::from_pins(open_trigger_pin(layout.trigger)?, open_echo_pin(layout.echo)?),
        ))
    }

    pub(crate) fn from_devices(
        layout: PinLayout,
        basking: DHT22Sensor,
        cooling: DHT22Sensor,
        ranger: UltrasonicRanger,
    ) -> (Self, PinRelease) {
        let (tx, rx) = oneshot::channel();
        let devices = Devices {
            basking,
            cooling,
            ranger,
            released: tx,
        };

        let sensors = Self {
            layout,
            devices: Arc::new(Mutex::new(devices)),
        };

        (sensors, PinRelease(rx))
    }

    /// Run a bit-banged read on the blocking thread pool since it busy-waits on
    /// the data line.
    async fn blocking<T, F>(&self, f: F) -> Result<T, SensorError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Devices) -> Result<T, SensorError> + Send + 'static,
    {
        let devices = self.devices.clone();
        task::spawn_blocking(move || {
            let mut guard = devices.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .map_err(|e| SensorError::KindMsgCause(SensorErrorKind::Interrupted, "sensor read task failed", Box::new(e)))?
    }
}

#[async_trait]
impl SensorPort for GpioSensors {
    async fn read_climate(&mut self, sensor: SensorId) -> Result<(TemperatureCelsius, Humidity), SensorError> {
        let pin = match sensor {
            SensorId::Basking => self.layout.basking,
            SensorId::Cooling => self.layout.cooling,
        };

        self.blocking(move |d| d.climate(sensor).read())
            .instrument(tracing::span!(Level::DEBUG, "climate_read", sensor = %sensor, pin = pin))
            .await
    }

    async fn read_distance(&mut self) -> Result<DistanceCm, SensorError> {
        self.blocking(|d| d.ranger.read())
            .instrument(tracing::span!(Level::DEBUG, "distance_read", trigger = self.layout.trigger))
            .await
    }
}
