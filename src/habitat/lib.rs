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


//! Monitor the temperature, humidity, and water level of a desert terrarium.
//!
//! ## Features
//!
//! Habitat reads two [DHT22 sensors](https://learn.adafruit.com/dht), one at the basking
//! (hot) end of the enclosure and one at the cooling end, along with an HC-SR04 style
//! ultrasonic sensor pointed at the surface of the water dish. It is meant to be run on
//! a Raspberry PI (3 or 4) mounted next to the enclosure.
//!
//! Every `30s` all sensors are read and the readings checked against acceptable limits:
//!
//! * Basking temperature between `75.5°F` and `102°F`.
//! * Cooling temperature between `68°F` and `95°F`.
//! * Water dish at least `15.9%` full.
//!
//! When readings stay outside these limits for more than 30 minutes, a push notification
//! is sent via an [IFTTT](https://ifttt.com/maker_webhooks) webhook. At most one notification
//! is sent every 4 hours. A sensor that can't be read after repeated retries causes an
//! immediate notification and stops the monitor.
//!
//! Readings are uploaded to a time-series backend every 10 minutes for graphing.
//!
//! ## Build
//!
//! `habitat` is a Rust program and must be built from source using a [Rust toolchain](https://rustup.rs/)
//! . Since it's meant to be run on a Raspberry PI, you will also likely need to cross-compile it.
//!
//! ```text
//! rustup target add armv7-unknown-linux-musleabihf
//! cargo build --release --target armv7-unknown-linux-musleabihf
//! ```
//!
//! ## Run
//!
//! In order to read and write the device `/dev/gpiomem`, `habitat` must run as `root`.
//! The webhook key is read from the `IFTTT_KEY` environment variable.
//!
//! ```text
//! sudo IFTTT_KEY=... habitat --timeseries-endpoint https://timeseries.example.com
//! ```
//!
//! Notifications and uploads can be turned off with `--no-notify` and `--no-upload`, or
//! with a JSON settings file passed via `--settings`:
//!
//! ```json
//! {"notify": true, "upload": false, "uploadIntervalSeconds": 600}
//! ```
//!
//! ### Prometheus
//!
//! When started with `--metrics-bind`, the most recent readings and counts of read errors,
//! notifications, and uploads are exposed as Prometheus metrics at `/metrics`.
//!

pub mod alert;
pub mod config;
pub mod http;
pub mod metrics;
pub mod monitor;
pub mod policy;
pub mod reading;
pub mod sensor;
pub mod sink;
