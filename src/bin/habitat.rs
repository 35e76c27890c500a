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


use axum::routing::get;
use axum::Router;
use clap::Parser;
use habitat::alert::{self, AlertChannel, IftttAlerts, DEFAULT_ALERT_TIMEOUT, DEFAULT_IFTTT_EVENT};
use habitat::config::Settings;
use habitat::http::{https_client, RequestState};
use habitat::metrics::HabitatMetrics;
use habitat::monitor::{HabitatMonitor, MonitorConfig};
use habitat::reading::WaterCalibration;
use habitat::sensor::{GpioSensors, PinLayout};
use habitat::sink::{self, HttpTimeSeriesSink, MetricsSink, Retention, TimeSeriesConfig, DEFAULT_DATABASE, DEFAULT_TABLE};
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::{io, process};
use tokio::signal::unix::{self, SignalKind};
use tokio::{task, time};
use tower_http::trace::TraceLayer;
use tracing::Level;

const DEFAULT_BASKING_PIN: u8 = 6;
const DEFAULT_COOLING_PIN: u8 = 5;
const DEFAULT_TRIGGER_PIN: u8 = 18;
const DEFAULT_ECHO_PIN: u8 = 24;
const DEFAULT_POLL_SECS: u64 = 30;
const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_HABITAT_NAME: &str = "desert";
const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

/// Monitor temperature, humidity, and water level of a terrarium
///
/// Read two DHT22 temperature and humidity sensors and an ultrasonic distance
/// sensor over the water dish, connected to the GPIO pins of a local machine,
/// usually a Raspberry PI. Send a push notification when readings stay outside
/// acceptable limits and periodically upload readings to a time-series backend.
///
/// The numbering of pins (and how pin numbers are provided to habitat) is based
/// on the Broadcom SOC channel.
#[derive(Debug, Parser)]
#[clap(name = "habitat", version = clap::crate_version ! ())]
struct HabitatApplication {
    /// BCM GPIO pin number of the DHT22 sensor at the basking end
    #[arg(long, default_value_t = DEFAULT_BASKING_PIN)]
    basking_pin: u8,

    /// BCM GPIO pin number of the DHT22 sensor at the cooling end
    #[arg(long, default_value_t = DEFAULT_COOLING_PIN)]
    cooling_pin: u8,

    /// BCM GPIO pin number of the ultrasonic sensor trigger line
    #[arg(long, default_value_t = DEFAULT_TRIGGER_PIN)]
    trigger_pin: u8,

    /// BCM GPIO pin number of the ultrasonic sensor echo line
    #[arg(long, default_value_t = DEFAULT_ECHO_PIN)]
    echo_pin: u8,

    /// Read all sensors at this interval, in seconds
    #[arg(long, default_value_t = DEFAULT_POLL_SECS)]
    poll_secs: u64,

    /// JSON file with `notify`, `upload`, and `uploadIntervalSeconds` settings
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Don't send push notifications, overrides the settings file
    #[arg(long)]
    no_notify: bool,

    /// Don't upload readings, overrides the settings file
    #[arg(long)]
    no_upload: bool,

    /// Upload readings at most this often, in seconds. Overrides the settings file
    #[arg(long)]
    upload_interval_secs: Option<u64>,

    /// Webhook key for IFTTT notifications. Required unless notifications are disabled
    #[arg(long, env = "IFTTT_KEY", hide_env_values = true)]
    ifttt_key: Option<String>,

    /// IFTTT event to trigger for notifications
    #[arg(long, default_value_t = DEFAULT_IFTTT_EVENT.to_owned())]
    ifttt_event: String,

    /// Give up sending a notification after this many seconds
    #[arg(long, default_value_t = DEFAULT_ALERT_TIMEOUT.as_secs())]
    notify_timeout_secs: u64,

    /// Base URL of the time-series backend. Required unless uploads are disabled
    #[arg(long)]
    timeseries_endpoint: Option<String>,

    /// Time-series database to write readings to
    #[arg(long, default_value_t = DEFAULT_DATABASE.to_owned())]
    database: String,

    /// Time-series table to write readings to
    #[arg(long, default_value_t = DEFAULT_TABLE.to_owned())]
    table: String,

    /// Value of the `habitat` dimension attached to every reading
    #[arg(long, default_value_t = DEFAULT_HABITAT_NAME.to_owned())]
    habitat_name: String,

    /// Hours readings are kept in the memory store of the time-series backend
    #[arg(long, default_value_t = Retention::default().memory_store_hours)]
    memory_retention_hours: u32,

    /// Days readings are kept in the magnetic store of the time-series backend
    #[arg(long, default_value_t = Retention::default().magnetic_store_days)]
    magnetic_retention_days: u32,

    /// Limit the water level to between 0% and 100% full
    #[arg(long)]
    clamp_water_level: bool,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[arg(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Address to expose Prometheus metrics on. Metrics aren't exposed unless set
    #[arg(long)]
    metrics_bind: Option<SocketAddr>,
}

/// Signal that stopped the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Interrupt,
    Terminate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let opts = HabitatApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let settings = match &opts.settings {
        Some(path) => Settings::load(path).unwrap_or_else(|e| {
            tracing::error!(message = "failed to load settings", path = %path.display(), error = %e);
            process::exit(1)
        }),
        None => Settings::default(),
    }
    .with_overrides(opts.no_notify, opts.no_upload, opts.upload_interval_secs);

    tracing::info!(
        message = "loaded settings",
        notify = settings.notify,
        upload = settings.upload,
        upload_interval_secs = settings.upload_interval_seconds
    );

    let layout = PinLayout {
        basking: opts.basking_pin,
        cooling: opts.cooling_pin,
        trigger: opts.trigger_pin,
        echo: opts.echo_pin,
    };

    let (sensors, released) = GpioSensors::new(layout).unwrap_or_else(|e| {
        tracing::error!(message = "failed to initialize sensor pins", pins = ?layout, error = %e);
        process::exit(1)
    });

    let client = https_client();
    let alerts: Box<dyn AlertChannel + Send + Sync> = if settings.notify {
        let key = opts.ifttt_key.as_deref().unwrap_or_else(|| {
            tracing::error!("notifications enabled but no IFTTT key set, use --ifttt-key or IFTTT_KEY");
            process::exit(1)
        });

        Box::new(
            IftttAlerts::new(client.clone(), &opts.ifttt_event, key)
                .with_timeout(Duration::from_secs(opts.notify_timeout_secs)),
        )
    } else {
        Box::new(alert::Disabled)
    };

    let sink: Box<dyn MetricsSink + Send + Sync> = if settings.upload {
        let endpoint = opts.timeseries_endpoint.as_deref().unwrap_or_else(|| {
            tracing::error!("uploads enabled but no time-series endpoint set, use --timeseries-endpoint");
            process::exit(1)
        });

        let mut config = TimeSeriesConfig::new(endpoint);
        config.database = opts.database.clone();
        config.table = opts.table.clone();
        config.dimensions = vec![("habitat".to_owned(), opts.habitat_name.clone())];
        config.retention = Retention {
            memory_store_hours: opts.memory_retention_hours,
            magnetic_store_days: opts.magnetic_retention_days,
        };

        Box::new(HttpTimeSeriesSink::connect(client, config).await)
    } else {
        Box::new(sink::Disabled)
    };

    let mut registry = <Registry>::default();
    let metrics = HabitatMetrics::new(&mut registry);

    if let Some(addr) = opts.metrics_bind {
        let state = Arc::new(RequestState { registry });
        let app = Router::new()
            .route("/metrics", get(habitat::http::text_metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let server = axum::Server::try_bind(&addr)
            .map(|s| s.serve(app.into_make_service()))
            .unwrap_or_else(|e| {
                tracing::error!(message = "error starting metrics server", address = %addr, err = %e);
                process::exit(1)
            });

        tracing::info!(message = "starting metrics server", address = %addr);
        task::spawn(async move {
            if let Err(e) = server.await {
                tracing::error!(message = "metrics server failed", err = %e);
            }
        });
    }

    let config = MonitorConfig {
        notify: settings.notify,
        upload: settings.upload,
        upload_interval: settings.upload_interval(),
        poll_interval: Duration::from_secs(opts.poll_secs),
        calibration: WaterCalibration {
            clamp: opts.clamp_water_level,
            ..Default::default()
        },
        ..Default::default()
    };

    let mut monitor = HabitatMonitor::new(config, sensors, alerts, sink, metrics);
    tracing::info!(message = "starting monitor", pins = ?layout, poll_secs = opts.poll_secs);

    let res = monitor.run(shutdown()).await;

    // A read interrupted by shutdown holds the pins until it finishes, wait for
    // them to be reset before exiting
    drop(monitor);
    if time::timeout(RELEASE_TIMEOUT, released.wait()).await.is_err() {
        tracing::warn!(message = "timed out waiting for GPIO pins to be released", timeout = ?RELEASE_TIMEOUT);
    }

    match res {
        Ok(Signal::Terminate) => {
            tracing::info!("monitor stopped");
            Ok(())
        }
        Ok(Signal::Interrupt) => {
            tracing::info!("monitor interrupted");
            process::exit(1)
        }
        Err(e) => {
            tracing::error!(message = "monitor failed", kind = e.as_label(), error = %e);
            process::exit(1)
        }
    }
}

/// Wait for either SIGTERM or SIGINT, whichever comes first
async fn shutdown() -> Signal {
    tokio::select! {
        _ = sigterm() => Signal::Terminate,
        _ = sigint() => Signal::Interrupt,
    }
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}
