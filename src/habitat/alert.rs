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

use crate::http::{send_json, HttpError, HttpsClient};
use async_trait::async_trait;
use hyper::{Method, StatusCode};
use serde::Serialize;
use std::error::Error;
use std::fmt::{self, Formatter};
use std::time::Duration;

pub const DEFAULT_IFTTT_URL: &str = "https://maker.ifttt.com";
pub const DEFAULT_IFTTT_EVENT: &str = "habitat_low_temp";
pub const DEFAULT_ALERT_TIMEOUT: Duration = Duration::from_secs(10);

/// Error delivering a push notification.
#[derive(Debug)]
pub enum AlertError {
    Http(HttpError),
    Status(StatusCode),
}

impl fmt::Display for AlertError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AlertError::Http(e) => write!(f, "unable to send notification: {}", e),
            AlertError::Status(s) => write!(f, "notification rejected with status {}", s),
        }
    }
}

impl Error for AlertError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AlertError::Http(e) => Some(e),
            AlertError::Status(_) => None,
        }
    }
}

impl From<HttpError> for AlertError {
    fn from(e: HttpError) -> Self {
        AlertError::Http(e)
    }
}

/// Destination for push notifications about the enclosure.
///
/// Implementations must return in bounded time, even when the remote service
/// is unreachable.
#[async_trait]
pub trait AlertChannel {
    async fn notify(&self, message: &str) -> Result<(), AlertError>;
}

#[async_trait]
impl<T> AlertChannel for Box<T>
where
    T: AlertChannel + Send + Sync + ?Sized,
{
    async fn notify(&self, message: &str) -> Result<(), AlertError> {
        (**self).notify(message).await
    }
}

/// Alert channel used when notifications are turned off. Never sends anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Disabled;

#[async_trait]
impl AlertChannel for Disabled {
    async fn notify(&self, message: &str) -> Result<(), AlertError> {
        tracing::debug!(message = "notifications disabled, dropping", notification = message);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    message: &'a str,
}

/// Send notifications by triggering an IFTTT Maker webhook event.
///
/// The event is triggered with a JSON body of the form `{"message": "..."}` that
/// an applet can forward as a push notification.
pub struct IftttAlerts {
    client: HttpsClient,
    base_url: String,
    event: String,
    key: String,
    timeout: Duration,
}

impl IftttAlerts {
    pub fn new(client: HttpsClient, event: &str, key: &str) -> Self {
        Self {
            client,
            base_url: DEFAULT_IFTTT_URL.to_owned(),
            event: event.to_owned(),
            key: key.to_owned(),
            timeout: DEFAULT_ALERT_TIMEOUT,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_owned();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn trigger_url(&self) -> String {
        format!("{}/trigger/{}/json/with/key/{}", self.base_url, self.event, self.key)
    }
}

#[async_trait]
impl AlertChannel for IftttAlerts {
    async fn notify(&self, message: &str) -> Result<(), AlertError> {
        let payload = WebhookPayload { message };
        let res = send_json(&self.client, Method::POST, &self.trigger_url(), &payload, self.timeout).await?;

        if !res.status.is_success() {
            return Err(AlertError::Status(res.status));
        }

        tracing::info!(message = "triggered notification event", event = %self.event, status = %res.status);
        Ok(())
    }
}

impl fmt::Debug for IftttAlerts {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Key is a credential, keep it out of logs
        f.debug_struct("IftttAlerts")
            .field("base_url", &self.base_url)
            .field("event", &self.event)
            .field("timeout", &self.timeout)
            .finish()
    }
}
