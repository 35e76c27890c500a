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

use serde::Deserialize;
use std::error::Error;
use std::fmt::{self, Formatter};
use std::io;
use std::path::Path;
use std::time::Duration;

/// User settings that may be set in a JSON file instead of on the command line.
///
/// Only `notify`, `upload`, and `uploadIntervalSeconds` are recognized, anything
/// else in the file is an error. Missing keys take their default values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Settings {
    pub notify: bool,
    pub upload: bool,
    pub upload_interval_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            notify: true,
            upload: true,
            upload_interval_seconds: 600,
        }
    }
}

impl Settings {
    /// Read settings from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(ConfigError::Io)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(contents).map_err(ConfigError::Parse)
    }

    /// Apply command line overrides. Flags can only turn features off or
    /// replace the interval, never turn a disabled feature back on.
    pub fn with_overrides(mut self, no_notify: bool, no_upload: bool, upload_interval_secs: Option<u64>) -> Self {
        self.notify = self.notify && !no_notify;
        self.upload = self.upload && !no_upload;
        if let Some(secs) = upload_interval_secs {
            self.upload_interval_seconds = secs;
        }

        self
    }

    pub fn upload_interval(&self) -> Duration {
        Duration::from_secs(self.upload_interval_seconds)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(serde_json::Error),
}

impl ConfigError {
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::Io(_) => "io",
            ConfigError::Parse(_) => "parse",
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "unable to read settings: {}", e),
            ConfigError::Parse(e) => write!(f, "invalid settings: {}", e),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
        }
    }
}
