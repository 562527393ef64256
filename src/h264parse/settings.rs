// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::str::FromStr;

use thiserror::Error;

/// Longest allowed `config-interval`, in seconds.
pub const MAX_CONFIG_INTERVAL: u32 = 3600;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    /// Length prefixed NAL units with an `avcC` record.
    Sample,
    /// Annex B start codes.
    ByteStream,
    /// Whatever the input uses.
    #[default]
    Input,
}

impl FromStr for OutputFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sample" | "avc" => Ok(OutputFormat::Sample),
            "byte-stream" | "bytestream" => Ok(OutputFormat::ByteStream),
            "input" => Ok(OutputFormat::Input),
            _ => Err("unrecognized output format. Valid values: sample, byte-stream, input"),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SettingsError {
    #[error("unknown property {0}")]
    UnknownProperty(String),
    #[error("invalid value {value:?} for property {property}")]
    InvalidValue { property: String, value: String },
    #[error("config-interval {0} is out of range 0..=3600")]
    ConfigIntervalOutOfRange(u32),
}

/// Element configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Settings {
    /// Emit each NAL unit of a length prefixed buffer on its own.
    pub split_packetized: bool,
    /// Merge NAL units into access units.
    pub access_unit: bool,
    pub output_format: OutputFormat,
    /// Seconds between SPS/PPS re-insertions in front of IDR pictures. 0
    /// disables it.
    pub config_interval: u32,
}

impl Settings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.config_interval > MAX_CONFIG_INTERVAL {
            return Err(SettingsError::ConfigIntervalOutOfRange(self.config_interval));
        }

        Ok(())
    }

    /// Sets a property by its element name, e.g. `"config-interval"`.
    pub fn set_property(&mut self, name: &str, value: &str) -> Result<(), SettingsError> {
        let invalid = || SettingsError::InvalidValue {
            property: name.to_string(),
            value: value.to_string(),
        };

        match name {
            "split-packetized" => self.split_packetized = value.parse().map_err(|_| invalid())?,
            "access-unit" => self.access_unit = value.parse().map_err(|_| invalid())?,
            "output-format" => self.output_format = value.parse().map_err(|_| invalid())?,
            "config-interval" => {
                let interval: u32 = value.parse().map_err(|_| invalid())?;
                if interval > MAX_CONFIG_INTERVAL {
                    return Err(SettingsError::ConfigIntervalOutOfRange(interval));
                }
                self.config_interval = interval;
            }
            _ => return Err(SettingsError::UnknownProperty(name.to_string())),
        }

        log::debug!("{} set to {}", name, value);
        Ok(())
    }
}
