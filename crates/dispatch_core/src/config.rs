//! Dispatch configuration: tariffs, customer-side pricing, stations and timeouts.
//!
//! Every field has a default, so a JSON document only needs the values it
//! overrides. Builder-style `with_*` methods cover programmatic setups.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use h3o::Resolution;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::LocationId;
use crate::pricing::{PricingPolicy, TariffTable};

/// Default window a matched driver has to accept: 30 seconds.
const DEFAULT_ACCEPTANCE_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationConfig {
    pub id: LocationId,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub tariffs: TariffTable,
    pub pricing: PricingPolicy,
    pub acceptance_timeout_ms: u64,
    /// Length of generated start/end codes.
    pub otp_digits: u8,
    /// H3 resolution used to snap drop locations (9 ≈ 240m cells).
    pub h3_resolution: u8,
    pub stations: Vec<StationConfig>,
    /// Initial surge factor per station; stations not listed start at 1.0.
    pub surge: HashMap<LocationId, f64>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tariffs: TariffTable::default(),
            pricing: PricingPolicy::default(),
            acceptance_timeout_ms: DEFAULT_ACCEPTANCE_TIMEOUT_MS,
            otp_digits: 4,
            h3_resolution: 9,
            stations: Vec::new(),
            surge: HashMap::new(),
        }
    }
}

impl DispatchConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn with_station(mut self, id: &str, name: &str, lat: f64, lng: f64) -> Self {
        self.stations.push(StationConfig {
            id: LocationId::new(id),
            name: name.to_string(),
            lat,
            lng,
        });
        self
    }

    pub fn with_pricing(mut self, commission_pct: f64, gst_pct: f64) -> Self {
        self.pricing = PricingPolicy {
            commission_pct,
            gst_pct,
        };
        self
    }

    pub fn with_tariffs(mut self, tariffs: TariffTable) -> Self {
        self.tariffs = tariffs;
        self
    }

    pub fn with_acceptance_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.acceptance_timeout_ms = timeout_ms;
        self
    }

    pub fn with_otp_digits(mut self, digits: u8) -> Self {
        self.otp_digits = digits;
        self
    }

    pub fn with_surge(mut self, location: &str, factor: f64) -> Self {
        self.surge.insert(LocationId::new(location), factor);
        self
    }

    pub fn resolution(&self) -> Result<Resolution, ConfigError> {
        Resolution::try_from(self.h3_resolution).map_err(|_| {
            ConfigError::Invalid(format!("h3_resolution {} is out of range", self.h3_resolution))
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.resolution()?;
        if self.acceptance_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "acceptance_timeout_ms must be positive".to_string(),
            ));
        }
        if !(4..=9).contains(&self.otp_digits) {
            return Err(ConfigError::Invalid(format!(
                "otp_digits must be between 4 and 9 (got {})",
                self.otp_digits
            )));
        }
        for (name, value) in [
            ("commission_pct", self.pricing.commission_pct),
            ("gst_pct", self.pricing.gst_pct),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a non-negative percentage"
                )));
            }
        }
        let mut seen = HashSet::new();
        for station in &self.stations {
            if !seen.insert(&station.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate station id {}",
                    station.id
                )));
            }
        }
        for (location, factor) in &self.surge {
            if !seen.contains(location) {
                return Err(ConfigError::Invalid(format!(
                    "surge configured for unknown station {location}"
                )));
            }
            if !factor.is_finite() || *factor < 1.0 {
                return Err(ConfigError::Invalid(format!(
                    "surge for {location} must be at least 1.0"
                )));
            }
        }
        Ok(())
    }
}
