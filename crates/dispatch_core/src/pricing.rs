//! Fare engine: splits a trip into what the driver earns and what the customer pays.
//!
//! The driver's share depends only on the vehicle tariff and the distance. Surge,
//! commission and GST are layered on top for the customer:
//!
//! ```text
//! raw           = base_fare + max(0, distance_km - base_km) * per_km_rate
//! driver_fare   = round(max(raw, min_fare))
//! surged        = round(driver_fare * surge)
//! commission    = round(surged * commission_pct / 100)
//! gst           = round((surged + commission) * gst_pct / 100)
//! customer_fare = surged + commission + gst
//! ```

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{LocationId, Money, VehicleType};

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum FareError {
    #[error("distance must be a finite, non-negative number of km (got {0})")]
    InvalidDistance(f64),
    #[error("surge factor must be finite and at least 1.0 (got {0})")]
    InvalidSurge(f64),
    #[error("{name} must be a finite, non-negative percentage (got {value})")]
    InvalidRate { name: &'static str, value: f64 },
}

/// Per-vehicle tariff.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleTariff {
    pub base_fare: f64,
    /// Distance covered by the base fare.
    pub base_km: f64,
    pub per_km_rate: f64,
    pub min_fare: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TariffTable {
    pub bike: VehicleTariff,
    pub auto: VehicleTariff,
    pub cab: VehicleTariff,
}

impl Default for TariffTable {
    fn default() -> Self {
        Self {
            bike: VehicleTariff {
                base_fare: 20.0,
                base_km: 2.0,
                per_km_rate: 8.0,
                min_fare: 25.0,
            },
            auto: VehicleTariff {
                base_fare: 40.0,
                base_km: 2.0,
                per_km_rate: 17.0,
                min_fare: 40.0,
            },
            cab: VehicleTariff {
                base_fare: 80.0,
                base_km: 2.0,
                per_km_rate: 22.0,
                min_fare: 90.0,
            },
        }
    }
}

impl TariffTable {
    pub fn get(&self, vehicle_type: VehicleType) -> &VehicleTariff {
        match vehicle_type {
            VehicleType::Bike => &self.bike,
            VehicleType::Auto => &self.auto,
            VehicleType::Cab => &self.cab,
        }
    }
}

/// Every intermediate amount of a fare computation, kept for receipts and audits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FareBreakdown {
    pub raw_fare: f64,
    pub surge_factor: f64,
    pub surged_fare: Money,
    pub commission: Money,
    pub gst: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FareQuote {
    pub vehicle_type: VehicleType,
    pub distance_km: f64,
    pub driver_fare: Money,
    pub customer_fare: Money,
    pub breakdown: FareBreakdown,
}

/// Customer-side pricing knobs applied on top of the driver's fare.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingPolicy {
    pub commission_pct: f64,
    pub gst_pct: f64,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            commission_pct: 10.0,
            gst_pct: 5.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FareEngine {
    tariffs: TariffTable,
}

impl FareEngine {
    pub fn new(tariffs: TariffTable) -> Self {
        Self { tariffs }
    }

    pub fn tariffs(&self) -> &TariffTable {
        &self.tariffs
    }

    /// Surge-independent amount credited to the driver.
    pub fn driver_fare_for(
        &self,
        vehicle_type: VehicleType,
        distance_km: f64,
    ) -> Result<Money, FareError> {
        validate_distance(distance_km)?;
        let tariff = self.tariffs.get(vehicle_type);
        Ok(round_money(raw_fare(tariff, distance_km).max(tariff.min_fare)))
    }

    pub fn min_fare(&self, vehicle_type: VehicleType) -> Money {
        round_money(self.tariffs.get(vehicle_type).min_fare)
    }

    pub fn compute(
        &self,
        vehicle_type: VehicleType,
        distance_km: f64,
        surge_factor: f64,
        commission_pct: f64,
        gst_pct: f64,
    ) -> Result<FareQuote, FareError> {
        validate_distance(distance_km)?;
        if !surge_factor.is_finite() || surge_factor < 1.0 {
            return Err(FareError::InvalidSurge(surge_factor));
        }
        validate_rate("commission_pct", commission_pct)?;
        validate_rate("gst_pct", gst_pct)?;

        let tariff = self.tariffs.get(vehicle_type);
        let raw = raw_fare(tariff, distance_km);
        let driver_fare = round_money(raw.max(tariff.min_fare));
        let surged_fare = round_money(driver_fare as f64 * surge_factor);
        let commission = round_money(surged_fare as f64 * commission_pct / 100.0);
        let gst = round_money((surged_fare + commission) as f64 * gst_pct / 100.0);

        Ok(FareQuote {
            vehicle_type,
            distance_km,
            driver_fare,
            customer_fare: surged_fare + commission + gst,
            breakdown: FareBreakdown {
                raw_fare: raw,
                surge_factor,
                surged_fare,
                commission,
                gst,
            },
        })
    }

    pub fn quote(
        &self,
        vehicle_type: VehicleType,
        distance_km: f64,
        surge_factor: f64,
        policy: &PricingPolicy,
    ) -> Result<FareQuote, FareError> {
        self.compute(
            vehicle_type,
            distance_km,
            surge_factor,
            policy.commission_pct,
            policy.gst_pct,
        )
    }
}

/// Current surge factor per pickup location. Locations without an entry run at 1.0.
#[derive(Debug, Default)]
pub struct SurgeTable {
    factors: DashMap<LocationId, f64>,
}

impl SurgeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factor(&self, location_id: &LocationId) -> f64 {
        self.factors.get(location_id).map(|f| *f).unwrap_or(1.0)
    }

    pub fn set(&self, location_id: LocationId, factor: f64) -> Result<(), FareError> {
        if !factor.is_finite() || factor < 1.0 {
            return Err(FareError::InvalidSurge(factor));
        }
        if factor == 1.0 {
            self.factors.remove(&location_id);
        } else {
            self.factors.insert(location_id, factor);
        }
        Ok(())
    }
}

fn raw_fare(tariff: &VehicleTariff, distance_km: f64) -> f64 {
    tariff.base_fare + (distance_km - tariff.base_km).max(0.0) * tariff.per_km_rate
}

fn validate_distance(distance_km: f64) -> Result<(), FareError> {
    if distance_km.is_finite() && distance_km >= 0.0 {
        Ok(())
    } else {
        Err(FareError::InvalidDistance(distance_km))
    }
}

fn validate_rate(name: &'static str, value: f64) -> Result<(), FareError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(FareError::InvalidRate { name, value })
    }
}

/// Half-away-from-zero rounding to whole currency units. Inputs are non-negative.
pub(crate) fn round_money(value: f64) -> Money {
    value.round().max(0.0) as Money
}
