//! Station directory and trip distances on the H3 grid.
//!
//! Pickups happen only at configured stations. A drop location is snapped to
//! its H3 cell and the trip distance is the haversine distance between the two
//! cell centres, cached per cell pair.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use h3o::{CellIndex, LatLng, Resolution};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::StationConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::model::{GeoPoint, LocationId};

const EARTH_RADIUS_KM: f64 = 6371.0;
const DISTANCE_CACHE_SIZE: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub id: LocationId,
    pub name: String,
    pub point: GeoPoint,
}

pub fn cell_for(point: GeoPoint, resolution: Resolution) -> Option<CellIndex> {
    LatLng::new(point.lat, point.lng)
        .ok()
        .map(|ll| ll.to_cell(resolution))
}

/// Haversine distance between two H3 cell centres.
pub fn distance_km_between_cells(a: CellIndex, b: CellIndex) -> f64 {
    let a: LatLng = a.into();
    let b: LatLng = b.into();
    let (lat1, lon1) = (a.lat().to_radians(), a.lng().to_radians());
    let (lat2, lon2) = (b.lat().to_radians(), b.lng().to_radians());
    let sin_dlat = ((lat2 - lat1) * 0.5).sin();
    let sin_dlon = ((lon2 - lon1) * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

pub struct StationDirectory {
    resolution: Resolution,
    stations: HashMap<LocationId, (Station, CellIndex)>,
    distance_cache: Mutex<LruCache<(CellIndex, CellIndex), f64>>,
}

impl std::fmt::Debug for StationDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StationDirectory")
            .field("resolution", &self.resolution)
            .field("stations", &self.stations.len())
            .finish()
    }
}

impl StationDirectory {
    /// Builds the directory; stations with invalid coordinates are rejected.
    pub fn new(resolution: Resolution, stations: &[StationConfig]) -> Result<Self, GeoPoint> {
        let mut by_id = HashMap::with_capacity(stations.len());
        for config in stations {
            let point = GeoPoint::new(config.lat, config.lng);
            let cell = cell_for(point, resolution).ok_or(point)?;
            let station = Station {
                id: config.id.clone(),
                name: config.name.clone(),
                point,
            };
            by_id.insert(config.id.clone(), (station, cell));
        }
        Ok(Self {
            resolution,
            stations: by_id,
            distance_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(DISTANCE_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            )),
        })
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn station(&self, id: &LocationId) -> Option<&Station> {
        self.stations.get(id).map(|(station, _)| station)
    }

    pub fn contains(&self, id: &LocationId) -> bool {
        self.stations.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    /// Distance from a station to a drop point, in km.
    pub fn trip_distance_km(&self, pickup: &LocationId, drop: GeoPoint) -> DispatchResult<f64> {
        let (_, pickup_cell) = self
            .stations
            .get(pickup)
            .ok_or_else(|| DispatchError::UnknownLocation(pickup.clone()))?;
        let drop_cell = cell_for(drop, self.resolution).ok_or(DispatchError::InvalidCoordinates {
            lat: drop.lat,
            lng: drop.lng,
        })?;
        Ok(self.cached_distance(*pickup_cell, drop_cell))
    }

    fn cached_distance(&self, a: CellIndex, b: CellIndex) -> f64 {
        let key = if u64::from(a) <= u64::from(b) {
            (a, b)
        } else {
            (b, a)
        };
        let mut cache = self.distance_cache.lock();
        if let Some(distance) = cache.get(&key) {
            return *distance;
        }
        let distance = distance_km_between_cells(a, b);
        cache.put(key, distance);
        distance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> StationDirectory {
        StationDirectory::new(
            Resolution::Nine,
            &[StationConfig {
                id: LocationId::new("rajiv-chowk"),
                name: "Rajiv Chowk".to_string(),
                lat: 28.6328,
                lng: 77.2197,
            }],
        )
        .expect("directory")
    }

    #[test]
    fn distance_to_nearby_drop_is_small_and_positive() {
        let directory = directory();
        let drop = GeoPoint::new(28.6562, 77.2410);
        let distance = directory
            .trip_distance_km(&LocationId::new("rajiv-chowk"), drop)
            .expect("distance");
        assert!(distance > 2.5 && distance < 4.0, "distance was {distance}");

        let again = directory
            .trip_distance_km(&LocationId::new("rajiv-chowk"), drop)
            .expect("cached distance");
        assert_eq!(distance, again);
    }

    #[test]
    fn drop_in_same_cell_is_zero() {
        let directory = directory();
        let distance = directory
            .trip_distance_km(&LocationId::new("rajiv-chowk"), GeoPoint::new(28.6328, 77.2197))
            .expect("distance");
        assert_eq!(distance, 0.0);
    }

    #[test]
    fn unknown_station_and_bad_coordinates_are_rejected() {
        let directory = directory();
        assert!(matches!(
            directory.trip_distance_km(&LocationId::new("nowhere"), GeoPoint::new(0.0, 0.0)),
            Err(DispatchError::UnknownLocation(_))
        ));
        assert!(matches!(
            directory.trip_distance_km(
                &LocationId::new("rajiv-chowk"),
                GeoPoint::new(f64::NAN, 77.0)
            ),
            Err(DispatchError::InvalidCoordinates { .. })
        ));
    }
}
