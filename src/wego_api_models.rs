// API models and data fetching for WeGo Public Transit (Nashville MTA)
// WeGo Official website: https://www.wegotransit.com/
//
// GTFS JSON API Endpoints (https://gtfs.transitnownash.org):
// - Stop: /stops/{stop_gid}.json
// - Trips serving a stop: /stops/{stop_gid}/trips.json?per_page=200
// - Route: /routes/{route_gid}.json
// - GTFS-RT Alerts: /realtime/alerts.json
// - GTFS-RT Trip Updates: /realtime/trip_updates.json
// - GTFS-RT Vehicle Positions: /realtime/vehicle_positions.json
//
// Every field below is optional. The feeds are consumed defensively: a
// missing or mistyped field decodes to `None` (or an empty list) and the
// display layer picks a fallback.

use reqwest::Url;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::{PluginError, Result};
use crate::lenient;

// ============================================================================
// Static schedule
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Stop {
    #[serde(deserialize_with = "lenient::opt_string")]
    pub stop_gid: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub stop_name: Option<String>,
    #[serde(deserialize_with = "lenient::opt_f64")]
    pub stop_lat: Option<f64>,
    #[serde(deserialize_with = "lenient::opt_f64")]
    pub stop_lon: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StopTime {
    #[serde(deserialize_with = "lenient::opt_string")]
    pub stop_gid: Option<String>,
    /// Local wall-clock `HH:MM:SS`. Blank decodes to `None`.
    #[serde(deserialize_with = "lenient::opt_string")]
    pub departure_time: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub arrival_time: Option<String>,
    #[serde(deserialize_with = "lenient::opt_i64")]
    pub stop_sequence: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ShapePoint {
    #[serde(deserialize_with = "lenient::opt_f64")]
    pub lat: Option<f64>,
    #[serde(deserialize_with = "lenient::opt_f64")]
    pub lon: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Shape {
    #[serde(deserialize_with = "lenient::list")]
    pub points: Vec<ShapePoint>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Trip {
    #[serde(deserialize_with = "lenient::opt_string")]
    pub trip_gid: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub route_gid: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub trip_headsign: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub route_short_name: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub route_long_name: Option<String>,
    /// Kept in feed order, never re-sorted.
    #[serde(deserialize_with = "lenient::list")]
    pub stop_times: Vec<StopTime>,
    pub shape: Option<Shape>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct TripsPage {
    #[serde(deserialize_with = "lenient::list")]
    data: Vec<Trip>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Route {
    #[serde(deserialize_with = "lenient::opt_string")]
    pub route_gid: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub route_short_name: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub route_long_name: Option<String>,
    /// Hex without the leading `#`.
    #[serde(deserialize_with = "lenient::opt_string")]
    pub route_color: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub route_text_color: Option<String>,
}

// ============================================================================
// GTFS-RT (JSON encoding)
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TripDescriptor {
    #[serde(deserialize_with = "lenient::opt_string")]
    pub trip_id: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub route_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StopTimeEvent {
    /// Predicted instant, epoch seconds.
    #[serde(deserialize_with = "lenient::opt_i64")]
    pub time: Option<i64>,
    #[serde(deserialize_with = "lenient::opt_i64")]
    pub delay: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StopTimeUpdate {
    #[serde(deserialize_with = "lenient::opt_string")]
    pub stop_id: Option<String>,
    #[serde(deserialize_with = "lenient::opt_i64")]
    pub stop_sequence: Option<i64>,
    pub arrival: Option<StopTimeEvent>,
    pub departure: Option<StopTimeEvent>,
}

impl StopTimeUpdate {
    pub fn departure_epoch(&self) -> Option<i64> {
        self.departure.as_ref().and_then(|d| d.time)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TripUpdate {
    pub trip: Option<TripDescriptor>,
    #[serde(deserialize_with = "lenient::list")]
    pub stop_time_update: Vec<StopTimeUpdate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TripUpdateEntity {
    #[serde(deserialize_with = "lenient::opt_string")]
    pub id: Option<String>,
    pub trip_update: Option<TripUpdate>,
}

impl TripUpdateEntity {
    pub fn trip_id(&self) -> Option<&str> {
        self.trip_update
            .as_ref()?
            .trip
            .as_ref()?
            .trip_id
            .as_deref()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Position {
    #[serde(deserialize_with = "lenient::opt_f64")]
    pub latitude: Option<f64>,
    #[serde(deserialize_with = "lenient::opt_f64")]
    pub longitude: Option<f64>,
    /// Degrees clockwise from north. Absent means 0.
    #[serde(deserialize_with = "lenient::opt_f64")]
    pub bearing: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VehiclePosition {
    pub trip: Option<TripDescriptor>,
    pub position: Option<Position>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VehiclePositionEntity {
    #[serde(deserialize_with = "lenient::opt_string")]
    pub id: Option<String>,
    pub vehicle: Option<VehiclePosition>,
}

impl VehiclePositionEntity {
    pub fn trip_id(&self) -> Option<&str> {
        self.vehicle.as_ref()?.trip.as_ref()?.trip_id.as_deref()
    }
}

/// First vehicle currently running `trip_id`.
pub fn find_vehicle_for_trip<'a>(
    vehicles: &'a [VehiclePositionEntity],
    trip_id: &str,
) -> Option<&'a VehiclePosition> {
    vehicles
        .iter()
        .find(|v| v.trip_id() == Some(trip_id))
        .and_then(|v| v.vehicle.as_ref())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Translation {
    #[serde(deserialize_with = "lenient::opt_string")]
    pub text: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TranslatedString {
    #[serde(deserialize_with = "lenient::list")]
    pub translation: Vec<Translation>,
}

impl TranslatedString {
    pub fn first_text(&self) -> Option<&str> {
        self.translation.first()?.text.as_deref()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EntitySelector {
    #[serde(deserialize_with = "lenient::opt_string")]
    pub route_id: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub stop_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimeRange {
    #[serde(deserialize_with = "lenient::opt_i64")]
    pub start: Option<i64>,
    #[serde(deserialize_with = "lenient::opt_i64")]
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Alert {
    #[serde(deserialize_with = "lenient::list")]
    pub informed_entity: Vec<EntitySelector>,
    pub header_text: Option<TranslatedString>,
    pub description_text: Option<TranslatedString>,
    #[serde(deserialize_with = "lenient::list")]
    pub active_period: Vec<TimeRange>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AlertEntity {
    #[serde(deserialize_with = "lenient::opt_string")]
    pub id: Option<String>,
    pub alert: Option<Alert>,
}

// ============================================================================
// Client
// ============================================================================

#[derive(Debug, Clone)]
pub struct WeGoClient {
    http: reqwest::Client,
    base_url: Url,
}

impl WeGoClient {
    pub const DEFAULT_BASE_URL: &'static str = "https://gtfs.transitnownash.org";
    const TRIPS_PER_PAGE: &'static str = "200";

    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| PluginError::ConfigError(format!("Invalid GTFS base URL '{}': {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(PluginError::ConfigError(format!(
                "GTFS base URL cannot be used as a base: {}",
                base_url
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PluginError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(WeGoClient { http, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // Checked in `new`.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, what: &str) -> Result<T> {
        log::debug!("GET {} ({})", url, what);

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| PluginError::NetworkError(format!("Failed to fetch {}: {}", what, e)))?;

        if !response.status().is_success() {
            return Err(PluginError::NetworkError(format!(
                "{} request failed with status: {}",
                what,
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| PluginError::NetworkError(format!("Failed to read {} response: {}", what, e)))?;

        serde_json::from_slice(&body)
            .map_err(|e| PluginError::ParseError(format!("Failed to decode {}: {}", what, e)))
    }

    pub async fn fetch_stop(&self, stop_id: &str) -> Result<Stop> {
        let url = self.endpoint(&["stops", &format!("{}.json", stop_id)]);
        self.get_json(url, "stop").await
    }

    pub async fn fetch_trips(&self, stop_id: &str) -> Result<Vec<Trip>> {
        let mut url = self.endpoint(&["stops", stop_id, "trips.json"]);
        url.query_pairs_mut().append_pair("per_page", Self::TRIPS_PER_PAGE);
        let page: TripsPage = self.get_json(url, "trips").await?;
        Ok(page.data)
    }

    pub async fn fetch_route(&self, route_id: &str) -> Result<Route> {
        let url = self.endpoint(&["routes", &format!("{}.json", route_id)]);
        self.get_json(url, "route").await
    }

    pub async fn fetch_alerts(&self) -> Result<Vec<AlertEntity>> {
        let url = self.endpoint(&["realtime", "alerts.json"]);
        let alerts: Option<Vec<AlertEntity>> = self.get_json(url, "alerts").await?;
        Ok(alerts.unwrap_or_default())
    }

    pub async fn fetch_trip_updates(&self) -> Result<Vec<TripUpdateEntity>> {
        let url = self.endpoint(&["realtime", "trip_updates.json"]);
        let updates: Option<Vec<TripUpdateEntity>> = self.get_json(url, "trip updates").await?;
        Ok(updates.unwrap_or_default())
    }

    pub async fn fetch_vehicle_positions(&self) -> Result<Vec<VehiclePositionEntity>> {
        let url = self.endpoint(&["realtime", "vehicle_positions.json"]);
        let vehicles: Option<Vec<VehiclePositionEntity>> =
            self.get_json(url, "vehicle positions").await?;
        Ok(vehicles.unwrap_or_default())
    }
}
