// Metro Nashville ArcGIS feature services backing the civic tiles
// Open data portal: https://data.nashville.gov/
//
// All three are queried as `query?outFields=*&where=1%3D1&f=geojson`:
// - Air Quality and Pollen Count
// - MNPD Active Dispatch Table
// - NFD Active Incidents

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use geojson::FeatureCollection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{PluginError, Result};
use crate::lenient;

pub const POLLEN_AQI_URL: &str = "https://services2.arcgis.com/HdTo6HJqh92wn4D8/arcgis/rest/services/Air_Quality_and_Pollen_Count_1/FeatureServer/0/query?outFields=*&where=1%3D1&f=geojson";
pub const MNPD_DISPATCH_URL: &str = "https://services2.arcgis.com/HdTo6HJqh92wn4D8/arcgis/rest/services/Metro_Nashville_Police_Department_Active_Dispatch_Table_view/FeatureServer/0/query?outFields=*&where=1%3D1&f=geojson";
pub const NFD_INCIDENTS_URL: &str = "https://services2.arcgis.com/HdTo6HJqh92wn4D8/arcgis/rest/services/Nashville_Fire_Department_Active_Incidents_view/FeatureServer/0/query?outFields=*&where=1%3D1&f=geojson";

const POLLEN_GAUGE_MAX: f64 = 12.0;
const AQI_GAUGE_MAX: f64 = 500.0;
const POLLEN_TABLE_ROWS: usize = 5;
const DISPATCH_TABLE_ROWS: usize = 12;

// ============================================================================
// Client
// ============================================================================

#[derive(Debug, Clone)]
pub struct ArcGisClient {
    http: reqwest::Client,
}

impl ArcGisClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PluginError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;
        Ok(ArcGisClient { http })
    }

    /// Feature properties decoded as `T`. Features whose properties do not
    /// decode are dropped.
    pub async fn fetch_features<T: DeserializeOwned>(&self, url: &str, what: &str) -> Result<Vec<T>> {
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

        let collection: FeatureCollection = serde_json::from_slice(&body)
            .map_err(|e| PluginError::ParseError(format!("Failed to decode {} GeoJSON: {}", what, e)))?;

        Ok(feature_properties(collection, what))
    }
}

fn feature_properties<T: DeserializeOwned>(collection: FeatureCollection, what: &str) -> Vec<T> {
    collection
        .features
        .into_iter()
        .filter_map(|feature| {
            let properties = feature.properties.unwrap_or_default();
            match serde_json::from_value(serde_json::Value::Object(properties)) {
                Ok(props) => Some(props),
                Err(e) => {
                    log::debug!("Dropping {} feature: {}", what, e);
                    None
                }
            }
        })
        .collect()
}

// ============================================================================
// Shared formatting
// ============================================================================

/// Time and date of a feed timestamp in the viewer's zone, `"09:15 AM"` and
/// `"10/18/2026"`. Missing timestamps show as `"-"` with no date.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stamp {
    pub time: String,
    pub date: Option<String>,
}

impl Stamp {
    pub fn new(instant: Option<DateTime<Utc>>, tz: &Tz) -> Self {
        match instant {
            Some(instant) => {
                let local = instant.with_timezone(tz);
                Stamp {
                    time: local.format("%I:%M %p").to_string(),
                    date: Some(local.format("%-m/%-d/%Y").to_string()),
                }
            }
            None => Stamp {
                time: "-".to_string(),
                date: None,
            },
        }
    }
}

fn short_date(instant: Option<DateTime<Utc>>, tz: &Tz) -> String {
    instant
        .map(|i| i.with_timezone(tz).format("%-m/%-d/%Y").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Whole numbers without a trailing `.0`; missing as `"-"`.
fn display_number(value: Option<f64>) -> String {
    match value {
        Some(v) if v.fract() == 0.0 && v.abs() < 1e15 => format!("{}", v as i64),
        Some(v) => v.to_string(),
        None => "-".to_string(),
    }
}

fn join_present(parts: &[Option<&str>]) -> String {
    parts.iter().flatten().copied().collect::<Vec<_>>().join(", ")
}

/// Newest first; undated records sink to the end in feed order.
fn newest_first(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

// ============================================================================
// Pollen and air quality
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PollenProperties {
    #[serde(rename = "ReportDateTime", deserialize_with = "lenient::opt_timestamp")]
    pub report_date_time: Option<DateTime<Utc>>,
    #[serde(rename = "PollenCount", deserialize_with = "lenient::opt_f64")]
    pub pollen_count: Option<f64>,
    #[serde(rename = "PollenType", deserialize_with = "lenient::opt_string")]
    pub pollen_type: Option<String>,
    #[serde(rename = "PollenDescription", deserialize_with = "lenient::opt_string")]
    pub pollen_description: Option<String>,
    #[serde(rename = "AQI", deserialize_with = "lenient::opt_f64")]
    pub aqi: Option<f64>,
    #[serde(rename = "Category", deserialize_with = "lenient::opt_string")]
    pub category: Option<String>,
    #[serde(rename = "ResponsiblePollutant", deserialize_with = "lenient::opt_string")]
    pub responsible_pollutant: Option<String>,
}

impl PollenProperties {
    fn pollen_text(&self) -> String {
        join_present(&[self.pollen_type.as_deref(), self.pollen_description.as_deref()])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Gauge {
    pub label: &'static str,
    pub value: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollenRow {
    pub date: String,
    pub pollen_count: String,
    pub pollen: String,
    pub aqi: String,
    pub category: String,
    pub responsible_pollutant: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollenReport {
    pub heading: String,
    pub pollen_type: String,
    pub pollen_gauge: Gauge,
    pub aqi_gauge: Gauge,
    pub rows: Vec<PollenRow>,
}

/// Newest report on top, the next five days as table rows. `None` when the
/// feed has no reports at all.
pub fn build_pollen_report(mut reports: Vec<PollenProperties>, tz: &Tz) -> Option<PollenReport> {
    reports.sort_by(|a, b| newest_first(a.report_date_time, b.report_date_time));
    let today = reports.first()?;

    let rows = reports
        .iter()
        .skip(1)
        .take(POLLEN_TABLE_ROWS)
        .map(|r| PollenRow {
            date: short_date(r.report_date_time, tz),
            pollen_count: display_number(r.pollen_count),
            pollen: r.pollen_text(),
            aqi: display_number(r.aqi),
            category: r.category.clone().unwrap_or_default(),
            responsible_pollutant: r.responsible_pollutant.clone().unwrap_or_default(),
        })
        .collect();

    Some(PollenReport {
        heading: format!(
            "Pollen and air quality report for {}",
            short_date(today.report_date_time, tz)
        ),
        pollen_type: today.pollen_text(),
        pollen_gauge: Gauge {
            label: "Pollen",
            value: today.pollen_count.unwrap_or(0.0),
            max: POLLEN_GAUGE_MAX,
        },
        aqi_gauge: Gauge {
            label: "AQI",
            value: today.aqi.unwrap_or(0.0),
            max: AQI_GAUGE_MAX,
        },
        rows,
    })
}

// ============================================================================
// MNPD dispatches
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DispatchProperties {
    #[serde(rename = "IncidentTypeCode", deserialize_with = "lenient::opt_string")]
    pub incident_type_code: Option<String>,
    #[serde(rename = "IncidentTypeName", deserialize_with = "lenient::opt_string")]
    pub incident_type_name: Option<String>,
    #[serde(rename = "CallReceivedTime", deserialize_with = "lenient::opt_timestamp")]
    pub call_received_time: Option<DateTime<Utc>>,
    #[serde(rename = "Location", deserialize_with = "lenient::opt_string")]
    pub location: Option<String>,
    #[serde(rename = "CityName", deserialize_with = "lenient::opt_string")]
    pub city_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchRow {
    pub incident_code: String,
    pub incident_name: String,
    pub received: Stamp,
    pub location: String,
    pub city: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchBoard<R> {
    pub rows: Vec<R>,
    pub message: Option<&'static str>,
}

/// First twelve dispatches in feed order.
pub fn build_dispatch_board(dispatches: Vec<DispatchProperties>, tz: &Tz) -> DispatchBoard<DispatchRow> {
    let rows: Vec<DispatchRow> = dispatches
        .into_iter()
        .take(DISPATCH_TABLE_ROWS)
        .map(|d| DispatchRow {
            incident_code: d.incident_type_code.unwrap_or_default(),
            incident_name: d.incident_type_name.unwrap_or_default(),
            received: Stamp::new(d.call_received_time, tz),
            location: d.location.unwrap_or_default(),
            city: d.city_name.unwrap_or_default(),
        })
        .collect();

    let message = rows.is_empty().then_some("No active dispatches.");
    DispatchBoard { rows, message }
}

// ============================================================================
// NFD incidents
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IncidentProperties {
    #[serde(deserialize_with = "lenient::opt_string")]
    pub event_number: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub incident_type_id: Option<String>,
    #[serde(rename = "DispatchDateTime", deserialize_with = "lenient::opt_timestamp")]
    pub dispatch_date_time: Option<DateTime<Utc>>,
    #[serde(rename = "PostalCode", deserialize_with = "lenient::opt_string")]
    pub postal_code: Option<String>,
    #[serde(rename = "Unit_ID", deserialize_with = "lenient::opt_string")]
    pub unit_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncidentRow {
    pub event_number: Option<String>,
    pub incident_type: String,
    pub dispatched: Stamp,
    pub postal_code: String,
    pub units: String,
}

struct IncidentGroup {
    first: IncidentProperties,
    units: Vec<String>,
}

/// One row per event. The feed has a record per responding unit; the first
/// record of an event supplies its details and every record adds its unit.
pub fn build_incident_board(incidents: Vec<IncidentProperties>, tz: &Tz) -> DispatchBoard<IncidentRow> {
    let mut groups: Vec<IncidentGroup> = Vec::new();
    let mut by_event: HashMap<Option<String>, usize> = HashMap::new();

    for incident in incidents {
        let unit = incident.unit_id.clone();
        let idx = *by_event
            .entry(incident.event_number.clone())
            .or_insert_with(|| {
                groups.push(IncidentGroup {
                    first: incident,
                    units: Vec::new(),
                });
                groups.len() - 1
            });
        groups[idx].units.extend(unit);
    }

    groups.sort_by(|a, b| newest_first(a.first.dispatch_date_time, b.first.dispatch_date_time));

    let rows: Vec<IncidentRow> = groups
        .into_iter()
        .take(DISPATCH_TABLE_ROWS)
        .map(|g| IncidentRow {
            event_number: g.first.event_number,
            incident_type: g.first.incident_type_id.unwrap_or_default(),
            dispatched: Stamp::new(g.first.dispatch_date_time, tz),
            postal_code: g.first.postal_code.unwrap_or_default(),
            units: g.units.join(", "),
        })
        .collect();

    let message = rows.is_empty().then_some("No active incidents.");
    DispatchBoard { rows, message }
}
