// Backend for the Nashville TRMNL plugins
// Each endpoint runs one fetch cycle against public feeds and returns the
// display fields a TRMNL polling plugin renders into its markup.

use actix_cors::Cors;
use actix_web::{App, HttpResponse, HttpServer, middleware, web};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use trmnl_nash_plugins::alerts::{self, AlertSummary};
use trmnl_nash_plugins::civic_feeds::{self, ArcGisClient};
use trmnl_nash_plugins::departures::{self, BoardSources, DepartureStatus, NextBusBoard};
use trmnl_nash_plugins::error::Result;
use trmnl_nash_plugins::transit_map::{MapScene, TransitMap};
use trmnl_nash_plugins::wego_api_models::{self, WeGoClient};

const WEGO_SOURCE: &str = "WeGo Public Transit";
const ARCGIS_SOURCE: &str = "Metro Nashville ArcGIS";
const MAP_CONTAINER_ID: &str = "wego-map-canvas";

// ============================================================================
// Configuration
// ============================================================================

#[derive(Parser, Debug, Clone)]
#[command(name = "trmnl-nash-plugins")]
#[command(about = "JSON backend for the Nashville TRMNL dashboard plugins")]
struct Args {
    /// Port to run the HTTP server on
    #[arg(short, long, env = "SERVER_PORT", default_value_t = 8080)]
    port: u16,

    /// Address to bind
    #[arg(long, env = "SERVER_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Stop used when a request has no `stop` query parameter
    #[arg(long, env = "NEXT_BUS_STOP", default_value = "PORGRESF")]
    default_stop: String,

    /// Viewer time zone; schedule times are read as local to it
    #[arg(long, env = "PLUGIN_TIMEZONE", default_value = "America/Chicago", value_parser = parse_timezone)]
    timezone: Tz,

    /// WeGo GTFS JSON API root
    #[arg(long, env = "GTFS_BASE_URL", default_value = WeGoClient::DEFAULT_BASE_URL)]
    gtfs_base_url: String,

    /// Per-request timeout for upstream feeds, in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    request_timeout_secs: u64,
}

fn parse_timezone(name: &str) -> std::result::Result<Tz, String> {
    name.parse::<Tz>()
        .map_err(|e| format!("unknown time zone '{}': {}", name, e))
}

#[derive(Debug, Clone)]
struct PluginConfig {
    default_stop: String,
    timezone: Tz,
}

#[derive(Clone)]
struct AppState {
    wego: WeGoClient,
    arcgis: ArcGisClient,
    config: Arc<PluginConfig>,
}

impl AppState {
    fn from_args(args: &Args) -> Result<Self> {
        let timeout = Duration::from_secs(args.request_timeout_secs);
        Ok(AppState {
            wego: WeGoClient::new(&args.gtfs_base_url, timeout)?,
            arcgis: ArcGisClient::new(timeout)?,
            config: Arc::new(PluginConfig {
                default_stop: args.default_stop.clone(),
                timezone: args.timezone,
            }),
        })
    }

    fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.config.timezone)
    }
}

// ============================================================================
// Response envelope
// ============================================================================

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    timestamp: i64,
    sources: Vec<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T, source: &str) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now().timestamp(),
            sources: vec![source.to_string()],
        }
    }
}

/// A failed feed becomes an absent value; the tile shows its "no data"
/// state instead of an error.
fn or_degrade<T>(result: Result<T>, what: &str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("⚠️  {} unavailable, rendering without it: {}", what, e);
            None
        }
    }
}

// ============================================================================
// Next bus
// ============================================================================

#[derive(Deserialize)]
struct NextBusQuery {
    stop: Option<String>,
}

#[derive(Debug, Serialize)]
struct NextBusPayload {
    board: NextBusBoard,
    alert: Option<AlertSummary>,
    map: Option<MapScene>,
}

fn resolve_stop_id<'a>(requested: Option<&'a str>, default_stop: &'a str) -> &'a str {
    requested
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(default_stop)
}

async fn build_next_bus(wego: &WeGoClient, stop_id: &str, now: DateTime<Tz>) -> NextBusPayload {
    let (stop, trips, trip_updates) = tokio::join!(
        wego.fetch_stop(stop_id),
        wego.fetch_trips(stop_id),
        wego.fetch_trip_updates(),
    );
    let stop = or_degrade(stop, "stop info");
    let trips = or_degrade(trips, "trip list").unwrap_or_default();
    let trip_updates = or_degrade(trip_updates, "trip updates").unwrap_or_default();

    let candidate = departures::find_next_trip(&trips, &now);
    let trip = candidate.map(|c| c.trip);
    let trip_id = trip.and_then(|t| t.trip_gid.as_deref());
    let route_id = trip.and_then(|t| t.route_gid.as_deref());

    let (route, alert_feed, vehicles) = tokio::join!(
        async {
            match route_id {
                Some(id) => or_degrade(wego.fetch_route(id).await, "route"),
                None => None,
            }
        },
        async {
            match route_id {
                Some(_) => or_degrade(wego.fetch_alerts().await, "alerts").unwrap_or_default(),
                None => Vec::new(),
            }
        },
        async {
            match trip_id {
                Some(_) => or_degrade(wego.fetch_vehicle_positions().await, "vehicle positions")
                    .unwrap_or_default(),
                None => Vec::new(),
            }
        },
    );

    let board = departures::compose_board(
        BoardSources {
            stop_id,
            stop: stop.as_ref(),
            trips: &trips,
            route: route.as_ref(),
            trip_updates: &trip_updates,
        },
        candidate,
        &now,
    );

    let alert = board.route_id.as_deref().and_then(|route_id| {
        let matches = alerts::alerts_for_route(route_id, &alert_feed, now.timestamp());
        AlertSummary::from_matches(&matches)
    });

    let vehicle = trip_id.and_then(|id| wego_api_models::find_vehicle_for_trip(&vehicles, id));
    let mut map = TransitMap::new(MAP_CONTAINER_ID);
    map.initialize();
    let scene = map
        .render(
            trip.and_then(|t| t.shape.as_ref()),
            stop.as_ref(),
            vehicle,
            Some(board.route_color.as_str()),
        )
        .await
        .cloned();
    map.destroy();

    NextBusPayload {
        board,
        alert,
        map: scene,
    }
}

async fn get_next_bus(state: web::Data<AppState>, query: web::Query<NextBusQuery>) -> HttpResponse {
    let stop_id = resolve_stop_id(query.stop.as_deref(), &state.config.default_stop).to_string();
    let now = state.now();

    let payload = build_next_bus(&state.wego, &stop_id, now).await;
    log::info!(
        "🚌 Next bus for {}: {} ({})",
        stop_id,
        payload.board.trip_name,
        match &payload.board.departure {
            DepartureStatus::Upcoming { time, .. } => time.as_str(),
            DepartureStatus::NoMoreDepartures { message }
            | DepartureStatus::NoStopTimes { message } => *message,
        }
    );

    HttpResponse::Ok().json(ApiResponse::success(payload, WEGO_SOURCE))
}

// ============================================================================
// Civic feeds
// ============================================================================

async fn get_pollen_aqi(state: web::Data<AppState>) -> HttpResponse {
    let reports = state
        .arcgis
        .fetch_features(civic_feeds::POLLEN_AQI_URL, "pollen and AQI")
        .await;
    let reports = or_degrade(reports, "pollen and AQI feed").unwrap_or_default();

    log::info!("🌼 Pollen reports: {}", reports.len());
    let report = civic_feeds::build_pollen_report(reports, &state.config.timezone);
    HttpResponse::Ok().json(ApiResponse::success(report, ARCGIS_SOURCE))
}

async fn get_mnpd_dispatches(state: web::Data<AppState>) -> HttpResponse {
    let dispatches = state
        .arcgis
        .fetch_features(civic_feeds::MNPD_DISPATCH_URL, "MNPD dispatches")
        .await;
    let dispatches = or_degrade(dispatches, "MNPD dispatch feed").unwrap_or_default();

    log::info!("🚓 MNPD dispatches: {}", dispatches.len());
    let board = civic_feeds::build_dispatch_board(dispatches, &state.config.timezone);
    HttpResponse::Ok().json(ApiResponse::success(board, ARCGIS_SOURCE))
}

async fn get_nfd_incidents(state: web::Data<AppState>) -> HttpResponse {
    let incidents = state
        .arcgis
        .fetch_features(civic_feeds::NFD_INCIDENTS_URL, "NFD incidents")
        .await;
    let incidents = or_degrade(incidents, "NFD incident feed").unwrap_or_default();

    log::info!("🚒 NFD incident records: {}", incidents.len());
    let board = civic_feeds::build_incident_board(incidents, &state.config.timezone);
    HttpResponse::Ok().json(ApiResponse::success(board, ARCGIS_SOURCE))
}

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "Nashville TRMNL plugins",
        "version": env!("CARGO_PKG_VERSION"),
        "sources": [WEGO_SOURCE, ARCGIS_SOURCE],
        "timestamp": Utc::now().timestamp(),
    }))
}

// ============================================================================
// Server Setup
// ============================================================================

fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check)).service(
        web::scope("/api")
            .route("/next-bus", web::get().to(get_next_bus))
            .route("/pollen-aqi", web::get().to(get_pollen_aqi))
            .route("/mnpd-dispatches", web::get().to(get_mnpd_dispatches))
            .route("/nfd-incidents", web::get().to(get_nfd_incidents)),
    );
}

async fn run_server(state: AppState, bind: String, port: u16) -> std::io::Result<()> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║   🚏 Nashville TRMNL Plugins                               ║");
    println!("╚════════════════════════════════════════════════════════════╝\n");
    println!("🌐 Server running on: http://{}:{}", bind, port);
    println!("🕒 Viewer time zone: {}", state.config.timezone);
    println!("📍 Default stop: {}\n", state.config.default_stop);

    println!("📍 Available Routes:");
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│   GET  /api/next-bus?stop=:id      - Next departure tile    │");
    println!("│   GET  /api/pollen-aqi             - Pollen and AQI tile    │");
    println!("│   GET  /api/mnpd-dispatches        - MNPD dispatch tile     │");
    println!("│   GET  /api/nfd-incidents          - NFD incident tile      │");
    println!("│   GET  /health                     - Health check           │");
    println!("└─────────────────────────────────────────────────────────────┘\n");

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(Cors::permissive())
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .configure(configure_routes)
    })
    .bind((bind.as_str(), port))?
    .run()
    .await
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let state = match AppState::from_args(&args) {
        Ok(state) => state,
        Err(e) => {
            log::error!("❌ Failed to start: {}", e);
            std::process::exit(1);
        }
    };

    actix_web::rt::System::new().block_on(run_server(state, args.bind, args.port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::{TestRequest, call_and_read_body_json, call_service, init_service};
    use trmnl_nash_plugins::error::PluginError;

    /// State whose upstream feeds all fail: nothing listens on port 9 and
    /// the ArcGIS client times out before any response can arrive.
    fn unreachable_state() -> AppState {
        AppState {
            wego: WeGoClient::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap(),
            arcgis: ArcGisClient::new(Duration::from_nanos(1)).unwrap(),
            config: Arc::new(PluginConfig {
                default_stop: "PORGRESF".to_string(),
                timezone: chrono_tz::America::Chicago,
            }),
        }
    }

    async fn get_json(uri: &str) -> (actix_web::http::StatusCode, serde_json::Value) {
        let app = init_service(
            App::new()
                .app_data(web::Data::new(unreachable_state()))
                .configure(configure_routes),
        )
        .await;
        let resp = call_service(&app, TestRequest::get().uri(uri).to_request()).await;
        let status = resp.status();
        let body: serde_json::Value = actix_web::test::read_body_json(resp).await;
        (status, body)
    }

    #[test]
    fn stop_query_falls_back_to_default() {
        assert_eq!(resolve_stop_id(None, "PORGRESF"), "PORGRESF");
        assert_eq!(resolve_stop_id(Some("   "), "PORGRESF"), "PORGRESF");
        assert_eq!(resolve_stop_id(Some(" MCC5_8 "), "PORGRESF"), "MCC5_8");
    }

    #[test]
    fn args_defaults() {
        let args = Args::try_parse_from(["trmnl-nash-plugins"]).unwrap();
        assert_eq!(args.default_stop, "PORGRESF");
        assert_eq!(args.timezone, chrono_tz::America::Chicago);
        assert_eq!(args.gtfs_base_url, "https://gtfs.transitnownash.org");
        assert_eq!(args.request_timeout_secs, 30);
        assert!(AppState::from_args(&args).is_ok());
    }

    #[test]
    fn args_accept_request_timeout() {
        let args = Args::try_parse_from(["trmnl-nash-plugins", "--request-timeout-secs", "5"]).unwrap();
        assert_eq!(args.request_timeout_secs, 5);
        assert!(AppState::from_args(&args).is_ok());
    }

    #[test]
    fn args_reject_unknown_timezone() {
        assert!(Args::try_parse_from(["trmnl-nash-plugins", "--timezone", "Mars/Olympus"]).is_err());
    }

    #[test]
    fn degraded_feed_is_absent() {
        let failed: Result<Vec<u8>> = Err(PluginError::NetworkError("timeout".to_string()));
        assert!(or_degrade(failed, "trips").is_none());
        assert_eq!(or_degrade(Ok(3), "trips"), Some(3));
    }

    #[actix_web::test]
    async fn health_endpoint_reports_healthy() {
        let app = init_service(App::new().configure(configure_routes)).await;
        let req = TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sources"][0], WEGO_SOURCE);
    }

    #[actix_web::test]
    async fn next_bus_degrades_when_feeds_are_unreachable() {
        // Nothing listens on port 9; every fetch fails fast.
        let wego = WeGoClient::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let now = Utc::now().with_timezone(&chrono_tz::America::Chicago);

        let payload = build_next_bus(&wego, "PORGRESF", now).await;
        assert_eq!(payload.board.stop_name, "Unknown Stop");
        assert_eq!(payload.board.route_label, "-");
        assert_eq!(
            serde_json::to_value(&payload.board.departure).unwrap()["state"],
            "no_stop_times"
        );
        assert!(payload.alert.is_none());
        assert!(payload.map.is_none());
    }

    #[actix_web::test]
    async fn next_bus_endpoint_renders_no_data_state() {
        let (status, body) = get_json("/api/next-bus?stop=%20").await;
        assert!(status.is_success());
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["board"]["stop_id"], "PORGRESF");
        assert_eq!(body["data"]["board"]["departure"]["state"], "no_stop_times");
    }

    #[actix_web::test]
    async fn failed_pollen_feed_yields_empty_report() {
        let (status, body) = get_json("/api/pollen-aqi").await;
        assert!(status.is_success());
        assert_eq!(body["success"], true);
        assert!(body["data"].is_null());
        assert!(body["error"].is_null());
    }

    #[actix_web::test]
    async fn failed_dispatch_feed_yields_empty_board() {
        let (status, body) = get_json("/api/mnpd-dispatches").await;
        assert!(status.is_success());
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["rows"], serde_json::json!([]));
        assert_eq!(body["data"]["message"], "No active dispatches.");
    }

    #[actix_web::test]
    async fn failed_incident_feed_yields_empty_board() {
        let (status, body) = get_json("/api/nfd-incidents").await;
        assert!(status.is_success());
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["rows"], serde_json::json!([]));
        assert_eq!(body["data"]["message"], "No active incidents.");
    }
}
