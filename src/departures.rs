// Next-departure selection for a single stop.
//
// Schedule times arrive as local `HH:MM:SS` strings with no date. They are
// anchored to the calendar day of `now` in the viewer's time zone, the
// soonest upcoming trip is picked, and a matching real-time prediction (if
// any) replaces the scheduled instant.

use chrono::{DateTime, Duration, NaiveDateTime, Offset, TimeZone};
use chrono_tz::Tz;
use serde::Serialize;
use std::fmt;

use crate::wego_api_models::{Route, Stop, StopTime, Trip, TripUpdateEntity};

const DEFAULT_ROUTE_COLOR: &str = "1a237e";
const ON_TIME_THRESHOLD_SECS: i64 = 60;

// ============================================================================
// Time parsing
// ============================================================================

/// Anchors a local `HH:MM:SS` to the calendar day of `now`.
///
/// Returns `None` for anything that is not exactly three unsigned integer
/// fields. Fields overflow the way wall clocks do: `25:10:00` is 01:10 the
/// next day. A time inside a spring-forward gap is read with the offset in
/// force before the gap, so `02:30` on the changeover day lands at 03:30.
pub fn parse_time(text: &str, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    let parts: Vec<&str> = text.trim().split(':').collect();
    if parts.len() != 3 {
        return None;
    }

    let hours = parse_field(parts[0])?;
    let minutes = parse_field(parts[1])?;
    let seconds = parse_field(parts[2])?;

    let offset = Duration::try_seconds(hours * 3600 + minutes * 60 + seconds)?;
    let local = now
        .date_naive()
        .and_hms_opt(0, 0, 0)?
        .checked_add_signed(offset)?;

    let tz = now.timezone();
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| resolve_gap(&tz, &local))
}

fn resolve_gap(tz: &Tz, local: &NaiveDateTime) -> Option<DateTime<Tz>> {
    let before_gap = local.checked_sub_signed(Duration::try_hours(3)?)?;
    let offset = tz.from_local_datetime(&before_gap).earliest()?.offset().fix();
    let utc = local.checked_sub_signed(Duration::try_seconds(i64::from(offset.local_minus_utc()))?)?;
    Some(tz.from_utc_datetime(&utc))
}

fn parse_field(field: &str) -> Option<i64> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse::<u32>().ok().map(i64::from)
}

// ============================================================================
// Selection
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct NextDeparture<'a> {
    /// Position within the trip's stop time list.
    pub index: usize,
    pub stop_time: &'a StopTime,
    pub scheduled: DateTime<Tz>,
}

/// First stop time, in list order, that departs strictly after `now`.
///
/// The list is trusted to be in schedule order; this is a scan that stops
/// at the first hit, not a minimum search.
pub fn find_next_departure<'a>(
    stop_times: &'a [StopTime],
    now: &DateTime<Tz>,
) -> Option<NextDeparture<'a>> {
    stop_times.iter().enumerate().find_map(|(index, stop_time)| {
        let scheduled = parse_time(stop_time.departure_time.as_deref()?, now)?;
        (scheduled > *now).then_some(NextDeparture {
            index,
            stop_time,
            scheduled,
        })
    })
}

#[derive(Debug, Clone, Copy)]
pub struct TripCandidate<'a> {
    pub trip: &'a Trip,
    pub departure: NextDeparture<'a>,
}

/// Trip with the soonest next departure. Ties go to the trip seen first.
pub fn find_next_trip<'a>(trips: &'a [Trip], now: &DateTime<Tz>) -> Option<TripCandidate<'a>> {
    let mut soonest: Option<TripCandidate<'a>> = None;

    for trip in trips {
        let Some(departure) = find_next_departure(&trip.stop_times, now) else {
            log::debug!(
                "Skipping trip {:?}: no departure after {}",
                trip.trip_gid,
                now.format("%H:%M:%S")
            );
            continue;
        };

        if soonest.is_none_or(|best| departure.scheduled < best.departure.scheduled) {
            soonest = Some(TripCandidate { trip, departure });
        }
    }

    soonest
}

// ============================================================================
// Real-time reconciliation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Delay {
    OnTime,
    Late { minutes: i64 },
    Early { minutes: i64 },
}

impl Delay {
    /// Under a minute either way is on time. Otherwise whole minutes,
    /// halves rounded up, so exactly 60s is "1 min".
    pub fn from_seconds(delay_seconds: i64) -> Self {
        let magnitude = delay_seconds.abs();
        if magnitude < ON_TIME_THRESHOLD_SECS {
            return Delay::OnTime;
        }
        let minutes = (magnitude + 30) / 60;
        if delay_seconds > 0 {
            Delay::Late { minutes }
        } else {
            Delay::Early { minutes }
        }
    }
}

impl fmt::Display for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delay::OnTime => write!(f, "on time"),
            Delay::Late { minutes } => write!(f, "{} min late", minutes),
            Delay::Early { minutes } => write!(f, "{} min early", minutes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    pub departure: DateTime<Tz>,
    pub delay: Option<Delay>,
    pub delay_seconds: Option<i64>,
}

impl Reconciled {
    fn scheduled_only(scheduled: DateTime<Tz>) -> Self {
        Reconciled {
            departure: scheduled,
            delay: None,
            delay_seconds: None,
        }
    }

    pub fn is_realtime(&self) -> bool {
        self.delay.is_some()
    }
}

/// Swaps the scheduled instant for a live prediction when the trip update
/// feed has one for this trip and stop. Anything missing falls back to the
/// schedule without complaint.
pub fn reconcile(
    trip_id: Option<&str>,
    stop_time: &StopTime,
    scheduled: DateTime<Tz>,
    trip_updates: &[TripUpdateEntity],
) -> Reconciled {
    let (Some(trip_id), Some(stop_id)) = (trip_id, stop_time.stop_gid.as_deref()) else {
        return Reconciled::scheduled_only(scheduled);
    };

    let predicted = trip_updates
        .iter()
        .find(|entity| entity.trip_id() == Some(trip_id))
        .and_then(|entity| entity.trip_update.as_ref())
        .and_then(|update| {
            update
                .stop_time_update
                .iter()
                .filter(|stu| stu.stop_id.as_deref() == Some(stop_id))
                .find_map(|stu| stu.departure_epoch())
        });

    let Some(predicted_epoch) = predicted else {
        return Reconciled::scheduled_only(scheduled);
    };

    let Some(departure) = scheduled.timezone().timestamp_opt(predicted_epoch, 0).single() else {
        log::warn!("Ignoring out-of-range prediction {} for trip {}", predicted_epoch, trip_id);
        return Reconciled::scheduled_only(scheduled);
    };

    let delay_seconds = predicted_epoch - scheduled.timestamp();
    Reconciled {
        departure,
        delay: Some(Delay::from_seconds(delay_seconds)),
        delay_seconds: Some(delay_seconds),
    }
}

// ============================================================================
// Presentation
// ============================================================================

/// `9:15 AM` style.
pub fn format_time(instant: &DateTime<Tz>) -> String {
    instant.format("%-I:%M %p").to_string()
}

/// `"12 min"`, or `"45 sec"` inside the last minute. Empty once the instant
/// has passed.
pub fn time_until(instant: &DateTime<Tz>, now: &DateTime<Tz>) -> String {
    if instant <= now {
        return String::new();
    }
    let millis = (*instant - *now).num_milliseconds();
    let minutes = millis / 60_000;
    let seconds = (millis % 60_000) / 1000;
    if minutes > 0 {
        format!("{} min", minutes)
    } else {
        format!("{} sec", seconds)
    }
}

pub fn route_label(route: Option<&Route>) -> String {
    match route {
        Some(route) => format!(
            "{} - {}",
            route.route_short_name.as_deref().unwrap_or_default(),
            route.route_long_name.as_deref().unwrap_or_default()
        ),
        None => "-".to_string(),
    }
}

pub fn trip_name(trip: Option<&Trip>, route: Option<&Route>) -> String {
    let base = trip
        .and_then(|t| {
            t.trip_headsign
                .as_deref()
                .or(t.route_long_name.as_deref())
                .or(t.route_short_name.as_deref())
        })
        .unwrap_or("Unknown Route");

    match route {
        Some(route) => format!(
            "{} ({})",
            base,
            route
                .route_long_name
                .as_deref()
                .or(route.route_short_name.as_deref())
                .unwrap_or_default()
        ),
        None => base.to_string(),
    }
}

// ============================================================================
// Board
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DepartureStatus {
    Upcoming {
        time: String,
        time_until: String,
        scheduled_time: String,
        realtime: bool,
        delay: Option<Delay>,
        delay_text: Option<String>,
        delay_seconds: Option<i64>,
    },
    NoMoreDepartures {
        message: &'static str,
    },
    NoStopTimes {
        message: &'static str,
    },
}

impl DepartureStatus {
    fn no_more_departures() -> Self {
        DepartureStatus::NoMoreDepartures {
            message: "No more stops today",
        }
    }

    fn no_stop_times() -> Self {
        DepartureStatus::NoStopTimes {
            message: "No stop times available",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NextBusBoard {
    pub stop_id: String,
    pub stop_name: String,
    pub route_label: String,
    /// CSS colour with `#`.
    pub route_color: String,
    pub route_text_color: Option<String>,
    pub trip_name: String,
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub departure: DepartureStatus,
}

/// Raw feed data for one stop, as fetched for this render.
#[derive(Debug, Clone, Copy)]
pub struct BoardSources<'a> {
    pub stop_id: &'a str,
    pub stop: Option<&'a Stop>,
    pub trips: &'a [Trip],
    pub route: Option<&'a Route>,
    pub trip_updates: &'a [TripUpdateEntity],
}

pub fn compose_board(
    sources: BoardSources<'_>,
    candidate: Option<TripCandidate<'_>>,
    now: &DateTime<Tz>,
) -> NextBusBoard {
    let trip = candidate.map(|c| c.trip);

    let departure = match candidate {
        Some(TripCandidate { trip, departure }) => {
            let reconciled = reconcile(
                trip.trip_gid.as_deref(),
                departure.stop_time,
                departure.scheduled,
                sources.trip_updates,
            );
            DepartureStatus::Upcoming {
                time: format_time(&reconciled.departure),
                time_until: time_until(&reconciled.departure, now),
                scheduled_time: format_time(&departure.scheduled),
                realtime: reconciled.is_realtime(),
                delay: reconciled.delay,
                delay_text: reconciled.delay.map(|d| d.to_string()),
                delay_seconds: reconciled.delay_seconds,
            }
        }
        None if sources.trips.iter().any(|t| !t.stop_times.is_empty()) => {
            DepartureStatus::no_more_departures()
        }
        None => DepartureStatus::no_stop_times(),
    };

    let route_color = sources
        .route
        .and_then(|r| r.route_color.as_deref())
        .unwrap_or(DEFAULT_ROUTE_COLOR);

    NextBusBoard {
        stop_id: sources.stop_id.to_string(),
        stop_name: sources
            .stop
            .and_then(|s| s.stop_name.clone())
            .unwrap_or_else(|| "Unknown Stop".to_string()),
        route_label: route_label(sources.route),
        route_color: format!("#{}", route_color),
        route_text_color: sources
            .route
            .and_then(|r| r.route_text_color.as_deref())
            .map(|c| format!("#{}", c)),
        trip_name: trip_name(trip, sources.route),
        trip_id: trip.and_then(|t| t.trip_gid.clone()),
        route_id: sources
            .route
            .and_then(|r| r.route_gid.clone())
            .or_else(|| trip.and_then(|t| t.route_gid.clone())),
        departure,
    }
}
