use serde::Serialize;

use crate::wego_api_models::{Alert, AlertEntity};

/// An alert with no declared start is always active. Only the first active
/// period is consulted.
pub fn is_active(alert: &Alert, now_epoch: i64) -> bool {
    alert
        .active_period
        .first()
        .and_then(|period| period.start)
        .is_none_or(|start| start <= now_epoch)
}

pub fn mentions_route(alert: &Alert, route_id: &str) -> bool {
    alert
        .informed_entity
        .iter()
        .any(|entity| entity.route_id.as_deref() == Some(route_id))
}

/// Active alerts naming `route_id`, in feed order.
pub fn alerts_for_route<'a>(
    route_id: &str,
    alerts: &'a [AlertEntity],
    now_epoch: i64,
) -> Vec<&'a Alert> {
    alerts
        .iter()
        .filter_map(|entity| entity.alert.as_ref())
        .filter(|alert| mentions_route(alert, route_id) && is_active(alert, now_epoch))
        .collect()
}

/// What the tile has room for: the first alert and a count of the rest.
/// No ranking; first in the feed is what gets shown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertSummary {
    pub headline: String,
    pub description: String,
    pub total: usize,
    pub more_label: Option<String>,
}

impl AlertSummary {
    pub fn from_matches(matches: &[&Alert]) -> Option<Self> {
        let first = matches.first()?;

        let headline = first
            .header_text
            .as_ref()
            .and_then(|t| t.first_text())
            .unwrap_or("Alert")
            .to_string();
        let description = first
            .description_text
            .as_ref()
            .and_then(|t| t.first_text())
            .unwrap_or_default()
            .to_string();

        let more_label = match matches.len() {
            0 | 1 => None,
            2 => Some("+1 more alert".to_string()),
            n => Some(format!("+{} more alerts", n - 1)),
        };

        Some(AlertSummary {
            headline,
            description,
            total: matches.len(),
            more_label,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_760_792_400;

    fn alerts(json: &str) -> Vec<AlertEntity> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn filters_by_route_and_activity() {
        let feed = alerts(&format!(
            r#"[
                {{"id": "a", "alert": {{"informed_entity": [{{"route_id": "52"}}],
                  "header_text": {{"translation": [{{"text": "Detour"}}]}}}}}},
                {{"id": "b", "alert": {{"informed_entity": [{{"route_id": "56"}}]}}}},
                {{"id": "c", "alert": {{"informed_entity": [{{"stop_id": "X"}}, {{"route_id": 52}}],
                  "active_period": [{{"start": {past}}}]}}}},
                {{"id": "d", "alert": {{"informed_entity": [{{"route_id": "52"}}],
                  "active_period": [{{"start": {future}}}]}}}},
                {{"id": "e", "alert": {{"informed_entity": [{{"route_id": "52"}}],
                  "active_period": [{{"end": {future}}}]}}}},
                {{"id": "f"}}
            ]"#,
            past = NOW - 60,
            future = NOW + 3600,
        ));

        let matched = alerts_for_route("52", &feed, NOW);
        assert_eq!(matched.len(), 3);
        assert_eq!(matched[0].header_text.as_ref().unwrap().first_text(), Some("Detour"));
    }

    #[test]
    fn start_exactly_now_is_active() {
        let feed = alerts(&format!(
            r#"[{{"alert": {{"informed_entity": [{{"route_id": "52"}}], "active_period": [{{"start": {}}}]}}}}]"#,
            NOW
        ));
        assert_eq!(alerts_for_route("52", &feed, NOW).len(), 1);
    }

    #[test]
    fn all_future_alerts_yield_nothing() {
        let feed = alerts(&format!(
            r#"[
                {{"alert": {{"informed_entity": [{{"route_id": "52"}}], "active_period": [{{"start": {0}}}]}}}},
                {{"alert": {{"informed_entity": [{{"route_id": "7"}}], "active_period": [{{"start": {0}}}]}}}}
            ]"#,
            NOW + 1
        ));
        for route in ["52", "7", "3"] {
            assert!(alerts_for_route(route, &feed, NOW).is_empty());
        }
    }

    #[test]
    fn summary_shows_first_and_counts_rest() {
        let feed = alerts(
            r#"[
                {"alert": {"informed_entity": [{"route_id": "52"}],
                  "header_text": {"translation": [{"text": "Stop closed"}]},
                  "description_text": {"translation": [{"text": "Use the stop across the street."}]}}},
                {"alert": {"informed_entity": [{"route_id": "52"}]}},
                {"alert": {"informed_entity": [{"route_id": "52"}]}}
            ]"#,
        );
        let matched = alerts_for_route("52", &feed, NOW);

        let summary = AlertSummary::from_matches(&matched).unwrap();
        assert_eq!(summary.headline, "Stop closed");
        assert_eq!(summary.description, "Use the stop across the street.");
        assert_eq!(summary.total, 3);
        assert_eq!(summary.more_label.as_deref(), Some("+2 more alerts"));

        let summary = AlertSummary::from_matches(&matched[1..]).unwrap();
        assert_eq!(summary.headline, "Alert");
        assert_eq!(summary.description, "");
        assert_eq!(summary.more_label.as_deref(), Some("+1 more alert"));

        let summary = AlertSummary::from_matches(&matched[2..]).unwrap();
        assert!(summary.more_label.is_none());

        assert!(AlertSummary::from_matches(&[]).is_none());
    }
}
