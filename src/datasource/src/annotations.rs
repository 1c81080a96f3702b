//! Annotation entries built from metric series or backend events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::response::{CanonicalResponse, CanonicalSeries};

/// Annotation definition from the dashboard.
///
/// With a `target`, every non-zero point of that series becomes an
/// annotation; otherwise backend events matching `tags` are used.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
}

/// A backend event row from `/events/get_data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Epoch seconds
    pub when: f64,
    #[serde(default)]
    pub what: String,
    #[serde(default)]
    pub tags: Option<Value>,
    #[serde(default)]
    pub data: Option<Value>,
}

/// One annotation marker on the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationEvent {
    pub annotation: AnnotationSpec,
    /// Epoch milliseconds
    pub time: i64,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<Value>,
}

/// Every point with a non-zero, non-null value becomes an annotation titled
/// after its series. Map payloads carry no points and yield nothing.
pub fn series_annotations(
    response: &CanonicalResponse,
    annotation: &AnnotationSpec,
) -> Vec<AnnotationEvent> {
    let mut list = Vec::new();

    for series in &response.data {
        let CanonicalSeries::Points { target, datapoints } = series else {
            continue;
        };
        for point in datapoints {
            let marked = point.value().is_some_and(|v| v != 0.0 && !v.is_nan());
            if !marked {
                continue;
            }
            list.push(AnnotationEvent {
                annotation: annotation.clone(),
                time: point.timestamp_ms(),
                title: target.clone(),
                tags: None,
                text: None,
            });
        }
    }

    list
}

pub fn event_annotations(events: Vec<Event>, annotation: &AnnotationSpec) -> Vec<AnnotationEvent> {
    events
        .into_iter()
        .map(|e| AnnotationEvent {
            annotation: annotation.clone(),
            time: (e.when * 1000.0).round() as i64,
            title: e.what,
            tags: e.tags,
            text: e.data,
        })
        .collect()
}
