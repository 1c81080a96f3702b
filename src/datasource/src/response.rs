//! Normalization of backend render responses into canonical series.
//!
//! The backend answers a render request with one row per counter:
//!
//! ```json
//! {"endpoint": "web-01", "counter": "cpu.idle",
//!  "Values": [{"timestamp": 1432117380, "value": 97.5}]}
//! ```
//!
//! Timestamps are epoch seconds. Dashboards expect
//! `{"target": "web-01.cpu.idle", "datapoints": [[97.5, 1432117380000]]}`
//! with millisecond timestamps. Map panels instead receive host location rows
//! tagged with `chartType`, which are handed through as-is.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DatasourceError, Result};

/// Discriminator of map/location payloads.
const CHART_TYPE_FIELD: &str = "chartType";
/// Field carrying the point list of a time-series row.
const VALUES_FIELD: &str = "Values";

/// Raw render response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawResponse {
    #[serde(default)]
    pub data: Option<Vec<Value>>,
}

/// `[value, timestampMs]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint(pub Option<f64>, pub i64);

impl DataPoint {
    pub fn value(&self) -> Option<f64> {
        self.0
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.1
    }
}

/// A series in the shape the dashboard renders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CanonicalSeries {
    /// Time series with millisecond timestamps.
    Points {
        target: String,
        datapoints: Vec<DataPoint>,
    },
    /// Map/location rows, untouched.
    Map { datapoints: Vec<Value> },
}

/// Normalized render response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalResponse {
    pub data: Vec<CanonicalSeries>,
}

impl CanonicalResponse {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct PointRow {
    #[serde(rename = "Values", default)]
    values: Option<Vec<RawPoint>>,
    #[serde(default)]
    counter: String,
    #[serde(default)]
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct RawPoint {
    timestamp: i64,
    #[serde(default)]
    value: Option<f64>,
}

/// A series still carrying the backend's second-resolution timestamps.
struct SecondsSeries {
    target: String,
    points: Vec<(Option<f64>, i64)>,
}

impl SecondsSeries {
    fn into_millis(self) -> Result<CanonicalSeries> {
        let datapoints = self
            .points
            .into_iter()
            .map(|(value, secs)| {
                secs.checked_mul(1000)
                    .map(|ms| DataPoint(value, ms))
                    .ok_or_else(|| {
                        DatasourceError::MalformedResponse(format!(
                            "timestamp {secs} out of range"
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(CanonicalSeries::Points {
            target: self.target,
            datapoints,
        })
    }
}

fn has_field(row: &Value, field: &str) -> bool {
    row.as_object().is_some_and(|obj| obj.contains_key(field))
}

/// Normalize a raw render response.
///
/// A missing data list yields an empty response; an empty one is returned
/// as is. Rows without a `Values` field are skipped.
pub fn normalize(raw: RawResponse) -> Result<CanonicalResponse> {
    let Some(rows) = raw.data else {
        return Ok(CanonicalResponse::default());
    };
    let Some(first) = rows.first() else {
        return Ok(CanonicalResponse::default());
    };

    if has_field(first, CHART_TYPE_FIELD) {
        return Ok(CanonicalResponse {
            data: vec![CanonicalSeries::Map { datapoints: rows }],
        });
    }

    let mut series = Vec::new();
    for row in rows {
        if !has_field(&row, VALUES_FIELD) {
            continue;
        }
        let row: PointRow = serde_json::from_value(row)?;
        series.push(SecondsSeries {
            target: format!("{}.{}", row.endpoint, row.counter),
            points: row
                .values
                .unwrap_or_default()
                .into_iter()
                .map(|p| (p.value, p.timestamp))
                .collect(),
        });
    }

    // Seconds -> milliseconds, once per point.
    let data = series
        .into_iter()
        .map(SecondsSeries::into_millis)
        .collect::<Result<Vec<_>>>()?;

    Ok(CanonicalResponse { data })
}
