//! The Open-Falcon datasource: dashboard operations on top of a [`Transport`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::form_urlencoded;

use crate::annotations::{self, AnnotationEvent, AnnotationSpec, Event};
use crate::config::DataSourceConfig;
use crate::error::{DatasourceError, Result};
use crate::params::{GraphOptions, ParamBuilder, RenderFormat};
use crate::response::{CanonicalResponse, RawResponse, normalize};
use crate::targets::QueryTarget;
use crate::template::{ScopedVars, VariableLookup};
use crate::time::{Clock, Rounding, TimeRange, TimeTranslator};
use crate::transport::{FORM_CONTENT_TYPE, HttpMethod, HttpRequest, HttpResponse, Transport};

/// Points requested per series when a metric target drives annotations.
const ANNOTATION_MAX_DATA_POINTS: u32 = 100;

/// A dashboard panel query.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub range: TimeRange,
    pub targets: Vec<QueryTarget>,
    pub format: Option<String>,
    pub max_data_points: Option<u32>,
    /// Falls back to the configured `cache_timeout` when unset or empty.
    pub cache_timeout: Option<String>,
    pub raw_data: Option<bool>,
    pub scoped_vars: Option<ScopedVars>,
}

impl QueryOptions {
    pub fn new(range: TimeRange, targets: Vec<QueryTarget>) -> Self {
        Self {
            range,
            targets,
            format: None,
            max_data_points: None,
            cache_timeout: None,
            raw_data: None,
            scoped_vars: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// Normalized series from a `json` render.
    Series(CanonicalResponse),
    /// URL of a server-rendered image; nothing was sent.
    RenderUrl(String),
}

/// A node of the metric tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricFindValue {
    pub text: String,
    pub expandable: bool,
}

/// Outcome of a connectivity check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub status: String,
    pub message: String,
    pub title: String,
}

impl TestResult {
    fn success() -> Self {
        Self {
            status: "success".to_string(),
            message: "Data source is working".to_string(),
            title: "Success".to_string(),
        }
    }
}

pub struct OpenFalconDatasource {
    config: DataSourceConfig,
    transport: Arc<dyn Transport>,
    variables: Arc<dyn VariableLookup>,
    time: TimeTranslator,
}

impl OpenFalconDatasource {
    pub fn new(
        config: DataSourceConfig,
        transport: Arc<dyn Transport>,
        variables: Arc<dyn VariableLookup>,
    ) -> Self {
        Self {
            config,
            transport,
            variables,
            time: TimeTranslator::new(),
        }
    }

    /// Anchor `now`-relative date math to `clock` instead of the system time.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.time = TimeTranslator::with_clock(clock);
        self
    }

    pub fn config(&self) -> &DataSourceConfig {
        &self.config
    }

    pub async fn query(&self, options: &QueryOptions) -> Result<QueryResult> {
        let cache_timeout = options
            .cache_timeout
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| self.config.cache_timeout.clone());

        let graph_options = GraphOptions {
            targets: options.targets.clone(),
            from: Some(self.time.translate(&options.range.from, Some(Rounding::Down))?),
            until: Some(self.time.translate(&options.range.to, Some(Rounding::Up))?),
            raw_data: options.raw_data,
            format: options.format.clone(),
            max_data_points: options.max_data_points,
            cache_timeout,
        };

        let params = ParamBuilder::new(self.variables.as_ref(), options.scoped_vars.as_ref())
            .build(&graph_options)?;

        if graph_options.render_format() == RenderFormat::Png {
            let url = format!("{}/render?{}", self.config.base_url(), params);
            debug!(url = %url, "Built render image URL");
            return Ok(QueryResult::RenderUrl(url));
        }

        debug!(
            method = self.config.render_method.as_str(),
            targets = params.target_count(),
            "Dispatching render request"
        );

        let request = match self.config.render_method {
            HttpMethod::Get => HttpRequest::get(format!("/render?{params}")),
            method => HttpRequest::new(method, "/render")
                .with_header("Content-Type", FORM_CONTENT_TYPE)
                .with_body(params.to_string()),
        };

        let response = self.do_request(request).await?;
        let raw = match response.data {
            Value::Null => RawResponse::default(),
            body => RawResponse {
                data: Some(json_rows(body, "render")?),
            },
        };

        Ok(QueryResult::Series(normalize(raw)?))
    }

    /// List metric tree nodes matching `query`.
    pub async fn metric_find_query(&self, query: &str) -> Result<Vec<MetricFindValue>> {
        let interpolated = self.variables.replace(query, None)?;
        let url = format!("/metrics/find/?query={}", encode_component(&interpolated));

        let response = self.do_request(HttpRequest::get(url)).await?;
        let rows = json_rows(response.data, "metric find")?;

        Ok(rows
            .iter()
            .map(|row| MetricFindValue {
                text: match &row["text"] {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                },
                expandable: is_truthy(&row["expandable"]),
            })
            .collect())
    }

    pub async fn annotation_query(
        &self,
        annotation: &AnnotationSpec,
        range: &TimeRange,
    ) -> Result<Vec<AnnotationEvent>> {
        if let Some(target) = annotation.target.as_deref().filter(|t| !t.is_empty()) {
            let target = self.variables.replace(target, None)?;
            let options = QueryOptions {
                format: Some(RenderFormat::Json.as_str().to_string()),
                max_data_points: Some(ANNOTATION_MAX_DATA_POINTS),
                ..QueryOptions::new(range.clone(), vec![QueryTarget::new(&target)])
            };

            let QueryResult::Series(response) = self.query(&options).await? else {
                return Ok(Vec::new());
            };
            return Ok(annotations::series_annotations(&response, annotation));
        }

        let tags = annotation
            .tags
            .as_deref()
            .map(|tags| self.variables.replace(tags, None))
            .transpose()?;
        let events = self.events(range, tags.as_deref()).await?;

        Ok(annotations::event_annotations(events, annotation))
    }

    /// Fetch backend events in `range`, optionally filtered by `tags`.
    pub async fn events(&self, range: &TimeRange, tags: Option<&str>) -> Result<Vec<Event>> {
        let from = self.time.translate(&range.from, None)?;
        let until = self.time.translate(&range.to, None)?;

        let mut url = format!(
            "/events/get_data?from={}&until={}",
            encode_component(&from.to_string()),
            encode_component(&until.to_string())
        );
        if let Some(tags) = tags.filter(|t| !t.is_empty()) {
            url.push_str("&tags=");
            url.push_str(&encode_component(tags));
        }

        let response = self.do_request(HttpRequest::get(url)).await?;
        let rows = json_rows(response.data, "events")?;

        rows.into_iter()
            .map(|row| serde_json::from_value(row).map_err(DatasourceError::from))
            .collect()
    }

    /// Check connectivity with an empty metric lookup.
    pub async fn test_datasource(&self) -> Result<TestResult> {
        self.metric_find_query("").await?;
        Ok(TestResult::success())
    }

    pub async fn list_dashboards(&self, query: &str) -> Result<Vec<Value>> {
        let url = format!("/dashboard/find/?query={}", encode_component(query));
        let response = self.do_request(HttpRequest::get(url)).await?;

        match response.data.get("dashboards") {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(list)) => Ok(list.clone()),
            Some(other) => Err(DatasourceError::MalformedResponse(format!(
                "dashboards is not a list: {other}"
            ))),
        }
    }

    pub async fn load_dashboard(&self, name: &str) -> Result<Value> {
        let url = format!("/dashboard/load/{}", encode_component(name));
        let response = self.do_request(HttpRequest::get(url)).await?;
        Ok(response.data)
    }

    /// Prefix the base URL and attach credentials, then send.
    async fn do_request(&self, mut request: HttpRequest) -> Result<HttpResponse> {
        request.url = format!("{}{}", self.config.base_url(), request.url);

        if self.config.basic_auth.is_some() || self.config.with_credentials {
            request.with_credentials = true;
        }
        if let Some(auth) = &self.config.basic_auth {
            request = request.with_header("Authorization", auth);
        }

        debug!(method = request.method.as_str(), url = %request.url, "Sending request");
        Ok(self.transport.request(request).await?)
    }
}

/// Percent-encode a single URL component; spaces become `%20`.
fn encode_component(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// A response body that should be a list of rows. `null` counts as empty.
fn json_rows(data: Value, what: &str) -> Result<Vec<Value>> {
    match data {
        Value::Null => Ok(Vec::new()),
        Value::Array(rows) => Ok(rows),
        other => Err(DatasourceError::MalformedResponse(format!(
            "{what} response is not a list: {other}"
        ))),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::CanonicalSeries;
    use crate::template::TemplateVariables;
    use crate::transport::{MockTransport, TransportError};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn config() -> DataSourceConfig {
        DataSourceConfig {
            url: "http://falcon:9966/".to_string(),
            ..Default::default()
        }
    }

    fn datasource(config: DataSourceConfig, transport: MockTransport) -> OpenFalconDatasource {
        let now = Utc.with_ymd_and_hms(2015, 5, 20, 10, 23, 45).unwrap();
        OpenFalconDatasource::new(
            config,
            Arc::new(transport),
            Arc::new(TemplateVariables::new().with("host", "web-01")),
        )
        .with_clock(Clock::Fixed(now))
    }

    fn ok(data: Value) -> std::result::Result<HttpResponse, TransportError> {
        Ok(HttpResponse { status: 200, data })
    }

    fn last_hour(targets: &[&str]) -> QueryOptions {
        QueryOptions::new(
            TimeRange::new("now-1h", "now"),
            targets.iter().map(|t| QueryTarget::new(t)).collect(),
        )
    }

    #[tokio::test]
    async fn test_query_posts_form_body() {
        let mut transport = MockTransport::new();
        transport
            .expect_request()
            .withf(|req| {
                req.method == HttpMethod::Post
                    && req.url == "http://falcon:9966/render"
                    && req.header("content-type") == Some(FORM_CONTENT_TYPE)
                    && req.body.as_deref()
                        == Some("target=web-01.cpu.idle&from=-1h&until=now&format=json")
                    && !req.with_credentials
            })
            .times(1)
            .returning(|_| {
                ok(json!([
                    {"Values": [{"timestamp": 1432117380, "value": 97.5}],
                     "counter": "cpu.idle", "endpoint": "web-01"}
                ]))
            });

        let ds = datasource(config(), transport);
        let result = ds.query(&last_hour(&["$host.cpu.idle"])).await.unwrap();

        let QueryResult::Series(response) = result else {
            panic!("expected series");
        };
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"data": [{"target": "web-01.cpu.idle", "datapoints": [[97.5, 1432117380000_i64]]}]})
        );
    }

    #[tokio::test]
    async fn test_query_decodes_row_list_body() {
        let mut transport = MockTransport::new();
        transport.expect_request().times(1).returning(|_| {
            ok(json!([
                {"endpoint": "h1", "counter": "load", "Values": [{"timestamp": 100, "value": 5}]},
                {"endpoint": "h2", "counter": "load", "Values": [{"timestamp": 100, "value": 7}]}
            ]))
        });

        let ds = datasource(config(), transport);
        let result = ds.query(&last_hour(&["*.load"])).await.unwrap();

        let QueryResult::Series(response) = result else {
            panic!("expected series");
        };
        let targets: Vec<&str> = response
            .data
            .iter()
            .filter_map(|s| match s {
                CanonicalSeries::Points { target, .. } => Some(target.as_str()),
                CanonicalSeries::Map { .. } => None,
            })
            .collect();
        assert_eq!(targets, vec!["h1.load", "h2.load"]);
    }

    #[tokio::test]
    async fn test_query_rejects_non_list_body() {
        let mut transport = MockTransport::new();
        transport
            .expect_request()
            .times(1)
            .returning(|_| ok(json!({"error": "no such counter"})));

        let ds = datasource(config(), transport);
        let err = ds.query(&last_hour(&["cpu"])).await.unwrap_err();
        assert!(matches!(err, DatasourceError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_query_get_uses_query_string() {
        let mut transport = MockTransport::new();
        transport
            .expect_request()
            .withf(|req| {
                req.method == HttpMethod::Get
                    && req.body.is_none()
                    && req.url == "http://falcon:9966/render?target=cpu&from=-1h&until=now&format=json"
            })
            .times(1)
            .returning(|_| ok(json!([])));

        let ds = datasource(
            DataSourceConfig {
                render_method: HttpMethod::Get,
                ..config()
            },
            transport,
        );
        let result = ds.query(&last_hour(&["cpu"])).await.unwrap();
        assert_eq!(result, QueryResult::Series(CanonicalResponse::default()));
    }

    #[tokio::test]
    async fn test_png_query_returns_url_without_sending() {
        let ds = datasource(config(), MockTransport::new());
        let options = QueryOptions {
            format: Some("png".to_string()),
            ..last_hour(&["cpu"])
        };

        let result = ds.query(&options).await.unwrap();
        assert_eq!(
            result,
            QueryResult::RenderUrl(
                "http://falcon:9966/render?target=cpu&from=-1h&until=now&format=png".to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_query_rounds_absolute_range_outwards() {
        let mut transport = MockTransport::new();
        transport
            .expect_request()
            .withf(|req| {
                req.body.as_deref()
                    == Some("target=cpu&from=1431993600&until=1432080059&format=json")
            })
            .times(1)
            .returning(|_| ok(Value::Null));

        let ds = datasource(config(), transport);
        let options = QueryOptions::new(
            TimeRange::new("now-1d/d", "now-1d/d"),
            vec![QueryTarget::new("cpu")],
        );
        let result = ds.query(&options).await.unwrap();
        assert_eq!(result, QueryResult::Series(CanonicalResponse::default()));
    }

    #[tokio::test]
    async fn test_cache_timeout_falls_back_to_config() {
        let mut transport = MockTransport::new();
        transport
            .expect_request()
            .withf(|req| req.body.as_deref().is_some_and(|b| b.ends_with("&cacheTimeout=120")))
            .times(2)
            .returning(|_| ok(json!([])));

        let ds = datasource(
            DataSourceConfig {
                cache_timeout: Some("120".to_string()),
                ..config()
            },
            transport,
        );

        ds.query(&last_hour(&["cpu"])).await.unwrap();
        let empty = QueryOptions {
            cache_timeout: Some(String::new()),
            ..last_hour(&["cpu"])
        };
        ds.query(&empty).await.unwrap();
    }

    #[tokio::test]
    async fn test_basic_auth_decorates_request() {
        let mut transport = MockTransport::new();
        transport
            .expect_request()
            .withf(|req| {
                req.with_credentials && req.header("Authorization") == Some("Basic dXNlcjpwYXNz")
            })
            .times(1)
            .returning(|_| ok(json!([])));

        let ds = datasource(
            DataSourceConfig {
                basic_auth: Some("Basic dXNlcjpwYXNz".to_string()),
                ..config()
            },
            transport,
        );
        ds.metric_find_query("*").await.unwrap();
    }

    #[tokio::test]
    async fn test_with_credentials_without_auth_header() {
        let mut transport = MockTransport::new();
        transport
            .expect_request()
            .withf(|req| req.with_credentials && req.header("Authorization").is_none())
            .times(1)
            .returning(|_| ok(json!([])));

        let ds = datasource(
            DataSourceConfig {
                with_credentials: true,
                ..config()
            },
            transport,
        );
        ds.metric_find_query("*").await.unwrap();
    }

    #[tokio::test]
    async fn test_metric_find_maps_rows() {
        let mut transport = MockTransport::new();
        transport
            .expect_request()
            .withf(|req| req.url == "http://falcon:9966/metrics/find/?query=web-01.*")
            .times(1)
            .returning(|_| {
                ok(json!([
                    {"text": "cpu", "expandable": 1},
                    {"text": "load", "expandable": 0},
                    {"text": "mem"}
                ]))
            });

        let ds = datasource(config(), transport);
        let nodes = ds.metric_find_query("$host.*").await.unwrap();
        assert_eq!(
            nodes,
            vec![
                MetricFindValue { text: "cpu".into(), expandable: true },
                MetricFindValue { text: "load".into(), expandable: false },
                MetricFindValue { text: "mem".into(), expandable: false },
            ]
        );
    }

    #[tokio::test]
    async fn test_transport_error_is_propagated() {
        let mut transport = MockTransport::new();
        transport.expect_request().times(1).returning(|_| {
            Err(TransportError::Api {
                status: 502,
                message: "bad gateway".to_string(),
            })
        });

        let ds = datasource(config(), transport);
        let err = ds.query(&last_hour(&["cpu"])).await.unwrap_err();
        assert!(matches!(
            err,
            DatasourceError::Transport(TransportError::Api { status: 502, .. })
        ));
    }

    #[tokio::test]
    async fn test_resolution_errors_are_raised_before_sending() {
        let ds = datasource(config(), MockTransport::new());
        let err = ds.query(&last_hour(&["sum(#C)"])).await.unwrap_err();
        assert!(matches!(err, DatasourceError::UnknownSeriesReference { .. }));
    }

    #[tokio::test]
    async fn test_test_datasource_reports_success() {
        let mut transport = MockTransport::new();
        transport
            .expect_request()
            .withf(|req| req.url == "http://falcon:9966/metrics/find/?query=")
            .times(1)
            .returning(|_| ok(json!([])));

        let ds = datasource(config(), transport);
        let result = ds.test_datasource().await.unwrap();
        assert_eq!(result.status, "success");
        assert_eq!(result.message, "Data source is working");
        assert_eq!(result.title, "Success");
    }

    #[test]
    fn test_encode_component() {
        assert_eq!(encode_component("my dash/1+1"), "my%20dash%2F1%2B1");
        assert_eq!(encode_component("cpu.idle"), "cpu.idle");
    }

    #[test]
    fn test_json_truthiness() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!(-1)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&Value::Null));
    }
}
