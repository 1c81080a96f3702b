//! Query layer of an Open-Falcon dashboard datasource.
//!
//! Translates dashboard panel queries (time ranges, target expressions with
//! template variables and `#A`-style series references) into render requests
//! for the Open-Falcon query API, and normalizes the answers into the series
//! shape dashboards expect.

pub mod annotations;
pub mod config;
pub mod datasource;
pub mod error;
pub mod params;
pub mod response;
pub mod targets;
pub mod template;
pub mod time;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use annotations::{AnnotationEvent, AnnotationSpec};
pub use config::DataSourceConfig;
pub use datasource::{
    MetricFindValue, OpenFalconDatasource, QueryOptions, QueryResult, TestResult,
};
pub use error::{DatasourceError, Result};
pub use response::{CanonicalResponse, CanonicalSeries, DataPoint};
pub use targets::QueryTarget;
pub use template::{ScopedVars, TemplateVariables, VariableLookup};
pub use time::{Clock, Rounding, TimeBoundary, TimeRange, TimeTranslator, TimeValue};
pub use transport::{HttpMethod, HttpRequest, HttpResponse, Transport, TransportError};
