//! Layered datasource configuration: defaults, TOML file, environment.

use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Deserializer, Serialize};

use crate::transport::HttpMethod;

/// Default configuration file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "openfalcon.toml";
/// Environment prefix; nested keys are separated by `__`.
pub const ENV_PREFIX: &str = "OPENFALCON__";

/// Datasource settings, fixed for the lifetime of a datasource instance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataSourceConfig {
    /// Display name of the datasource
    pub name: String,
    /// Base URL of the Open-Falcon query API, without trailing slash
    pub url: String,
    /// Value of the `Authorization` header, e.g. `Basic dXNlcjpwYXNz`
    pub basic_auth: Option<String>,
    /// Send credentials (cookies) with every request
    pub with_credentials: bool,
    /// Default `cacheTimeout` for render requests that do not set one.
    /// Accepts `60` as well as `"60"`.
    #[serde(default, deserialize_with = "string_or_number")]
    pub cache_timeout: Option<String>,
    /// HTTP method for `/render`; `GET` puts parameters in the query string
    pub render_method: HttpMethod,
    /// Transport timeout per request
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            name: "openfalcon".to_string(),
            url: "http://localhost:9966".to_string(),
            basic_auth: None,
            with_credentials: false,
            cache_timeout: None,
            render_method: HttpMethod::Post,
            timeout: Duration::from_secs(30),
        }
    }
}

impl DataSourceConfig {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::figment(Path::new(DEFAULT_CONFIG_FILE))
            .extract()
            .map_err(Box::new)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        Self::figment(path).extract().map_err(Box::new)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(DataSourceConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Base URL with any trailing slash removed.
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}

/// Environment values such as `60` are parsed as numbers before they reach
/// serde.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Unsigned(u64),
        Signed(i64),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(text) => text,
        Raw::Unsigned(n) => n.to_string(),
        Raw::Signed(n) => n.to_string(),
    }))
}
