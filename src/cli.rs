use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use openfalcon_datasource::{DataSourceConfig, TemplateVariables};
use tracing_subscriber::EnvFilter;

/// Query an Open-Falcon backend the way a dashboard would.
#[derive(Parser, Debug, Clone)]
#[command(name = "openfalcon", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Template variable, `name=value`; comma-separated values make a multi-value variable
    #[arg(long = "var", value_name = "NAME=VALUE", global = true)]
    pub vars: Vec<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct RangeArgs {
    #[arg(long, default_value = "now-6h", allow_hyphen_values = true)]
    pub from: String,

    #[arg(long, default_value = "now", allow_hyphen_values = true)]
    pub to: String,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run a render query and print the normalized series
    Query {
        /// Target expressions; `#A`, `#B`, .. refer to earlier targets
        #[arg(required = true)]
        targets: Vec<String>,

        /// Zero-based index of a target to hide (still referenceable)
        #[arg(long = "hide", value_name = "INDEX")]
        hide: Vec<usize>,

        #[command(flatten)]
        range: RangeArgs,

        /// `png` prints the render URL instead of sending the request
        #[arg(long)]
        format: Option<String>,

        #[arg(long)]
        max_data_points: Option<u32>,

        #[arg(long)]
        cache_timeout: Option<String>,
    },
    /// List metric tree nodes
    Find { query: String },
    /// Build annotations from a metric target or from tagged events
    Annotations {
        #[arg(long, conflicts_with = "tags")]
        target: Option<String>,

        #[arg(long)]
        tags: Option<String>,

        #[arg(long, default_value = "annotations")]
        name: String,

        #[command(flatten)]
        range: RangeArgs,
    },
    /// Print raw backend events
    Events {
        #[arg(long)]
        tags: Option<String>,

        #[command(flatten)]
        range: RangeArgs,
    },
    /// Check connectivity
    Test,
    /// Search saved dashboards
    Dashboards {
        #[arg(default_value = "")]
        query: String,
    },
    /// Load a saved dashboard by name
    Dashboard { name: String },
    /// Show current configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Validate configuration and exit
    Validate,
}

/// Logs go to stderr; stdout carries the JSON results.
pub fn init_logging(args: &CommonArgs) {
    let level = if args.quiet {
        "warn"
    } else if args.verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

pub fn load_config(config_path: Option<&PathBuf>) -> Result<DataSourceConfig> {
    match config_path {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            DataSourceConfig::load_from_path(path).context("Failed to load configuration")
        }
        None => DataSourceConfig::load().context("Failed to load configuration"),
    }
}

pub fn display_config(config: &DataSourceConfig, json: bool) -> Result<()> {
    if json {
        let json = serde_json::to_string_pretty(config)
            .context("Failed to serialize configuration to JSON")?;
        println!("{json}");
    } else {
        println!("Open-Falcon Datasource Configuration:");
        println!("=====================================");
        println!("Name: {}", config.name);
        println!("URL: {}", config.url);
        println!(
            "Basic auth: {}",
            if config.basic_auth.is_some() { "set" } else { "not set" }
        );
        println!("With credentials: {}", config.with_credentials);
        println!(
            "Cache timeout: {}",
            config.cache_timeout.as_deref().unwrap_or("backend default")
        );
        println!("Render method: {}", config.render_method.as_str());
        println!("Timeout: {:?}", config.timeout);
    }
    Ok(())
}

pub fn validate_config(config: &DataSourceConfig) -> Result<()> {
    tracing::info!("Validating configuration...");

    if config.url.is_empty() {
        anyhow::bail!("Datasource URL cannot be empty");
    }

    if !(config.url.starts_with("http://") || config.url.starts_with("https://")) {
        anyhow::bail!("Datasource URL must start with http:// or https://");
    }

    if config.basic_auth.as_deref().is_some_and(str::is_empty) {
        anyhow::bail!("Basic auth cannot be empty when set");
    }

    if config.timeout.is_zero() {
        anyhow::bail!("Timeout must be greater than zero");
    }

    tracing::info!("Configuration validation passed");
    Ok(())
}

/// Build the dashboard variables from `--var name=value` arguments.
pub fn parse_vars(vars: &[String]) -> Result<TemplateVariables> {
    let mut variables = TemplateVariables::new();

    for var in vars {
        let (name, value) = var
            .split_once('=')
            .with_context(|| format!("Invalid variable '{var}', expected NAME=VALUE"))?;
        if name.is_empty() {
            anyhow::bail!("Invalid variable '{var}', name is empty");
        }

        if value.contains(',') {
            let values: Vec<String> = value.split(',').map(str::to_string).collect();
            variables.insert(name, values);
        } else {
            variables.insert(name, value);
        }
    }

    Ok(variables)
}
