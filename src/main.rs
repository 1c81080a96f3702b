mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use openfalcon_datasource::{
    AnnotationSpec, DataSourceConfig, OpenFalconDatasource, QueryOptions, QueryResult,
    QueryTarget, TimeRange, transport::ReqwestTransport,
};
use serde::Serialize;

use crate::cli::{Cli, Command, RangeArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    cli::init_logging(&args.common);

    let config = cli::load_config(args.common.config.as_ref())?;

    match &args.command {
        Command::Config { json } => return cli::display_config(&config, *json),
        Command::Validate => return cli::validate_config(&config),
        _ => {}
    }

    let datasource = build_datasource(&args, config)?;
    run(&datasource, args.command).await
}

fn build_datasource(args: &Cli, config: DataSourceConfig) -> Result<OpenFalconDatasource> {
    let variables = cli::parse_vars(&args.vars)?;
    let transport =
        ReqwestTransport::new(config.timeout).context("Failed to create HTTP client")?;

    Ok(OpenFalconDatasource::new(
        config,
        Arc::new(transport),
        Arc::new(variables),
    ))
}

async fn run(datasource: &OpenFalconDatasource, command: Command) -> Result<()> {
    match command {
        Command::Query {
            targets,
            hide,
            range,
            format,
            max_data_points,
            cache_timeout,
        } => {
            let targets = targets
                .iter()
                .enumerate()
                .map(|(i, t)| {
                    if hide.contains(&i) {
                        QueryTarget::hidden(t)
                    } else {
                        QueryTarget::new(t)
                    }
                })
                .collect();

            let options = QueryOptions {
                format,
                max_data_points,
                cache_timeout,
                ..QueryOptions::new(time_range(&range), targets)
            };

            match datasource.query(&options).await.context("Query failed")? {
                QueryResult::Series(response) => print_json(&response),
                QueryResult::RenderUrl(url) => {
                    println!("{url}");
                    Ok(())
                }
            }
        }
        Command::Find { query } => {
            let nodes = datasource
                .metric_find_query(&query)
                .await
                .context("Metric lookup failed")?;
            print_json(&nodes)
        }
        Command::Annotations {
            target,
            tags,
            name,
            range,
        } => {
            let annotation = AnnotationSpec { name, target, tags };
            let list = datasource
                .annotation_query(&annotation, &time_range(&range))
                .await
                .context("Annotation query failed")?;
            print_json(&list)
        }
        Command::Events { tags, range } => {
            let events = datasource
                .events(&time_range(&range), tags.as_deref())
                .await
                .context("Events query failed")?;
            print_json(&events)
        }
        Command::Test => {
            let result = datasource
                .test_datasource()
                .await
                .context("Data source test failed")?;
            print_json(&result)
        }
        Command::Dashboards { query } => {
            let list = datasource
                .list_dashboards(&query)
                .await
                .context("Dashboard search failed")?;
            print_json(&list)
        }
        Command::Dashboard { name } => {
            let dashboard = datasource
                .load_dashboard(&name)
                .await
                .with_context(|| format!("Failed to load dashboard '{name}'"))?;
            print_json(&dashboard)
        }
        Command::Config { .. } | Command::Validate => Ok(()),
    }
}

fn time_range(range: &RangeArgs) -> TimeRange {
    TimeRange::new(range.from.as_str(), range.to.as_str())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}
