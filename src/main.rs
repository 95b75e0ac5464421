mod api_client;
mod config;
mod data;
mod error;
mod pipeline;
mod query;
mod report;
mod retry;
mod runner;
mod secrets;
mod tasks;
mod warehouse;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use config::Config;
use error::Error;
use log::error;
use serde::Serialize;
use std::path::PathBuf;
use tasks::TriggerPayload;
use tokio::io::AsyncReadExt;

#[derive(Parser)]
#[command(about = "Loads ads insights reports into a local warehouse")]
struct Args {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch one pipeline for one account and load it
    Run {
        pipeline: String,

        account: String,

        #[arg(long, help = "Date should be in the form YYYY-MM-DD", value_parser = validate_date)]
        start: Option<NaiveDate>,

        #[arg(long, help = "Date should be in the form YYYY-MM-DD", value_parser = validate_date)]
        end: Option<NaiveDate>,
    },
    /// Run from a JSON trigger payload read from a file, or stdin with `-`
    Trigger { payload: PathBuf },
    /// Enqueue one task per (pipeline, account)
    FanOut {
        #[arg(long = "pipeline")]
        pipelines: Vec<String>,

        #[arg(long = "account")]
        accounts: Vec<String>,

        #[arg(long = "business-id")]
        business_ids: Vec<String>,

        #[arg(long, help = "Date should be in the form YYYY-MM-DD", value_parser = validate_date)]
        start: Option<NaiveDate>,

        #[arg(long, help = "Date should be in the form YYYY-MM-DD", value_parser = validate_date)]
        end: Option<NaiveDate>,
    },
    /// List the supported pipelines
    Pipelines,
}

fn validate_date(s: &str) -> Result<NaiveDate, String> {
    query::parse_date(s).map_err(|_| "Invalid date, expected YYYY-MM-DD".to_string())
}

async fn read_payload(path: &PathBuf) -> Result<TriggerPayload, Error> {
    let json = if path.as_os_str() == "-" {
        let mut buf = String::new();
        tokio::io::stdin().read_to_string(&mut buf).await?;
        buf
    } else {
        tokio::fs::read_to_string(path).await?
    };
    TriggerPayload::from_json(&json)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Error> {
    let json = serde_json::to_string_pretty(value).map_err(|source| Error::Serialization {
        context: "summary".to_string(),
        source,
    })?;
    println!("{}", json);
    Ok(())
}

async fn execute(args: Args) -> Result<(), Error> {
    let config = args.config;

    match args.command {
        Command::Run {
            pipeline,
            account,
            start,
            end,
        } => {
            let summary = runner::run_pipeline(&config, &pipeline, &account, start, end).await?;
            print_json(&summary)
        }
        Command::Trigger { payload } => {
            let payload = read_payload(&payload).await?;
            let summary = runner::run_trigger(&config, &payload).await?;
            print_json(&summary)
        }
        Command::FanOut {
            pipelines,
            accounts,
            business_ids,
            start,
            end,
        } => {
            let summary = runner::dispatch_fan_out(
                &config,
                &pipelines,
                &accounts,
                &business_ids,
                start,
                end,
            )
            .await?;
            print_json(&summary)
        }
        Command::Pipelines => {
            for name in pipeline::PipelineRegistry::default().names() {
                println!("{}", name);
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    env_logger::init();

    if let Err(err) = execute(args).await {
        error!("failed to load ads insights: {}", err);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_validate_date() {
        assert_eq!(
            validate_date("2021-01-31").unwrap(),
            NaiveDate::from_ymd_opt(2021, 1, 31).unwrap()
        );
        assert!(validate_date("2021-02-31").is_err());
        assert!(validate_date("31-01-2021").is_err());
    }

    #[test]
    fn test_parse_run_command() {
        let args = Args::try_parse_from([
            "ads-insights-loader",
            "--access-token",
            "t",
            "run",
            "AdsInsights",
            "act_123",
            "--start",
            "2021-01-01",
        ])
        .unwrap();

        match args.command {
            Command::Run {
                pipeline,
                account,
                start,
                end,
            } => {
                assert_eq!(pipeline, "AdsInsights");
                assert_eq!(account, "act_123");
                assert_eq!(start, NaiveDate::from_ymd_opt(2021, 1, 1));
                assert_eq!(end, None);
            }
            _ => panic!("expected run"),
        }
    }

    #[tokio::test]
    async fn test_read_payload_from_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("payload.json");
        std::fs::write(&path, r#"{"table": "AdsInsights", "ads_account_id": "act_1"}"#).unwrap();

        let payload = read_payload(&path).await.unwrap();
        assert_eq!(payload.ads_account_id, "act_1");
    }

    #[test]
    fn test_print_json_reports_serialization_failure() {
        let summary: std::collections::BTreeMap<(u8, u8), u8> = [((1, 2), 3)].into_iter().collect();
        assert!(matches!(
            print_json(&summary).unwrap_err(),
            Error::Serialization { context, .. } if context == "summary"
        ));
    }
}
