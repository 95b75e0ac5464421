use crate::api_client::{AccountDirectory, GraphApiClient};
use crate::config::Config;
use crate::data::tag_batched_at;
use crate::error::Error;
use crate::pipeline::PipelineRegistry;
use crate::query::{validate_account_id, DateRange, DATE_FORMAT};
use crate::report::{FetchSettings, ReportFetcher};
use crate::secrets::TokenSource;
use crate::tasks::{fan_out, HttpTaskDispatcher, TaskDispatcher, TriggerPayload};
use crate::warehouse::{ParquetWarehouse, WarehouseSink};
use chrono::{NaiveDate, Utc};
use log::info;
use serde::Serialize;
use std::sync::Arc;

/// Outcome of one (pipeline, account) invocation.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub table: String,
    pub warehouse_table: String,
    pub ads_account_id: String,
    pub start: String,
    pub end: String,
    pub num_processed: usize,
    pub output_rows: usize,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct FanOutSummary {
    pub tasks: usize,
    pub pipelines: Vec<String>,
    pub accounts: Vec<String>,
}

pub struct PipelineRunner {
    registry: PipelineRegistry,
    fetcher: ReportFetcher,
    sink: Arc<dyn WarehouseSink>,
}

impl PipelineRunner {
    pub fn new(
        registry: PipelineRegistry,
        fetcher: ReportFetcher,
        sink: Arc<dyn WarehouseSink>,
    ) -> Self {
        PipelineRunner {
            registry,
            fetcher,
            sink,
        }
    }

    /// Fetches, reshapes and loads one pipeline for one account.
    pub async fn run(
        &self,
        pipeline_name: &str,
        account_id: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<RunSummary, Error> {
        let pipeline = self.registry.get(pipeline_name)?;
        validate_account_id(account_id)?;
        // Resolved once so the summary reports exactly the range that was requested.
        let range = self.fetcher.resolve_range(start, end)?;

        let raw = self
            .fetcher
            .fetch(
                &pipeline.query_spec(),
                account_id,
                Some(range.since),
                Some(range.until),
            )
            .await?;
        let num_processed = raw.len();

        let rows = tag_batched_at(pipeline.transform(raw)?, Utc::now());
        let table = pipeline.table_name(account_id);

        let output_rows = if rows.is_empty() {
            0
        } else {
            let written = self.sink.append(&table, pipeline.schema(), &rows).await?;
            self.sink
                .compact(&table, &pipeline.dedup_keys(), pipeline.recency_key())
                .await?;
            written
        };

        info!(
            "{} for {} ({} to {}): {} fetched, {} loaded into {}",
            pipeline.name, account_id, range.since, range.until, num_processed, output_rows, table
        );

        Ok(RunSummary {
            table: pipeline.name.to_string(),
            warehouse_table: table,
            ads_account_id: account_id.to_string(),
            start: range.since.format(DATE_FORMAT).to_string(),
            end: range.until.format(DATE_FORMAT).to_string(),
            num_processed,
            output_rows,
        })
    }

    pub async fn run_payload(&self, payload: &TriggerPayload) -> Result<RunSummary, Error> {
        let (start, end) = payload.dates()?;
        self.run(&payload.table, &payload.ads_account_id, start, end)
            .await
    }
}

fn build_runner(config: &Config) -> Result<PipelineRunner, Error> {
    let tokens = Arc::new(TokenSource::new(config));
    let api = Arc::new(GraphApiClient::new(config, tokens)?);
    let fetcher = ReportFetcher::new(api, FetchSettings::from(config));
    let sink = Arc::new(ParquetWarehouse::new(config));

    Ok(PipelineRunner::new(PipelineRegistry::default(), fetcher, sink))
}

pub async fn run_pipeline(
    config: &Config,
    pipeline_name: &str,
    account_id: &str,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<RunSummary, Error> {
    // Reject unknown pipelines and bad ranges before touching credentials.
    PipelineRegistry::default().get(pipeline_name)?;
    validate_account_id(account_id)?;
    DateRange::resolve(start, end, config.default_window_days)?;

    build_runner(config)?
        .run(pipeline_name, account_id, start, end)
        .await
}

pub async fn run_trigger(config: &Config, payload: &TriggerPayload) -> Result<RunSummary, Error> {
    let (start, end) = payload.dates()?;
    run_pipeline(config, &payload.table, &payload.ads_account_id, start, end).await
}

/// Enqueues one task per (pipeline, account). Accounts are the explicit ones
/// followed by those discovered under each business.
pub async fn dispatch_fan_out(
    config: &Config,
    pipelines: &[String],
    accounts: &[String],
    business_ids: &[String],
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<FanOutSummary, Error> {
    let registry = PipelineRegistry::default();
    let pipelines: Vec<&str> = if pipelines.is_empty() {
        registry.names()
    } else {
        pipelines
            .iter()
            .map(|name| registry.get(name).map(|p| p.name))
            .collect::<Result<_, _>>()?
    };
    if let (Some(start), Some(end)) = (start, end) {
        DateRange::new(start, end)?;
    }

    let mut account_ids: Vec<String> = vec![];
    let mut add = |id: String| {
        if !account_ids.contains(&id) {
            account_ids.push(id);
        }
    };
    for account in accounts {
        add(validate_account_id(account)?.to_string());
    }

    if !business_ids.is_empty() {
        let tokens = Arc::new(TokenSource::new(config));
        let api = GraphApiClient::new(config, tokens)?;
        for business_id in business_ids {
            api.fetch_account_ids(business_id)
                .await?
                .into_iter()
                .for_each(&mut add);
        }
    }

    if account_ids.is_empty() {
        return Err(Error::NoData {
            message: "No accounts to fan out to".to_string(),
        });
    }

    let jobs = fan_out(&pipelines, &account_ids, start, end);
    let dispatcher = HttpTaskDispatcher::new(config)?;
    let tasks = dispatcher.enqueue(&jobs).await?;

    Ok(FanOutSummary {
        tasks,
        pipelines: pipelines.iter().map(|p| p.to_string()).collect(),
        accounts: account_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::{Cursors, MockReportApi, Paging, ReportPage, ReportStatus};
    use crate::data::{Record, BATCHED_AT};
    use crate::query::parse_date;
    use crate::warehouse::MockWarehouseSink;
    use mockall::Sequence;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn settings() -> FetchSettings {
        FetchSettings {
            poll_interval: Duration::ZERO,
            ..FetchSettings::default()
        }
    }

    fn raw_row(i: usize) -> Record {
        json!({
            "date_start": "2021-01-01",
            "date_stop": "2021-01-01",
            "account_id": "123",
            "campaign_id": "c1",
            "adset_id": "s1",
            "ad_id": i.to_string(),
            "campaign_name": "Campaign",
            "adset_name": "Ad set",
            "ad_name": format!("Ad {}", i),
            "impressions": "100",
            "spend": "1.5",
            "actions": [{"action_type": "link_click", "value": "2", "1d_click": "2"}]
        })
        .as_object()
        .unwrap()
        .clone()
    }

    fn page(ids: std::ops::Range<usize>, after: Option<&str>) -> ReportPage {
        ReportPage {
            data: ids.map(raw_row).collect(),
            paging: Some(Paging {
                next: after.map(|a| format!("https://graph.example.com/next?after={}", a)),
                cursors: Some(Cursors {
                    after: after.map(str::to_string),
                }),
            }),
        }
    }

    fn completing_api(pages: Vec<ReportPage>) -> MockReportApi {
        let mut api = MockReportApi::new();
        api.expect_create_report_run()
            .times(1)
            .returning(|_, _, _| Ok("r1".to_string()));
        let mut polls = 0;
        api.expect_get_report_status().times(3).returning(move |_| {
            polls += 1;
            Ok(ReportStatus {
                async_percent_completion: if polls < 3 { 50.0 } else { 100.0 },
                async_status: if polls < 3 { "Job Running" } else { "Job Completed" }.to_string(),
            })
        });
        let mut pages = pages.into_iter();
        api.expect_get_report_page()
            .returning(move |_, _, _| Ok(pages.next().unwrap_or_default()));
        api
    }

    fn runner(api: MockReportApi, sink: Arc<dyn WarehouseSink>) -> PipelineRunner {
        PipelineRunner::new(
            PipelineRegistry::default(),
            ReportFetcher::new(Arc::new(api), settings()),
            sink,
        )
    }

    #[tokio::test]
    async fn test_run_loads_all_rows_then_compacts() {
        let api = completing_api(vec![page(0..6, Some("c1")), page(6..10, None)]);

        let mut sink = MockWarehouseSink::new();
        let mut seq = Sequence::new();
        sink.expect_append()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|table, schema, records| {
                assert_eq!(table, "AdsInsights_123");
                assert!(schema.field_with_name(BATCHED_AT).is_ok());
                assert_eq!(records.len(), 10);
                assert_eq!(records[0]["ad_id"], "0");
                assert_eq!(records[9]["ad_id"], "9");
                assert_eq!(records[0][BATCHED_AT], records[9][BATCHED_AT]);
                assert_eq!(records[3]["spend"], json!(1.5));
                Ok(records.len())
            });
        sink.expect_compact()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|table, keys, recency_key| {
                assert_eq!(table, "AdsInsights_123");
                assert_eq!(
                    keys,
                    &["date_start", "date_stop", "account_id", "campaign_id", "adset_id", "ad_id"]
                );
                assert_eq!(recency_key, BATCHED_AT);
                Ok(())
            });

        let summary = runner(api, Arc::new(sink))
            .run(
                "AdsInsights",
                "act_123",
                parse_date("2021-01-01").ok(),
                parse_date("2021-02-01").ok(),
            )
            .await
            .unwrap();

        assert_eq!(
            summary,
            RunSummary {
                table: "AdsInsights".to_string(),
                warehouse_table: "AdsInsights_123".to_string(),
                ads_account_id: "act_123".to_string(),
                start: "2021-01-01".to_string(),
                end: "2021-02-01".to_string(),
                num_processed: 10,
                output_rows: 10,
            }
        );
    }

    #[tokio::test]
    async fn test_empty_report_skips_the_warehouse() {
        let api = completing_api(vec![ReportPage::default()]);
        let mut sink = MockWarehouseSink::new();
        sink.expect_append().times(0);
        sink.expect_compact().times(0);

        let summary = runner(api, Arc::new(sink))
            .run("AdsInsights", "act_123", None, None)
            .await
            .unwrap();
        assert_eq!(summary.num_processed, 0);
        assert_eq!(summary.output_rows, 0);
    }

    #[tokio::test]
    async fn test_unknown_pipeline_fails_before_any_call() {
        let runner = runner(MockReportApi::new(), Arc::new(MockWarehouseSink::new()));
        let result = runner.run("Nope", "act_123", None, None).await;
        assert!(matches!(
            result.unwrap_err(),
            Error::UnknownPipeline { name } if name == "Nope"
        ));
    }

    #[tokio::test]
    async fn test_bad_payload_dates_fail_before_any_call() {
        let runner = runner(MockReportApi::new(), Arc::new(MockWarehouseSink::new()));
        let payload = TriggerPayload {
            table: "AdsInsights".to_string(),
            ads_account_id: "act_123".to_string(),
            start: Some("2021-02-01".to_string()),
            end: Some("2021-01-01".to_string()),
        };
        assert!(matches!(
            runner.run_payload(&payload).await.unwrap_err(),
            Error::StartDateAfterEndDate { .. }
        ));
    }

    #[tokio::test]
    async fn test_transform_error_stops_the_load() {
        let mut bad = raw_row(0);
        bad.remove("ad_id");
        let api = completing_api(vec![ReportPage {
            data: vec![bad],
            paging: None,
        }]);
        let mut sink = MockWarehouseSink::new();
        sink.expect_append().times(0);

        let result = runner(api, Arc::new(sink))
            .run("AdsInsights", "act_123", None, None)
            .await;
        assert!(matches!(
            result.unwrap_err(),
            Error::MissingField { field, .. } if field == "ad_id"
        ));
    }

    #[tokio::test]
    async fn test_run_into_parquet_warehouse() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::for_tests("https://graph.example.com");
        config.warehouse_dir = temp_dir.path().to_string_lossy().to_string();

        let api = completing_api(vec![page(0..3, None)]);
        let summary = runner(api, Arc::new(ParquetWarehouse::new(&config)))
            .run("AdsInsights", "act_123", None, None)
            .await
            .unwrap();

        assert_eq!(summary.output_rows, 3);
        assert!(temp_dir.path().join("AdsInsights_123").is_dir());
    }

    #[tokio::test]
    async fn test_run_pipeline_rejects_unknown_pipeline_without_credentials() {
        let mut config = Config::for_tests("https://graph.example.com");
        config.access_token = None;
        let result = run_pipeline(&config, "Nope", "act_123", None, None).await;
        assert!(matches!(result.unwrap_err(), Error::UnknownPipeline { .. }));
    }

    #[tokio::test]
    async fn test_fan_out_requires_accounts() {
        let config = Config::for_tests("https://graph.example.com");
        let result = dispatch_fan_out(&config, &[], &[], &[], None, None).await;
        assert!(matches!(result.unwrap_err(), Error::NoData { .. }));
    }

    #[tokio::test]
    async fn test_fan_out_rejects_unknown_pipeline() {
        let config = Config::for_tests("https://graph.example.com");
        let result = dispatch_fan_out(
            &config,
            &["Nope".to_string()],
            &["1".to_string()],
            &[],
            None,
            None,
        )
        .await;
        assert!(matches!(result.unwrap_err(), Error::UnknownPipeline { .. }));
    }

    #[tokio::test]
    async fn test_path_like_account_id_is_rejected_before_any_call() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::for_tests("https://graph.example.com");
        config.warehouse_dir = temp_dir.path().join("warehouse").to_string_lossy().to_string();

        let runner = runner(
            MockReportApi::new(),
            Arc::new(ParquetWarehouse::new(&config)),
        );
        let result = runner
            .run("AdsInsights", "act_1/../../escaped", None, None)
            .await;
        assert!(matches!(
            result.unwrap_err(),
            Error::InvalidAccountId { account_id } if account_id == "act_1/../../escaped"
        ));
        assert!(!temp_dir.path().join("escaped").exists());

        let result = run_pipeline(&config, "AdsInsights", "../1", None, None).await;
        assert!(matches!(result.unwrap_err(), Error::InvalidAccountId { .. }));

        let result = dispatch_fan_out(&config, &[], &["1/..".to_string()], &[], None, None).await;
        assert!(matches!(result.unwrap_err(), Error::InvalidAccountId { .. }));
    }

    #[test]
    fn test_summary_serializes_dates_as_strings() {
        let summary = RunSummary {
            table: "AdsInsights".to_string(),
            warehouse_table: "AdsInsights_123".to_string(),
            ads_account_id: "act_123".to_string(),
            start: "2021-01-01".to_string(),
            end: "2021-01-09".to_string(),
            num_processed: 2,
            output_rows: 2,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["start"], "2021-01-01");
        assert_eq!(json["end"], "2021-01-09");
    }
}
