use crate::api_client::is_transient;
use crate::config::Config;
use crate::error::Error;
use crate::query::{parse_date, DATE_FORMAT};
use crate::retry::{run_with_retry, RetryPolicy};
use chrono::NaiveDate;
use log::{debug, info};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};

/// Request for one (pipeline, account) invocation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TriggerPayload {
    #[serde(alias = "mode")]
    pub table: String,
    pub ads_account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
}

impl TriggerPayload {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(Error::InvalidPayload)
    }

    /// Parsed start and end dates; blank values count as absent.
    pub fn dates(&self) -> Result<(Option<NaiveDate>, Option<NaiveDate>), Error> {
        let parse = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(parse_date)
                .transpose()
        };
        Ok((parse(&self.start)?, parse(&self.end)?))
    }
}

/// One payload per (pipeline, account), pipeline-major.
pub fn fan_out(
    pipelines: &[&str],
    accounts: &[String],
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Vec<TriggerPayload> {
    let format = |date: Option<NaiveDate>| date.map(|d| d.format(DATE_FORMAT).to_string());

    pipelines
        .iter()
        .flat_map(|pipeline| {
            accounts.iter().map(move |account| TriggerPayload {
                table: pipeline.to_string(),
                ads_account_id: account.clone(),
                start: format(start),
                end: format(end),
            })
        })
        .collect()
}

#[async_trait::async_trait]
pub trait TaskDispatcher: Send + Sync + 'static {
    /// Enqueues one remote invocation per job and returns how many were accepted.
    async fn enqueue(&self, jobs: &[TriggerPayload]) -> Result<usize, Error>;
}

/// Posts each job as JSON to a worker endpoint.
#[derive(Clone)]
pub struct HttpTaskDispatcher {
    client: Client,
    endpoint: Url,
    retry: RetryPolicy,
}

impl HttpTaskDispatcher {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let endpoint = config.task_endpoint.as_deref().ok_or_else(|| Error::NoData {
            message: "No task endpoint configured (set TASK_ENDPOINT)".to_string(),
        })?;

        Ok(HttpTaskDispatcher {
            client: Client::builder().timeout(config.http_timeout()).build()?,
            endpoint: Url::parse(endpoint)?,
            retry: config.retry_policy(),
        })
    }
}

#[async_trait::async_trait]
impl TaskDispatcher for HttpTaskDispatcher {
    async fn enqueue(&self, jobs: &[TriggerPayload]) -> Result<usize, Error> {
        for job in jobs {
            run_with_retry(
                &self.retry,
                |_| {
                    let request = self.client.post(self.endpoint.clone()).json(job);
                    let url = self.endpoint.to_string();
                    async move {
                        let resp = request
                            .send()
                            .await
                            .map_err(|e| Error::Transport(e.without_url()))?;
                        let status = resp.status();
                        if !status.is_success() {
                            let body = resp
                                .text()
                                .await
                                .map_err(|e| Error::Transport(e.without_url()))?;
                            return Err(Error::ApiFailure { url, status, body });
                        }
                        Ok::<(), Error>(())
                    }
                },
                is_transient,
            )
            .await?;
            debug!("enqueued {} for {}", job.table, job.ads_account_id);
        }

        info!("enqueued {} task(s) to {}", jobs.len(), self.endpoint);
        Ok(jobs.len())
    }
}
