//! Asynchronous report retrieval.
//!
//! A report is produced in three strictly ordered steps: a job is created,
//! its status is polled until the API declares it finished, then its rows are
//! read page by page. A job that ends as failed or skipped is discarded and
//! the whole sequence starts over with a new job, up to
//! [`FetchSettings::max_job_attempts`] jobs per call.

use crate::api_client::{advance_cursor, ReportApi};
use crate::config::Config;
use crate::data::Record;
use crate::error::Error;
use crate::query::{DateRange, QuerySpec};
use chrono::NaiveDate;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle of a report job as reported by `async_status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

impl JobStatus {
    /// Anything that is not a terminal status counts as running
    /// ("Job Not Started", "Job Started", "Job Running", ...).
    pub fn parse(async_status: &str) -> Self {
        match async_status {
            "Job Completed" => JobStatus::Completed,
            "Job Failed" => JobStatus::Failed,
            "Job Skipped" => JobStatus::Skipped,
            _ => JobStatus::Running,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            JobStatus::Running => "Running",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
            JobStatus::Skipped => "Skipped",
        };
        write!(f, "{}", label)
    }
}

/// How a polled job ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Completed,
    Failed(JobStatus),
}

#[derive(Clone, Debug)]
pub struct FetchSettings {
    pub poll_interval: Duration,
    pub max_poll_duration: Duration,
    pub max_job_attempts: u32,
    pub page_size: u32,
    pub default_window_days: u32,
}

impl Default for FetchSettings {
    fn default() -> Self {
        FetchSettings {
            poll_interval: Duration::from_secs(5),
            max_poll_duration: Duration::from_secs(3600),
            max_job_attempts: 5,
            page_size: 500,
            default_window_days: 8,
        }
    }
}

impl From<&Config> for FetchSettings {
    fn from(config: &Config) -> Self {
        FetchSettings {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            max_poll_duration: Duration::from_secs(config.max_poll_secs),
            max_job_attempts: config.max_job_attempts.max(1),
            page_size: config.page_size.max(1),
            default_window_days: config.default_window_days,
        }
    }
}

pub struct ReportFetcher {
    api: Arc<dyn ReportApi>,
    settings: FetchSettings,
}

impl ReportFetcher {
    pub fn new(api: Arc<dyn ReportApi>, settings: FetchSettings) -> Self {
        ReportFetcher { api, settings }
    }

    /// Fetches every row of the report described by `query` for one account.
    /// Missing dates default to a trailing window ending today (UTC).
    pub async fn fetch(
        &self,
        query: &QuerySpec,
        account_id: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<Record>, Error> {
        let range = self.resolve_range(start, end)?;
        self.fetch_range(query, account_id, &range).await
    }

    pub fn resolve_range(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<DateRange, Error> {
        DateRange::resolve(start, end, self.settings.default_window_days)
    }

    pub async fn fetch_range(
        &self,
        query: &QuerySpec,
        account_id: &str,
        range: &DateRange,
    ) -> Result<Vec<Record>, Error> {
        query.validate()?;

        let max_attempts = self.settings.max_job_attempts.max(1);
        let mut attempt = 1;

        loop {
            let report_run_id = self.request_report(query, account_id, range).await?;

            match self.poll_report(&report_run_id).await? {
                PollOutcome::Completed => {
                    let records = self.fetch_pages(&report_run_id).await?;
                    info!(
                        "report {} for {} ({} to {}) returned {} rows",
                        report_run_id,
                        account_id,
                        range.since,
                        range.until,
                        records.len()
                    );
                    return Ok(records);
                }
                PollOutcome::Failed(status) if attempt < max_attempts => {
                    warn!(
                        "report {} for {} ended as {} (attempt {}/{}); requesting a new one",
                        report_run_id, account_id, status, attempt, max_attempts
                    );
                    attempt += 1;
                }
                PollOutcome::Failed(status) => {
                    return Err(Error::JobFailed {
                        report_run_id,
                        status: status.to_string(),
                        attempts: attempt,
                    });
                }
            }
        }
    }

    /// Creates a report job and returns its id.
    pub async fn request_report(
        &self,
        query: &QuerySpec,
        account_id: &str,
        range: &DateRange,
    ) -> Result<String, Error> {
        query.validate()?;
        let report_run_id = self.api.create_report_run(account_id, query, range).await?;
        info!(
            "requested {}-level report {} for {}",
            query.level, report_run_id, account_id
        );
        Ok(report_run_id)
    }

    /// Polls a job until it is completed at 100%, failed or skipped.
    pub async fn poll_report(&self, report_run_id: &str) -> Result<PollOutcome, Error> {
        let started = Instant::now();

        loop {
            let status = self.api.get_report_status(report_run_id).await?;

            match JobStatus::parse(&status.async_status) {
                JobStatus::Completed if status.async_percent_completion >= 100.0 => {
                    return Ok(PollOutcome::Completed);
                }
                state @ (JobStatus::Failed | JobStatus::Skipped) => {
                    return Ok(PollOutcome::Failed(state));
                }
                _ => debug!(
                    "report {} at {}% ({})",
                    report_run_id, status.async_percent_completion, status.async_status
                ),
            }

            let elapsed = started.elapsed();
            if elapsed >= self.settings.max_poll_duration {
                return Err(Error::PollTimeout {
                    report_run_id: report_run_id.to_string(),
                    elapsed,
                });
            }

            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Reads every page of a completed job, in cursor order.
    pub async fn fetch_pages(&self, report_run_id: &str) -> Result<Vec<Record>, Error> {
        let mut records = vec![];
        let mut after: Option<String> = None;
        let mut followed: HashSet<String> = HashSet::new();
        let resource = format!("report {}", report_run_id);
        let mut pages = 0;

        loop {
            let page = self
                .api
                .get_report_page(report_run_id, self.settings.page_size, after.clone())
                .await?;
            pages += 1;

            let next = advance_cursor(&resource, page.paging.as_ref(), &mut followed)?;
            records.extend(page.data);

            match next {
                Some(cursor) => after = Some(cursor),
                None => break,
            }
        }

        debug!(
            "read {} rows in {} page(s) of report {}",
            records.len(),
            pages,
            report_run_id
        );
        Ok(records)
    }
}
