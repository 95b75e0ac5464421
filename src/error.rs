use datafusion::{arrow::error::ArrowError, error::DataFusionError};
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("DataFusion: {0}")]
    DataFusion(#[from] DataFusionError),

    #[error("Arrow: {0}")]
    Arrow(#[from] ArrowError),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("'The date supplied {date} is invalid'")]
    InvalidDate { date: String },

    #[error("The start date: '{start_date}' is greater than the end date: '{end_date}'")]
    StartDateAfterEndDate {
        start_date: String,
        end_date: String,
    },

    #[error("Account id '{account_id}' is invalid, expected digits with an optional 'act_' prefix")]
    InvalidAccountId { account_id: String },

    #[error("Pipeline '{name}' is not supported")]
    UnknownPipeline { name: String },

    #[error("A report query needs at least one field")]
    EmptyFieldList,

    #[error("Invalid trigger payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),

    #[error("Failed to serialize {context}: {source}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API {url} responded with {status}: {body}")]
    ApiFailure {
        url: String,
        status: StatusCode,
        body: String,
    },

    #[error("Malformed response from {context}: {source}")]
    MalformedResponse {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Report {report_run_id} ended as {status} after {attempts} attempt(s)")]
    JobFailed {
        report_run_id: String,
        status: String,
        attempts: u32,
    },

    #[error("Report {report_run_id} did not complete within {elapsed:?}")]
    PollTimeout {
        report_run_id: String,
        elapsed: Duration,
    },

    #[error("{resource} returned the cursor '{cursor}' twice")]
    StuckCursor { resource: String, cursor: String },

    #[error("Row in {pipeline} is missing required field '{field}'")]
    MissingField { pipeline: String, field: String },

    #[error("Field '{field}' has a non-numeric value: {value}")]
    InvalidMetric { field: String, value: String },

    #[error("Failed to parse URL: {0}")]
    UrlParsingFailed(#[from] url::ParseError),

    #[error("{message}")]
    MissingSecret { message: String },

    #[error("{message}")]
    NoData { message: String },
}
