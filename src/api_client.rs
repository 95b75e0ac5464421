use crate::config::Config;
use crate::data::Record;
use crate::error::Error;
use crate::query::{DateRange, QuerySpec};
use crate::retry::{run_with_retry, RetryPolicy};
use crate::secrets::TokenSource;
use log::debug;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;

/// The three calls of the asynchronous insights protocol.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ReportApi: Send + Sync + 'static {
    /// Starts a report job for `account_id` and returns its `report_run_id`.
    async fn create_report_run(
        &self,
        account_id: &str,
        query: &QuerySpec,
        range: &DateRange,
    ) -> Result<String, Error>;

    /// Reads the progress of a report job.
    async fn get_report_status(&self, report_run_id: &str) -> Result<ReportStatus, Error>;

    /// Reads one page of a completed job's rows. `after` is the cursor handed
    /// out by the previous page, `None` for the first one.
    async fn get_report_page(
        &self,
        report_run_id: &str,
        limit: u32,
        after: Option<String>,
    ) -> Result<ReportPage, Error>;
}

/// Lists the ad accounts reachable from a business.
#[async_trait::async_trait]
pub trait AccountDirectory: Send + Sync + 'static {
    async fn fetch_account_ids(&self, business_id: &str) -> Result<Vec<String>, Error>;
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ReportStatus {
    pub async_percent_completion: f64,
    pub async_status: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ReportPage {
    pub data: Vec<Record>,
    #[serde(default)]
    pub paging: Option<Paging>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Paging {
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub cursors: Option<Cursors>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Cursors {
    #[serde(default)]
    pub after: Option<String>,
}

/// Cursor to request next, or `None` once `paging` marks the last page.
/// Every cursor is recorded in `followed`; meeting one again is a
/// [`Error::StuckCursor`] for `resource`.
pub fn advance_cursor(
    resource: &str,
    paging: Option<&Paging>,
    followed: &mut HashSet<String>,
) -> Result<Option<String>, Error> {
    let Some(cursor) = next_after(paging) else {
        return Ok(None);
    };
    if !followed.insert(cursor.to_string()) {
        return Err(Error::StuckCursor {
            resource: resource.to_string(),
            cursor: cursor.to_string(),
        });
    }
    Ok(Some(cursor.to_string()))
}

/// A page is the last one unless it links a `next` page and carries a
/// non-empty `after` cursor.
fn next_after(paging: Option<&Paging>) -> Option<&str> {
    let paging = paging?;
    paging.next.as_deref().filter(|next| !next.is_empty())?;
    paging
        .cursors
        .as_ref()?
        .after
        .as_deref()
        .filter(|after| !after.is_empty())
}

#[derive(Deserialize)]
struct ReportRun {
    report_run_id: String,
}

#[derive(Deserialize)]
struct AdAccount {
    account_id: String,
}

#[derive(Deserialize)]
struct AdAccountPage {
    data: Vec<AdAccount>,
    #[serde(default)]
    paging: Option<Paging>,
}

const ACCOUNT_EDGES: [&str; 2] = ["client_ad_accounts", "owned_ad_accounts"];
const ACCOUNT_PAGE_SIZE: u32 = 500;

/// Graph API paths address accounts as `act_<id>`.
pub fn account_node(account_id: &str) -> String {
    if account_id.starts_with("act_") {
        account_id.to_string()
    } else {
        format!("act_{}", account_id)
    }
}

#[derive(Clone)]
pub struct GraphApiClient {
    client: Client,
    base_url: Url,
    api_version: String,
    tokens: Arc<TokenSource>,
    retry: RetryPolicy,
}

impl GraphApiClient {
    pub fn new(config: &Config, tokens: Arc<TokenSource>) -> Result<Self, Error> {
        let base_url = Url::parse(&config.api_url)?;
        if base_url.cannot_be_a_base() {
            return Err(Error::UrlParsingFailed(
                url::ParseError::RelativeUrlWithCannotBeABaseBase,
            ));
        }

        let client = Client::builder().timeout(config.http_timeout()).build()?;

        Ok(GraphApiClient {
            client,
            base_url,
            api_version: config.api_version.clone(),
            tokens,
            retry: config.retry_policy(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, Error> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::UrlParsingFailed(url::ParseError::SetHostOnCannotBeABaseUrl))?
            .pop_if_empty()
            .push(&self.api_version)
            .extend(segments);
        Ok(url)
    }

    /// Sends one request under the transport retry policy and decodes the body.
    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        params: &[(&str, String)],
    ) -> Result<T, Error> {
        let token = self.tokens.token().await?;
        let context = url.path().to_string();

        let body = run_with_retry(
            &self.retry,
            |attempt| {
                debug!("{} {} (attempt {})", method, context, attempt);
                let request = self
                    .client
                    .request(method.clone(), url.clone())
                    .query(&[("access_token", token)])
                    .query(params);
                let context = context.clone();
                async move {
                    let resp = request
                        .send()
                        .await
                        .map_err(|e| Error::Transport(e.without_url()))?;
                    let status = resp.status();
                    let body = resp
                        .text()
                        .await
                        .map_err(|e| Error::Transport(e.without_url()))?;
                    if !status.is_success() {
                        return Err(Error::ApiFailure {
                            url: context,
                            status,
                            body,
                        });
                    }
                    Ok::<String, Error>(body)
                }
            },
            is_transient,
        )
        .await?;

        serde_json::from_str(&body).map_err(|source| Error::MalformedResponse { context, source })
    }
}

/// Connection problems, throttling and server errors are worth another try;
/// everything else is final.
pub fn is_transient(error: &Error) -> bool {
    match error {
        Error::Transport(e) => e.is_connect() || e.is_timeout() || e.is_request(),
        Error::ApiFailure { status, .. } => {
            *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
        }
        _ => false,
    }
}

#[async_trait::async_trait]
impl ReportApi for GraphApiClient {
    async fn create_report_run(
        &self,
        account_id: &str,
        query: &QuerySpec,
        range: &DateRange,
    ) -> Result<String, Error> {
        let url = self.endpoint(&[&account_node(account_id), "insights"])?;
        let run: ReportRun = self
            .send_json(Method::POST, url, &query.to_params(range))
            .await?;
        Ok(run.report_run_id)
    }

    async fn get_report_status(&self, report_run_id: &str) -> Result<ReportStatus, Error> {
        let url = self.endpoint(&[report_run_id])?;
        self.send_json(Method::GET, url, &[]).await
    }

    async fn get_report_page(
        &self,
        report_run_id: &str,
        limit: u32,
        after: Option<String>,
    ) -> Result<ReportPage, Error> {
        let url = self.endpoint(&[report_run_id, "insights"])?;
        let mut params = vec![("limit", limit.to_string())];
        if let Some(after) = after {
            params.push(("after", after));
        }
        self.send_json(Method::GET, url, &params).await
    }
}

#[async_trait::async_trait]
impl AccountDirectory for GraphApiClient {
    async fn fetch_account_ids(&self, business_id: &str) -> Result<Vec<String>, Error> {
        let mut account_ids: Vec<String> = vec![];

        for edge in ACCOUNT_EDGES {
            let url = self.endpoint(&[business_id, edge])?;
            let resource = format!("{}/{}", business_id, edge);
            let mut after: Option<String> = None;
            let mut followed = HashSet::new();

            loop {
                let mut params = vec![("limit", ACCOUNT_PAGE_SIZE.to_string())];
                if let Some(cursor) = &after {
                    params.push(("after", cursor.clone()));
                }
                let page: AdAccountPage =
                    self.send_json(Method::GET, url.clone(), &params).await?;

                for account in page.data {
                    if !account_ids.contains(&account.account_id) {
                        account_ids.push(account.account_id);
                    }
                }

                match advance_cursor(&resource, page.paging.as_ref(), &mut followed)? {
                    Some(cursor) => after = Some(cursor),
                    None => break,
                }
            }
        }

        if account_ids.is_empty() {
            return Err(Error::NoData {
                message: format!("No ad accounts found for business {}", business_id),
            });
        }

        Ok(account_ids)
    }
}
