use crate::error::Error;
use chrono::{Days, NaiveDate, Utc};
use serde::Serialize;
use serde_json::{json, Value};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Attribution windows requested for every conversion metric.
pub const ATTRIBUTION_WINDOWS: [&str; 4] = ["1d_click", "1d_view", "7d_click", "7d_view"];

/// Ad delivery statuses that are kept by the default status filter.
pub const AD_EFFECTIVE_STATUSES: [&str; 12] = [
    "ACTIVE",
    "PAUSED",
    "DELETED",
    "PENDING_REVIEW",
    "DISAPPROVED",
    "PREAPPROVED",
    "PENDING_BILLING_INFO",
    "CAMPAIGN_PAUSED",
    "ARCHIVED",
    "ADSET_PAUSED",
    "IN_PROCESS",
    "WITH_ISSUES",
];

/// One predicate of the report's `filtering` list.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Filter {
    pub field: String,
    pub operator: String,
    pub value: Value,
}

impl Filter {
    pub fn new(field: &str, operator: &str, value: Value) -> Self {
        Filter {
            field: field.to_string(),
            operator: operator.to_string(),
            value,
        }
    }
}

/// Filters applied to every report: delivered ads only, in any known status.
pub fn default_filters() -> Vec<Filter> {
    vec![
        Filter::new("ad.impressions", "GREATER_THAN", json!(0)),
        Filter::new("ad.effective_status", "IN", json!(AD_EFFECTIVE_STATUSES)),
    ]
}

/// What a report job should compute. Built once per invocation and never mutated.
#[derive(Clone, Debug, PartialEq)]
pub struct QuerySpec {
    pub level: String,
    pub fields: Vec<String>,
    pub breakdowns: Option<String>,
    pub attribution_windows: Vec<String>,
    pub filtering: Vec<Filter>,
}

impl QuerySpec {
    pub fn new(level: &str, fields: &[&str]) -> Self {
        QuerySpec {
            level: level.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            breakdowns: None,
            attribution_windows: ATTRIBUTION_WINDOWS.iter().map(|w| w.to_string()).collect(),
            filtering: default_filters(),
        }
    }

    pub fn with_breakdowns(mut self, breakdowns: Option<String>) -> Self {
        self.breakdowns = breakdowns.filter(|b| !b.is_empty());
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.fields.is_empty() {
            return Err(Error::EmptyFieldList);
        }
        Ok(())
    }

    /// Encodes the job-creation parameters, minus the credential.
    pub fn to_params(&self, range: &DateRange) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("level", self.level.clone()),
            ("fields", json!(self.fields).to_string()),
            (
                "action_attribution_windows",
                json!(self.attribution_windows).to_string(),
            ),
            ("filtering", json!(self.filtering).to_string()),
            ("time_increment", "1".to_string()),
            ("time_range", range.to_json().to_string()),
        ];
        if let Some(breakdowns) = &self.breakdowns {
            params.push(("breakdowns", breakdowns.clone()));
        }
        params
    }
}

/// Inclusive calendar date range of a report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DateRange {
    pub since: NaiveDate,
    pub until: NaiveDate,
}

impl DateRange {
    pub fn new(since: NaiveDate, until: NaiveDate) -> Result<Self, Error> {
        if since > until {
            return Err(Error::StartDateAfterEndDate {
                start_date: since.to_string(),
                end_date: until.to_string(),
            });
        }
        Ok(DateRange { since, until })
    }

    /// Fills in missing bounds relative to today (UTC).
    pub fn resolve(
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        window_days: u32,
    ) -> Result<Self, Error> {
        Self::resolve_at(start, end, Utc::now().date_naive(), window_days)
    }

    /// A missing end is `today`; a missing start is `window_days` before the end.
    pub fn resolve_at(
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        today: NaiveDate,
        window_days: u32,
    ) -> Result<Self, Error> {
        let until = end.unwrap_or(today);
        let since = match start {
            Some(start) => start,
            None => until
                .checked_sub_days(Days::new(window_days as u64))
                .ok_or_else(|| Error::InvalidDate {
                    date: until.to_string(),
                })?,
        };
        Self::new(since, until)
    }

    fn to_json(self) -> Value {
        json!({
            "since": self.since.format(DATE_FORMAT).to_string(),
            "until": self.until.format(DATE_FORMAT).to_string(),
        })
    }
}

/// Parses a strict `YYYY-MM-DD` date.
pub fn parse_date(s: &str) -> Result<NaiveDate, Error> {
    let invalid = || Error::InvalidDate {
        date: s.to_string(),
    };
    if s.len() != 10 {
        return Err(invalid());
    }
    NaiveDate::parse_from_str(s, DATE_FORMAT).map_err(|_| invalid())
}

/// Accepts `123` or `act_123`; anything else is rejected before it reaches a
/// request path or a warehouse table name.
pub fn validate_account_id(account_id: &str) -> Result<&str, Error> {
    let digits = account_id.strip_prefix("act_").unwrap_or(account_id);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidAccountId {
            account_id: account_id.to_string(),
        });
    }
    Ok(account_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn param<'a>(params: &'a [(&'static str, String)], key: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_params_encode_json_lists() {
        let query = QuerySpec::new("ad", &["ad_id", "spend"]);
        let range = DateRange::new(date("2021-01-01"), date("2021-02-01")).unwrap();
        let params = query.to_params(&range);

        assert_eq!(param(&params, "level"), Some("ad"));
        assert_eq!(param(&params, "fields"), Some(r#"["ad_id","spend"]"#));
        assert_eq!(
            param(&params, "action_attribution_windows"),
            Some(r#"["1d_click","1d_view","7d_click","7d_view"]"#)
        );
        assert_eq!(param(&params, "time_increment"), Some("1"));
        assert_eq!(
            param(&params, "time_range"),
            Some(r#"{"since":"2021-01-01","until":"2021-02-01"}"#)
        );
        assert_eq!(param(&params, "breakdowns"), None);

        let filtering: Value = serde_json::from_str(param(&params, "filtering").unwrap()).unwrap();
        assert_eq!(filtering[0]["field"], "ad.impressions");
        assert_eq!(filtering[0]["operator"], "GREATER_THAN");
        assert_eq!(filtering[0]["value"], 0);
        assert_eq!(filtering[1]["value"].as_array().unwrap().len(), 12);
    }

    #[test]
    fn test_breakdowns_are_passed_through() {
        let query = QuerySpec::new("account", &["spend"])
            .with_breakdowns(Some("publisher_platform,platform_position".to_string()));
        let range = DateRange::new(date("2021-01-01"), date("2021-01-01")).unwrap();
        assert_eq!(
            param(&query.to_params(&range), "breakdowns"),
            Some("publisher_platform,platform_position")
        );

        let empty = QuerySpec::new("account", &["spend"]).with_breakdowns(Some(String::new()));
        assert_eq!(empty.breakdowns, None);
    }

    #[test]
    fn test_explicit_range_is_stable() {
        let first = DateRange::resolve(Some(date("2021-01-01")), Some(date("2021-02-01")), 8)
            .unwrap();
        let second = DateRange::resolve(Some(date("2021-01-01")), Some(date("2021-02-01")), 8)
            .unwrap();
        assert_eq!(first, second);

        let query = QuerySpec::new("ad", &["ad_id"]);
        assert_eq!(query.to_params(&first), query.to_params(&second));
    }

    #[test]
    fn test_default_range_is_trailing_window() {
        let today = date("2021-03-10");
        let range = DateRange::resolve_at(None, None, today, 8).unwrap();
        assert_eq!(range.until, today);
        assert_eq!(range.since, date("2021-03-02"));
    }

    #[test]
    fn test_default_start_follows_explicit_end() {
        let range =
            DateRange::resolve_at(None, Some(date("2021-01-31")), date("2021-06-01"), 7).unwrap();
        assert_eq!(range.since, date("2021-01-24"));
        assert_eq!(range.until, date("2021-01-31"));
    }

    #[test]
    fn test_start_after_end_is_rejected() {
        let result = DateRange::new(date("2021-02-02"), date("2021-02-01"));
        assert!(matches!(
            result.unwrap_err(),
            Error::StartDateAfterEndDate { .. }
        ));
    }

    #[test]
    fn test_empty_field_list_is_rejected() {
        let query = QuerySpec::new("ad", &[]);
        assert!(matches!(query.validate(), Err(Error::EmptyFieldList)));
    }

    #[test]
    fn test_parse_date_rejects_malformed_input() {
        for bad in ["2021-13-01", "2021-02-30", "2021/01/01", "2021-1-1", "yesterday", ""] {
            assert!(
                matches!(parse_date(bad), Err(Error::InvalidDate { date }) if date == bad),
                "{} should be rejected",
                bad
            );
        }
        assert_eq!(
            parse_date("2024-02-29").unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
    }

    #[test]
    fn test_account_id_must_be_numeric() {
        assert_eq!(validate_account_id("act_123").unwrap(), "act_123");
        assert_eq!(validate_account_id("123").unwrap(), "123");
        for bad in ["act_1/../../escaped", "../1", "act_", "", "act_12a", "1 2"] {
            assert!(
                matches!(
                    validate_account_id(bad),
                    Err(Error::InvalidAccountId { account_id }) if account_id == bad
                ),
                "{} should be rejected",
                bad
            );
        }
    }
}
