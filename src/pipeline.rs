//! Report shapes the loader knows how to pull and store.
//!
//! A [`Pipeline`] is plain data: the reporting level and breakdowns sent to the
//! API, the columns kept in the warehouse, and the business key rows are
//! deduplicated on. [`Pipeline::transform`] reshapes raw report rows into that
//! column layout.

use crate::data::{
    action_field, dimension_field, metric_field, schema_with_batched_at, Record, ACTION_WINDOWS,
    BATCHED_AT,
};
use crate::error::Error;
use crate::query::QuerySpec;
use datafusion::arrow::datatypes::SchemaRef;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

const METRICS: [&str; 7] = ["reach", "impressions", "cpc", "cpm", "ctr", "clicks", "spend"];

const ACTIONS: [&str; 4] = [
    "actions",
    "action_values",
    "cost_per_action_type",
    "cost_per_unique_action_type",
];

const ACCOUNT_DAY: [&str; 3] = ["date_start", "date_stop", "account_id"];

#[derive(Clone, Debug, PartialEq)]
pub struct Pipeline {
    pub name: &'static str,
    pub level: &'static str,
    /// Columns every row must carry, breakdown columns included.
    pub dimensions: &'static [&'static str],
    /// Optional numeric columns.
    pub metrics: &'static [&'static str],
    /// Per-action-type breakdown arrays.
    pub actions: &'static [&'static str],
    pub breakdowns: &'static [&'static str],
    pub dedup_keys: &'static [&'static str],
}

pub const ADS_INSIGHTS: Pipeline = Pipeline {
    name: "AdsInsights",
    level: "ad",
    dimensions: &[
        "date_start",
        "date_stop",
        "account_id",
        "campaign_id",
        "adset_id",
        "ad_id",
        "campaign_name",
        "adset_name",
        "ad_name",
    ],
    metrics: &METRICS,
    actions: &ACTIONS,
    breakdowns: &[],
    dedup_keys: &[
        "date_start",
        "date_stop",
        "account_id",
        "campaign_id",
        "adset_id",
        "ad_id",
    ],
};

pub const AGE_GENDER_INSIGHTS: Pipeline = Pipeline {
    name: "AgeGenderInsights",
    level: "account",
    dimensions: &["date_start", "date_stop", "account_id", "age", "gender"],
    metrics: &METRICS,
    actions: &ACTIONS,
    breakdowns: &["age", "gender"],
    dedup_keys: &["date_start", "date_stop", "account_id", "age", "gender"],
};

pub const DEVICE_INSIGHTS: Pipeline = Pipeline {
    name: "DeviceInsights",
    level: "account",
    dimensions: &["date_start", "date_stop", "account_id", "device_platform"],
    metrics: &METRICS,
    actions: &ACTIONS,
    breakdowns: &["device_platform"],
    dedup_keys: &["date_start", "date_stop", "account_id", "device_platform"],
};

pub const PLATFORM_POSITION_INSIGHTS: Pipeline = Pipeline {
    name: "PlatformPositionInsights",
    level: "account",
    dimensions: &[
        "date_start",
        "date_stop",
        "account_id",
        "publisher_platform",
        "platform_position",
    ],
    metrics: &METRICS,
    actions: &ACTIONS,
    breakdowns: &["publisher_platform", "platform_position"],
    dedup_keys: &[
        "date_start",
        "date_stop",
        "account_id",
        "publisher_platform",
        "platform_position",
    ],
};

pub const REGION_INSIGHTS: Pipeline = Pipeline {
    name: "RegionInsights",
    level: "account",
    dimensions: &["date_start", "date_stop", "account_id", "region"],
    metrics: &METRICS,
    actions: &["actions", "action_values", "cost_per_action_type"],
    breakdowns: &["region"],
    dedup_keys: &["date_start", "date_stop", "account_id", "region"],
};

impl Pipeline {
    /// Fields requested from the API. Breakdown columns are added to each row
    /// by the API itself and must not be requested as fields.
    pub fn fields(&self) -> Vec<&'static str> {
        self.dimensions
            .iter()
            .filter(|d| !self.breakdowns.contains(*d))
            .chain(self.metrics)
            .chain(self.actions)
            .copied()
            .collect()
    }

    pub fn query_spec(&self) -> QuerySpec {
        let breakdowns = (!self.breakdowns.is_empty()).then(|| self.breakdowns.join(","));
        QuerySpec::new(self.level, &self.fields()).with_breakdowns(breakdowns)
    }

    pub fn schema(&self) -> SchemaRef {
        let fields = self
            .dimensions
            .iter()
            .map(|name| dimension_field(name))
            .chain(self.metrics.iter().map(|name| metric_field(name)))
            .chain(self.actions.iter().map(|name| action_field(name)))
            .collect();
        schema_with_batched_at(fields)
    }

    pub fn dedup_keys(&self) -> Vec<String> {
        self.dedup_keys.iter().map(|k| k.to_string()).collect()
    }

    /// Warehouse table holding one account's rows of this pipeline.
    pub fn table_name(&self, account_id: &str) -> String {
        format!(
            "{}_{}",
            self.name,
            account_id.strip_prefix("act_").unwrap_or(account_id)
        )
    }

    pub fn recency_key(&self) -> &'static str {
        BATCHED_AT
    }

    /// Reshapes raw report rows into this pipeline's column layout.
    pub fn transform(&self, rows: Vec<Record>) -> Result<Vec<Record>, Error> {
        rows.into_iter().map(|row| self.transform_row(row)).collect()
    }

    fn transform_row(&self, mut row: Record) -> Result<Record, Error> {
        let mut out = Map::new();

        for &field in self.dimensions {
            let value = row.remove(field).ok_or_else(|| Error::MissingField {
                pipeline: self.name.to_string(),
                field: field.to_string(),
            })?;
            out.insert(field.to_string(), value);
        }

        for &field in self.metrics {
            let value = to_number(field, row.get(field))?;
            out.insert(field.to_string(), value);
        }

        for &field in self.actions {
            let entries = match row.get(field) {
                Some(Value::Array(entries)) => entries
                    .iter()
                    .map(|entry| reshape_action(field, entry))
                    .collect::<Result<Vec<_>, _>>()?,
                _ => vec![],
            };
            out.insert(field.to_string(), Value::Array(entries));
        }

        Ok(out)
    }
}

/// Rewrites `{action_type, value, 1d_click, ...}` into the stored layout with
/// every window present and numeric.
fn reshape_action(field: &str, entry: &Value) -> Result<Value, Error> {
    let mut out = Map::new();
    out.insert(
        "action_type".to_string(),
        entry.get("action_type").cloned().unwrap_or(Value::Null),
    );
    out.insert(
        "value".to_string(),
        to_number(&format!("{}.value", field), entry.get("value"))?,
    );
    for (window, column) in ACTION_WINDOWS {
        out.insert(
            column.to_string(),
            to_number(&format!("{}.{}", field, window), entry.get(window))?,
        );
    }
    Ok(Value::Object(out))
}

/// The API reports metrics as decimal strings.
fn to_number(field: &str, value: Option<&Value>) -> Result<Value, Error> {
    match value {
        None | Some(Value::Null) => Ok(Value::Null),
        Some(Value::Number(n)) => Ok(Value::Number(n.clone())),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| Error::InvalidMetric {
                field: field.to_string(),
                value: s.clone(),
            }),
        Some(other) => Err(Error::InvalidMetric {
            field: field.to_string(),
            value: other.to_string(),
        }),
    }
}

/// Pipelines by name.
#[derive(Clone, Debug)]
pub struct PipelineRegistry {
    pipelines: BTreeMap<&'static str, Pipeline>,
}

impl Default for PipelineRegistry {
    fn default() -> Self {
        Self::new([
            ADS_INSIGHTS,
            AGE_GENDER_INSIGHTS,
            DEVICE_INSIGHTS,
            PLATFORM_POSITION_INSIGHTS,
            REGION_INSIGHTS,
        ])
    }
}

impl PipelineRegistry {
    pub fn new(pipelines: impl IntoIterator<Item = Pipeline>) -> Self {
        PipelineRegistry {
            pipelines: pipelines.into_iter().map(|p| (p.name, p)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Result<&Pipeline, Error> {
        self.pipelines.get(name).ok_or_else(|| Error::UnknownPipeline {
            name: name.to_string(),
        })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.pipelines.keys().copied().collect()
    }
}
