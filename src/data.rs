use crate::error::Error;
use chrono::{DateTime, SecondsFormat, Utc};
use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::datatypes::{DataType, Field, Fields, Schema, SchemaRef, TimeUnit};
use datafusion::arrow::json::ReaderBuilder;
use serde_json::Value;
use std::sync::Arc;

/// One row of a report, keyed by field name.
pub type Record = serde_json::Map<String, Value>;

/// Column stamped on every loaded row; the most recent one wins on compaction.
pub const BATCHED_AT: &str = "_batched_at";

/// Attribution-window keys of an action entry and the column each becomes.
pub const ACTION_WINDOWS: [(&str, &str); 4] = [
    ("1d_click", "_1d_click"),
    ("1d_view", "_1d_view"),
    ("7d_click", "_7d_click"),
    ("7d_view", "_7d_view"),
];

const DATE_COLUMNS: [&str; 2] = ["date_start", "date_stop"];
const BATCH_SIZE: usize = 1024;

/// Identifier, name or breakdown column. Report dates become `Date32`,
/// everything else stays a string (ids overflow `i64` in places).
pub fn dimension_field(name: &str) -> Field {
    if DATE_COLUMNS.contains(&name) {
        Field::new(name, DataType::Date32, true)
    } else {
        Field::new(name, DataType::Utf8, true)
    }
}

pub fn metric_field(name: &str) -> Field {
    Field::new(name, DataType::Float64, true)
}

/// Fields of a reshaped action entry.
pub fn action_fields() -> Fields {
    let mut fields = vec![
        Field::new("action_type", DataType::Utf8, true),
        Field::new("value", DataType::Float64, true),
    ];
    fields.extend(
        ACTION_WINDOWS
            .iter()
            .map(|(_, column)| Field::new(*column, DataType::Float64, true)),
    );
    Fields::from(fields)
}

pub fn action_field(name: &str) -> Field {
    Field::new(
        name,
        DataType::List(Arc::new(Field::new(
            "item",
            DataType::Struct(action_fields()),
            true,
        ))),
        true,
    )
}

pub fn batched_at_field() -> Field {
    Field::new(
        BATCHED_AT,
        DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
        false,
    )
}

/// Builds a schema from the given columns plus the trailing `_batched_at`.
pub fn schema_with_batched_at(mut fields: Vec<Field>) -> SchemaRef {
    fields.push(batched_at_field());
    Arc::new(Schema::new(fields))
}

/// Stamps every record with the same batch timestamp.
pub fn tag_batched_at(records: Vec<Record>, batched_at: DateTime<Utc>) -> Vec<Record> {
    let stamp = Value::String(batched_at.to_rfc3339_opts(SecondsFormat::Millis, true));
    records
        .into_iter()
        .map(|mut record| {
            record.insert(BATCHED_AT.to_string(), stamp.clone());
            record
        })
        .collect()
}

/// Converts records to arrow batches of `schema`. Keys outside the schema are ignored.
///
/// # Arguments
/// * `records` - Transformed and tagged records
/// * `schema` - Target table schema
///
/// # Returns
/// A Result containing either the decoded [`RecordBatch`]es or an [`Error`]
pub fn records_to_batches(records: &[Record], schema: SchemaRef) -> Result<Vec<RecordBatch>, Error> {
    let mut decoder = ReaderBuilder::new(schema)
        .with_batch_size(BATCH_SIZE)
        .build_decoder()?;

    let mut batches = Vec::with_capacity(records.len().div_ceil(BATCH_SIZE));
    for chunk in records.chunks(BATCH_SIZE) {
        decoder.serialize(chunk)?;
        if let Some(batch) = decoder.flush()? {
            batches.push(batch);
        }
    }

    Ok(batches)
}
