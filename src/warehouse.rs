use crate::config::Config;
use crate::data::{records_to_batches, Record};
use crate::error::Error;
use chrono::Utc;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::dataframe::DataFrameWriteOptions;
use datafusion::functions_window::expr_fn::row_number;
use datafusion::logical_expr::ExprFunctionExt;
use datafusion::prelude::{col, lit, ParquetReadOptions, SessionConfig, SessionContext};
use log::{debug, info};
use std::path::{Path, PathBuf};

const ROW_NUM: &str = "__row_num";
const PARQUET_EXTENSION: &str = "parquet";

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait WarehouseSink: Send + Sync + 'static {
    /// Appends records to a table, creating it when needed.
    ///
    /// # Arguments
    /// * `table` - Name of the target table.
    /// * `schema` - Column layout of the table.
    /// * `records` - Rows to write, already transformed and tagged.
    ///
    /// # Returns
    /// A Result containing either the number of rows written or an Error.
    async fn append(
        &self,
        table: &str,
        schema: SchemaRef,
        records: &[Record],
    ) -> Result<usize, Error>;

    /// Keeps only the most recent row per key, ordered by `recency_key`.
    async fn compact(
        &self,
        table: &str,
        partition_keys: &[String],
        recency_key: &str,
    ) -> Result<(), Error>;
}

/// Stores each table as a directory of Parquet files.
#[derive(Clone)]
pub struct ParquetWarehouse {
    root: PathBuf,
}

impl ParquetWarehouse {
    pub fn new(config: &Config) -> Self {
        ParquetWarehouse {
            root: PathBuf::from(&config.warehouse_dir),
        }
    }

    fn table_dir(&self, table: &str) -> PathBuf {
        self.root.join(table)
    }

    /// Strings must come back as `Utf8` so compacted and appended files share a schema.
    fn session() -> SessionContext {
        let mut config = SessionConfig::new();
        config.options_mut().execution.parquet.schema_force_view_types = false;
        SessionContext::new_with_config(config)
    }
}

async fn data_files(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut files = vec![];
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == PARQUET_EXTENSION) {
            files.push(path);
        }
    }
    Ok(files)
}

fn part_file_name(prefix: &str) -> String {
    format!(
        "{}-{}.{}",
        prefix,
        Utc::now().format("%Y%m%dT%H%M%S%9f"),
        PARQUET_EXTENSION
    )
}

#[async_trait::async_trait]
impl WarehouseSink for ParquetWarehouse {
    async fn append(
        &self,
        table: &str,
        schema: SchemaRef,
        records: &[Record],
    ) -> Result<usize, Error> {
        if records.is_empty() {
            return Ok(0);
        }

        let batches = records_to_batches(records, schema)?;
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();

        let dir = self.table_dir(table);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(part_file_name("part"));

        let ctx = Self::session();
        ctx.read_batches(batches)?
            .write_parquet(
                &path.to_string_lossy(),
                DataFrameWriteOptions::new().with_single_file_output(true),
                None,
            )
            .await?;

        info!("appended {} rows to {} ({})", rows, table, path.display());
        Ok(rows)
    }

    async fn compact(
        &self,
        table: &str,
        partition_keys: &[String],
        recency_key: &str,
    ) -> Result<(), Error> {
        let dir = self.table_dir(table);
        let files = data_files(&dir).await?;
        if files.is_empty() {
            debug!("nothing to compact in {}", table);
            return Ok(());
        }

        let ctx = Self::session();
        let df = ctx
            .read_parquet(
                format!("{}/", dir.display()),
                ParquetReadOptions::default(),
            )
            .await?;

        let latest_first = row_number()
            .partition_by(partition_keys.iter().map(|key| col(key.as_str())).collect())
            .order_by(vec![col(recency_key).sort(false, false)])
            .build()?;

        let batches = df
            .window(vec![latest_first.alias(ROW_NUM)])?
            .filter(col(ROW_NUM).eq(lit(1u64)))?
            .drop_columns(&[ROW_NUM])?
            .collect()
            .await?;
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        if rows == 0 {
            return Ok(());
        }

        // Staged outside the table directory so a failed write leaves it untouched.
        let staged = self.root.join(format!(".{}.{}", table, part_file_name("compacted")));
        ctx.read_batches(batches)?
            .write_parquet(
                &staged.to_string_lossy(),
                DataFrameWriteOptions::new().with_single_file_output(true),
                None,
            )
            .await?;

        // Old parts go only once the compacted file is in place.
        tokio::fs::rename(&staged, dir.join(part_file_name("compacted"))).await?;
        for file in &files {
            tokio::fs::remove_file(file).await?;
        }

        info!(
            "compacted {} from {} file(s) to {} rows keyed on [{}]",
            table,
            files.len(),
            rows,
            partition_keys.join(", ")
        );
        Ok(())
    }
}
