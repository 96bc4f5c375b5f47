//! Date-partitioned Parquet commits.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::builder::{ListBuilder, StringBuilder, StructBuilder};
use arrow_array::{ArrayRef, Int64Array, RecordBatch, StringArray, TimestampMillisecondArray};
use arrow_schema::{DataType, Field, Fields, Schema, SchemaRef, TimeUnit};
use chrono::{Datelike, NaiveDate};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use subdigest_core::{PostAnalysis, PostRecord};
use subdigest_storage::{BackoffPolicy, ObjectStore};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Bumped only when columns are appended. Version 2 added the analysis columns.
pub const SCHEMA_VERSION: u32 = 2;

fn utc_millis() -> DataType {
    DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into()))
}

fn concept_fields() -> Fields {
    Fields::from(vec![
        Field::new("name", DataType::Utf8, false),
        Field::new("definition", DataType::Utf8, false),
        Field::new("use_case", DataType::Utf8, false),
        Field::new("how_it_functions", DataType::Utf8, false),
    ])
}

fn list_of(item: DataType) -> DataType {
    DataType::List(Arc::new(Field::new_list_field(item, true)))
}

/// Column order is part of the contract; new columns go at the end.
pub fn record_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("identifier", DataType::Utf8, false),
        Field::new("subreddit", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, false),
        Field::new("body", DataType::Utf8, false),
        Field::new("author", DataType::Utf8, false),
        Field::new("url", DataType::Utf8, false),
        Field::new("score", DataType::Int64, false),
        Field::new("created_timestamp", utc_millis(), false),
        Field::new("comment_count", DataType::Int64, false),
        Field::new("comments", list_of(DataType::Utf8), false),
        Field::new("summary", DataType::Utf8, true),
        Field::new("model_id", DataType::Utf8, false),
        Field::new("ingestion_timestamp", utc_millis(), false),
        Field::new("problem_summary", DataType::Utf8, true),
        Field::new("problem_explanation", DataType::Utf8, true),
        Field::new(
            "primary_concepts",
            list_of(DataType::Struct(concept_fields())),
            true,
        ),
        Field::new("solution_summary", DataType::Utf8, true),
        Field::new("solution_explanation", DataType::Utf8, true),
        Field::new("suggested_categories", list_of(DataType::Utf8), true),
    ]))
}

pub fn partition_key(prefix: &str, date: NaiveDate, run_id: Uuid) -> String {
    format!(
        "{}/year={:04}/month={:02}/day={:02}/{run_id}.parquet",
        prefix.trim_matches('/'),
        date.year(),
        date.month(),
        date.day()
    )
}

fn strings<'a>(records: &'a [PostRecord], field: impl Fn(&'a PostRecord) -> &'a str) -> ArrayRef {
    Arc::new(StringArray::from(records.iter().map(field).collect::<Vec<_>>()))
}

/// Null for records without an analysis.
fn analysis_strings<'a>(
    records: &'a [PostRecord],
    field: impl Fn(&'a PostAnalysis) -> &'a str,
) -> ArrayRef {
    Arc::new(StringArray::from(
        records
            .iter()
            .map(|r| r.analysis.as_ref().map(&field))
            .collect::<Vec<_>>(),
    ))
}

fn concepts_column(records: &[PostRecord]) -> Result<ArrayRef> {
    let mut concepts = ListBuilder::new(StructBuilder::from_fields(concept_fields(), 0));
    for record in records {
        let Some(analysis) = &record.analysis else {
            concepts.append(false);
            continue;
        };
        for concept in &analysis.primary_concepts {
            let entry = concepts.values();
            let values = [
                &concept.name,
                &concept.definition,
                &concept.use_case,
                &concept.how_it_functions,
            ];
            for (idx, value) in values.into_iter().enumerate() {
                entry
                    .field_builder::<StringBuilder>(idx)
                    .context("concept field builder")?
                    .append_value(value);
            }
            entry.append(true);
        }
        concepts.append(true);
    }
    Ok(Arc::new(concepts.finish()))
}

fn to_batch(records: &[PostRecord]) -> Result<RecordBatch> {
    let mut comments = ListBuilder::new(StringBuilder::new());
    let mut categories = ListBuilder::new(StringBuilder::new());
    for record in records {
        for comment in &record.comments {
            comments.values().append_value(comment);
        }
        comments.append(true);

        match &record.analysis {
            Some(analysis) => {
                for category in &analysis.suggested_categories {
                    categories.values().append_value(category);
                }
                categories.append(true);
            }
            None => categories.append(false),
        }
    }

    let columns: Vec<ArrayRef> = vec![
        strings(records, |r| r.id.as_str()),
        strings(records, |r| r.subreddit.as_str()),
        strings(records, |r| r.title.as_str()),
        strings(records, |r| r.body.as_str()),
        strings(records, |r| r.author.as_str()),
        strings(records, |r| r.url.as_str()),
        Arc::new(Int64Array::from(
            records.iter().map(|r| r.score).collect::<Vec<_>>(),
        )),
        Arc::new(
            TimestampMillisecondArray::from(
                records
                    .iter()
                    .map(|r| r.created_at.timestamp_millis())
                    .collect::<Vec<_>>(),
            )
            .with_timezone("UTC"),
        ),
        Arc::new(Int64Array::from(
            records
                .iter()
                .map(|r| i64::from(r.comment_count))
                .collect::<Vec<_>>(),
        )),
        Arc::new(comments.finish()),
        Arc::new(StringArray::from(
            records
                .iter()
                .map(|r| r.summary.as_deref())
                .collect::<Vec<_>>(),
        )),
        strings(records, |r| r.model_id.as_str()),
        Arc::new(
            TimestampMillisecondArray::from(
                records
                    .iter()
                    .map(|r| r.ingested_at.timestamp_millis())
                    .collect::<Vec<_>>(),
            )
            .with_timezone("UTC"),
        ),
        analysis_strings(records, |a| a.problem_summary.as_str()),
        analysis_strings(records, |a| a.problem_explanation.as_str()),
        concepts_column(records)?,
        analysis_strings(records, |a| a.solution_summary.as_str()),
        analysis_strings(records, |a| a.solution_explanation.as_str()),
        Arc::new(categories.finish()),
    ];

    RecordBatch::try_new(record_schema(), columns).context("assembling record batch")
}

/// Serializes one partition into a complete, Snappy-compressed Parquet file.
pub fn encode_partition(records: &[PostRecord]) -> Result<Vec<u8>> {
    let batch = to_batch(records)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))
        .context("opening parquet writer")?;
    writer.write(&batch).context("writing record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(buffer)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedPartition {
    pub key: String,
    pub date: NaiveDate,
    pub rows: usize,
    pub bytes: usize,
    pub sha256: String,
}

#[derive(Debug, Error)]
#[error("committing partition {key} failed after {attempts} attempts: {reason}")]
pub struct WriteError {
    pub key: String,
    pub attempts: usize,
    pub reason: String,
}

/// Groups staged records by the UTC date of their ingestion timestamp and
/// commits one object per date.
pub struct RecordWriter {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    backoff: BackoffPolicy,
}

impl RecordWriter {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Stops at the first partition that cannot be committed. Partitions
    /// committed before it stay in place; callers treat the run as failed.
    pub async fn commit(
        &self,
        run_id: Uuid,
        records: &[PostRecord],
    ) -> Result<Vec<CommittedPartition>, WriteError> {
        let mut by_date: BTreeMap<NaiveDate, Vec<PostRecord>> = BTreeMap::new();
        for record in records {
            by_date
                .entry(record.ingested_at.date_naive())
                .or_default()
                .push(record.clone());
        }

        let mut committed = Vec::with_capacity(by_date.len());
        for (date, rows) in by_date {
            let key = partition_key(&self.prefix, date, run_id);
            committed.push(self.commit_partition(key, date, &rows).await?);
        }
        Ok(committed)
    }

    async fn commit_partition(
        &self,
        key: String,
        date: NaiveDate,
        rows: &[PostRecord],
    ) -> Result<CommittedPartition, WriteError> {
        let attempts = self.backoff.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt - 1)).await;
            }
            let outcome = match encode_partition(rows) {
                Ok(bytes) => self.store.put(&key, &bytes).await.map_err(anyhow::Error::from),
                Err(err) => Err(err),
            };
            match outcome {
                Ok(stored) => {
                    info!(
                        key = %stored.key,
                        rows = rows.len(),
                        bytes = stored.byte_size,
                        sha256 = %stored.sha256,
                        "partition committed"
                    );
                    return Ok(CommittedPartition {
                        key: stored.key,
                        date,
                        rows: rows.len(),
                        bytes: stored.byte_size,
                        sha256: stored.sha256,
                    });
                }
                Err(err) => {
                    warn!(key = %key, attempt = attempt + 1, error = %format!("{err:#}"), "partition commit failed");
                    last_error = format!("{err:#}");
                }
            }
        }

        Err(WriteError {
            key,
            attempts,
            reason: last_error,
        })
    }
}
