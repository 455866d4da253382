//! Indexed Parquet writer over S3: computes the next file index for a `(table, hour)` pair by
//! listing the hour's prefix, and streams rows into a Parquet file through a hand-rolled
//! multipart-upload adapter so rows never have to be buffered entirely in memory.

use crate::error::WriterError;
use crate::model::{ArchiveRow, RuleHitRow};
use arrow::array::{
    ArrayRef, RecordBatch, StringBuilder, StringDictionaryBuilder, TimestampMillisecondBuilder,
};
use arrow::datatypes::{DataType, Field, Int32Type, Schema, SchemaRef, TimeUnit};
use async_trait::async_trait;
use aws_sdk_s3::operation::create_multipart_upload::CreateMultipartUploadOutput;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::future::BoxFuture;
use parquet::arrow::async_writer::{AsyncArrowWriter, AsyncFileWriter};
use parquet::basic::Compression;
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use std::collections::HashMap;
use std::sync::Arc;

/// S3 requires every part but the last to be at least 5 MiB; write in somewhat larger chunks so
/// a handful of `add_row` bursts don't each trigger a network round trip.
const MULTIPART_PART_SIZE_BYTES: usize = 8 * 1024 * 1024;
const ROW_GROUP_SIZE_BYTES: usize = 128 * 1024 * 1024;
/// Rows are buffered into Arrow arrays and flushed to the Arrow writer in batches of this size,
/// rather than one `RecordBatch` per row.
const ROWS_PER_BATCH: usize = 2048;

pub fn archives_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(
            "cluster_id",
            DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8)),
            false,
        ),
        Field::new(
            "collected_at",
            DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
            false,
        ),
        Field::new("archive_path", DataType::Utf8, false),
    ]))
}

pub fn rule_hits_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(
            "cluster_id",
            DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8)),
            false,
        ),
        Field::new(
            "rule_id",
            DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8)),
            false,
        ),
        Field::new(
            "collected_at",
            DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
            false,
        ),
        Field::new("archive_path", DataType::Utf8, false),
    ]))
}

/// A row destined for one of the two tables. `ObjectStoreWriter::new_file` pins a handle to a
/// single table/schema; passing the wrong variant to that handle's `add_row` is a caller bug.
pub enum TableRow {
    Archive(ArchiveRow),
    RuleHit(RuleHitRow),
}

#[async_trait]
pub trait ObjectStoreWriter: Send + Sync {
    fn prefix(&self) -> &str;

    /// Lists up to 1000 keys under `hour_prefix` and returns the highest `<table>-<index>` seen
    /// per table name. A listing failure yields an empty map rather than an error: the caller
    /// falls back to starting every table at index 0, matching the documented indexing policy.
    async fn last_index_for_table(&self, hour_prefix: &str) -> HashMap<String, u64>;

    async fn new_file(
        &self,
        path: String,
        schema: SchemaRef,
    ) -> Result<Box<dyn FileHandle>, WriterError>;

    /// Batch delete. Empty input is a no-op.
    async fn delete_files(&self, paths: &[String]) -> Result<(), WriterError>;
}

#[async_trait]
pub trait FileHandle: Send {
    async fn add_row(&mut self, row: TableRow) -> Result<(), WriterError>;
    async fn close(self: Box<Self>) -> Result<(), WriterError>;
}

pub struct S3ObjectStoreWriter {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3ObjectStoreWriter {
    pub fn new(client: Client, bucket: String, prefix: String) -> Self {
        Self {
            client,
            bucket,
            prefix,
        }
    }
}

#[async_trait]
impl ObjectStoreWriter for S3ObjectStoreWriter {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn last_index_for_table(&self, hour_prefix: &str) -> HashMap<String, u64> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(hour_prefix)
            .max_keys(1000)
            .send()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(hour_prefix, error = %err, "failed to list hour prefix; starting every table at index 0");
                return HashMap::new();
            }
        };

        let mut max_index: HashMap<String, u64> = HashMap::new();
        for object in output.contents() {
            let Some(key) = object.key() else { continue };
            let Some(file_name) = key.rsplit('/').next() else {
                continue;
            };
            if let Some((table, index)) = parse_indexed_file_name(file_name) {
                max_index
                    .entry(table)
                    .and_modify(|existing| *existing = (*existing).max(index))
                    .or_insert(index);
            }
        }
        max_index
    }

    async fn new_file(
        &self,
        path: String,
        schema: SchemaRef,
    ) -> Result<Box<dyn FileHandle>, WriterError> {
        let multipart = S3MultipartWriter::new(self.client.clone(), self.bucket.clone(), path.clone());
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_max_row_group_size(ROW_GROUP_SIZE_BYTES)
            .build();
        let arrow_writer = AsyncArrowWriter::try_new(multipart, schema.clone(), Some(props))
            .map_err(|err| WriterError::Open {
                path: path.clone(),
                message: err.to_string(),
            })?;

        Ok(Box::new(ParquetFileHandle {
            path,
            schema,
            arrow_writer,
            cluster_id: StringDictionaryBuilder::<Int32Type>::new(),
            rule_id: StringDictionaryBuilder::<Int32Type>::new(),
            collected_at: TimestampMillisecondBuilder::new().with_timezone("UTC"),
            archive_path: StringBuilder::new(),
            buffered_rows: 0,
        }))
    }

    async fn delete_files(&self, paths: &[String]) -> Result<(), WriterError> {
        if paths.is_empty() {
            return Ok(());
        }
        let objects: Result<Vec<_>, _> = paths
            .iter()
            .map(|path| ObjectIdentifier::builder().key(path).build())
            .collect();
        let objects = objects.map_err(|err| WriterError::Delete {
            message: err.to_string(),
        })?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .build()
            .map_err(|err| WriterError::Delete {
                message: err.to_string(),
            })?;

        self.client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|err| WriterError::Delete {
                message: err.to_string(),
            })?;
        Ok(())
    }
}

fn parse_indexed_file_name(file_name: &str) -> Option<(String, u64)> {
    let stem = file_name.strip_suffix(".parquet")?;
    let (table, index) = stem.rsplit_once('-')?;
    let index: u64 = index.parse().ok()?;
    Some((table.to_string(), index))
}

/// Buffers rows into Arrow array builders and flushes a `RecordBatch` into the underlying
/// `AsyncArrowWriter` every [`ROWS_PER_BATCH`] rows (and once more on close).
struct ParquetFileHandle {
    path: String,
    schema: SchemaRef,
    arrow_writer: AsyncArrowWriter<S3MultipartWriter>,
    cluster_id: StringDictionaryBuilder<Int32Type>,
    rule_id: StringDictionaryBuilder<Int32Type>,
    collected_at: TimestampMillisecondBuilder,
    archive_path: StringBuilder,
    buffered_rows: usize,
}

impl ParquetFileHandle {
    async fn flush_batch(&mut self) -> Result<(), WriterError> {
        if self.buffered_rows == 0 {
            return Ok(());
        }

        let has_rule_id = self
            .schema
            .fields()
            .iter()
            .any(|field| field.name() == "rule_id");

        let mut columns: Vec<ArrayRef> = vec![Arc::new(self.cluster_id.finish())];
        if has_rule_id {
            columns.push(Arc::new(self.rule_id.finish()));
        }
        columns.push(Arc::new(self.collected_at.finish()));
        columns.push(Arc::new(self.archive_path.finish()));

        let batch =
            RecordBatch::try_new(self.schema.clone(), columns).map_err(|err| WriterError::RowEncode {
                path: self.path.clone(),
                message: err.to_string(),
            })?;

        self.arrow_writer
            .write(&batch)
            .await
            .map_err(|err| WriterError::RowEncode {
                path: self.path.clone(),
                message: err.to_string(),
            })?;

        self.buffered_rows = 0;
        Ok(())
    }
}

#[async_trait]
impl FileHandle for ParquetFileHandle {
    async fn add_row(&mut self, row: TableRow) -> Result<(), WriterError> {
        match row {
            TableRow::Archive(row) => {
                self.cluster_id
                    .append(&row.cluster_id)
                    .map_err(|err| WriterError::RowEncode {
                        path: self.path.clone(),
                        message: err.to_string(),
                    })?;
                self.collected_at.append_value(row.collected_at_ms);
                self.archive_path.append_value(&row.archive_path);
            }
            TableRow::RuleHit(row) => {
                self.cluster_id
                    .append(&row.cluster_id)
                    .map_err(|err| WriterError::RowEncode {
                        path: self.path.clone(),
                        message: err.to_string(),
                    })?;
                self.rule_id
                    .append(&row.rule_id)
                    .map_err(|err| WriterError::RowEncode {
                        path: self.path.clone(),
                        message: err.to_string(),
                    })?;
                self.collected_at.append_value(row.collected_at_ms);
                self.archive_path.append_value(&row.archive_path);
            }
        }

        self.buffered_rows += 1;
        if self.buffered_rows >= ROWS_PER_BATCH {
            self.flush_batch().await?;
        }
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<(), WriterError> {
        self.flush_batch().await?;
        self.arrow_writer
            .close()
            .await
            .map_err(|err| WriterError::Close {
                path: self.path.clone(),
                message: err.to_string(),
            })?;
        Ok(())
    }
}

/// Adapts S3 multipart upload calls to the [`AsyncFileWriter`] trait the Arrow Parquet writer
/// streams into. Buffers writes until a part reaches [`MULTIPART_PART_SIZE_BYTES`] (S3's minimum
/// part size, aside from the final part), falling back to a single `PutObject` for files small
/// enough that multipart upload is never started.
struct S3MultipartWriter {
    client: Client,
    bucket: String,
    key: String,
    upload_id: Option<String>,
    parts: Vec<CompletedPart>,
    buffer: Vec<u8>,
}

impl S3MultipartWriter {
    fn new(client: Client, bucket: String, key: String) -> Self {
        Self {
            client,
            bucket,
            key,
            upload_id: None,
            parts: Vec::new(),
            buffer: Vec::new(),
        }
    }

    async fn ensure_upload_started(&mut self) -> Result<&str, ParquetError> {
        if self.upload_id.is_none() {
            let CreateMultipartUploadOutput { upload_id, .. } = self
                .client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(&self.key)
                .send()
                .await
                .map_err(external)?;
            self.upload_id = upload_id;
        }
        self.upload_id.as_deref().ok_or_else(|| {
            ParquetError::External(Box::new(std::io::Error::other(
                "create_multipart_upload returned no upload id",
            )))
        })
    }

    async fn flush_part(&mut self, final_part: bool) -> Result<(), ParquetError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if !final_part && self.buffer.len() < MULTIPART_PART_SIZE_BYTES {
            return Ok(());
        }

        let upload_id = self.ensure_upload_started().await?.to_string();
        let part_number = self.parts.len() as i32 + 1;
        let body = std::mem::take(&mut self.buffer);

        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(external)?;

        self.parts.push(
            CompletedPart::builder()
                .part_number(part_number)
                .set_e_tag(output.e_tag().map(str::to_string))
                .build(),
        );
        Ok(())
    }
}

fn external<E: std::error::Error + Send + Sync + 'static>(err: E) -> ParquetError {
    ParquetError::External(Box::new(err))
}

impl AsyncFileWriter for S3MultipartWriter {
    fn write(&mut self, bs: Bytes) -> BoxFuture<'_, parquet::errors::Result<()>> {
        Box::pin(async move {
            self.buffer.extend_from_slice(&bs);
            self.flush_part(false).await
        })
    }

    fn complete(&mut self) -> BoxFuture<'_, parquet::errors::Result<()>> {
        Box::pin(async move {
            if self.upload_id.is_none() {
                // Never crossed the multipart threshold: a single PutObject is both simpler and
                // avoids S3's "completed multipart upload is too small" error for a lone part.
                let body = std::mem::take(&mut self.buffer);
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(&self.key)
                    .body(ByteStream::from(body))
                    .send()
                    .await
                    .map_err(external)?;
                return Ok(());
            }

            self.flush_part(true).await?;
            let upload_id = self.upload_id.clone().expect("checked above");
            let parts = std::mem::take(&mut self.parts);
            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(&self.key)
                .upload_id(upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts))
                        .build(),
                )
                .send()
                .await
                .map_err(external)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_indexed_file_names() {
        assert_eq!(
            parse_indexed_file_name("archives-0.parquet"),
            Some(("archives".to_string(), 0))
        );
        assert_eq!(
            parse_indexed_file_name("rule_hits-12.parquet"),
            Some(("rule_hits".to_string(), 12))
        );
    }

    #[test]
    fn rejects_malformed_file_names() {
        assert_eq!(parse_indexed_file_name("archives.parquet"), None);
        assert_eq!(parse_indexed_file_name("archives-abc.parquet"), None);
        assert_eq!(parse_indexed_file_name("archives-0.json"), None);
    }

    #[test]
    fn schemas_declare_the_documented_columns() {
        let archives = archives_schema();
        let names: Vec<&str> = archives.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, vec!["cluster_id", "collected_at", "archive_path"]);

        let rule_hits = rule_hits_schema();
        let names: Vec<&str> = rule_hits.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(
            names,
            vec!["cluster_id", "rule_id", "collected_at", "archive_path"]
        );
    }
}
