//! S3-compatible object storage backend.
//!
//! Small files go up in one streamed `PutObject`. Files at or above the
//! multipart threshold are sent as fixed-size parts. An unfinished multipart
//! upload left behind for the same key is picked up where it stopped, provided
//! every part it holds matches the file's bytes; otherwise it is aborted.

use super::{segments, RemoteEntry, Transport, TransportResult};
use crate::config::ObjectStorageTarget;
use crate::transfer::progress::format_bytes;
use crate::transfer::progress_stream::{ProgressCallback, ProgressStream};
use crate::utils::errors::{TransportError, TransportErrorKind};
use async_trait::async_trait;
use md5::{Digest, Md5};
use rusoto_core::request::HttpClient;
use rusoto_core::{ByteStream, Region, RusotoError};
use rusoto_credential::StaticProvider;
use rusoto_s3::{
    AbortMultipartUploadRequest, CompleteMultipartUploadRequest, CompletedMultipartUpload,
    CompletedPart, CreateMultipartUploadRequest, DeleteObjectRequest, HeadBucketRequest,
    HeadObjectRequest, ListMultipartUploadsRequest, ListObjectsV2Request, ListPartsRequest, Part,
    PutObjectRequest, S3Client, UploadPartRequest, S3,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

pub struct ObjectStorageTransport {
    client: S3Client,
    config: ObjectStorageTarget,
    timeout: Duration,
}

impl ObjectStorageTransport {
    /// Build the client and check the bucket is reachable with these credentials.
    pub async fn connect(config: ObjectStorageTarget) -> TransportResult<Self> {
        let transport = Self::new(config)?;
        transport
            .call(
                "head bucket",
                transport.client.head_bucket(HeadBucketRequest {
                    bucket: transport.config.bucket.clone(),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| match e.kind {
                TransportErrorKind::NotFound => TransportError::connection(format!(
                    "bucket {} does not exist",
                    transport.config.bucket
                )),
                _ => e,
            })?;

        info!(
            "Connected to bucket {} ({})",
            transport.config.bucket, transport.config.region
        );
        Ok(transport)
    }

    pub fn new(config: ObjectStorageTarget) -> TransportResult<Self> {
        let region = match &config.endpoint {
            Some(endpoint) => Region::Custom {
                name: config.region.clone(),
                endpoint: endpoint.clone(),
            },
            None => config.region.parse::<Region>().map_err(|e| {
                TransportError::connection(format!("invalid region {}: {}", config.region, e))
            })?,
        };
        let http = HttpClient::new()
            .map_err(|e| TransportError::connection(format!("http client setup failed: {}", e)))?;
        let credentials =
            StaticProvider::new_minimal(config.access_key.clone(), config.secret_key.clone());

        Ok(Self {
            client: S3Client::new_with(http, credentials, region),
            timeout: Duration::from_secs(config.timeout_secs),
            config,
        })
    }

    fn key(&self, path: &str) -> String {
        segments(&self.config.prefix)
            .chain(segments(path))
            .collect::<Vec<_>>()
            .join("/")
    }

    fn key_prefix(&self) -> String {
        let prefix = self.key("");
        if prefix.is_empty() {
            prefix
        } else {
            format!("{}/", prefix)
        }
    }

    /// Await a request under the per-call timeout and classify its error.
    async fn call<T, E, F>(&self, what: &str, request: F) -> TransportResult<T>
    where
        F: Future<Output = Result<T, RusotoError<E>>>,
        E: std::error::Error + 'static,
    {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(map_rusoto_error(e, what)),
            Err(_) => Err(TransportError::timeout(format!(
                "{}: no response within {}s",
                what,
                self.timeout.as_secs()
            ))),
        }
    }

    async fn put_single(&self, local_path: &Path, key: String, size: u64) -> TransportResult<u64> {
        let file = tokio::fs::File::open(local_path)
            .await
            .map_err(|e| TransportError::from_source_io(&e, local_path.display()))?;

        let label = key.clone();
        let callback: ProgressCallback = Arc::new(move |bytes| {
            debug!("{}: {} sent", label, format_bytes(bytes));
        });
        let body = ByteStream::new_with_size(
            ProgressStream::new(ReaderStream::new(file), callback),
            size as usize,
        );

        self.call(
            &key,
            self.client.put_object(PutObjectRequest {
                bucket: self.config.bucket.clone(),
                key: key.clone(),
                body: Some(body),
                content_length: Some(size as i64),
                storage_class: Some(self.config.storage_class.clone()),
                ..Default::default()
            }),
        )
        .await?;
        Ok(size)
    }

    /// Find the newest unfinished upload for `key` and the parts it holds.
    async fn resumable_upload(&self, key: &str) -> TransportResult<Option<(String, Vec<Part>)>> {
        let listing = self
            .call(
                key,
                self.client.list_multipart_uploads(ListMultipartUploadsRequest {
                    bucket: self.config.bucket.clone(),
                    prefix: Some(key.to_string()),
                    ..Default::default()
                }),
            )
            .await?;

        let mut uploads: Vec<_> = listing
            .uploads
            .unwrap_or_default()
            .into_iter()
            .filter(|u| u.key.as_deref() == Some(key))
            .collect();
        uploads.sort_by(|a, b| a.initiated.cmp(&b.initiated));

        let upload_id = match uploads.pop().and_then(|u| u.upload_id) {
            Some(id) => id,
            None => return Ok(None),
        };

        let listed = self
            .call(
                key,
                self.client.list_parts(ListPartsRequest {
                    bucket: self.config.bucket.clone(),
                    key: key.to_string(),
                    upload_id: upload_id.clone(),
                    ..Default::default()
                }),
            )
            .await?;

        Ok(Some((upload_id, listed.parts.unwrap_or_default())))
    }

    /// Check listed parts against the chunks of `local_path` they claim to
    /// hold. `None` if any part has the wrong length or content, in which
    /// case the upload belongs to other data and must not be completed.
    async fn reusable_parts(
        &self,
        local_path: &Path,
        size: u64,
        listed: &[Part],
    ) -> TransportResult<Option<BTreeMap<i64, CompletedPart>>> {
        let part_size = self.config.part_size.max(1);
        let mut file = open_source(local_path).await?;
        let mut parts = BTreeMap::new();

        for part in listed {
            let (number, e_tag) = match (part.part_number, part.e_tag.as_deref()) {
                (Some(number), Some(e_tag)) => (number, e_tag),
                _ => return Ok(None),
            };
            let length = match part_length(number, size, part_size) {
                Some(length) if part.size == Some(length as i64) => length,
                _ => return Ok(None),
            };
            let offset = (number as u64 - 1) * part_size;
            let chunk = read_chunk(&mut file, local_path, offset, length).await?;
            if !etag_matches(e_tag, &chunk) {
                return Ok(None);
            }
            parts.insert(
                number,
                CompletedPart {
                    e_tag: Some(e_tag.to_string()),
                    part_number: Some(number),
                },
            );
        }
        Ok(Some(parts))
    }

    async fn abort(&self, key: &str, upload_id: String) {
        let aborted = self
            .call(
                key,
                self.client.abort_multipart_upload(AbortMultipartUploadRequest {
                    bucket: self.config.bucket.clone(),
                    key: key.to_string(),
                    upload_id,
                    ..Default::default()
                }),
            )
            .await;
        if let Err(e) = aborted {
            warn!("Failed to abort multipart upload of {}: {}", key, e);
        }
    }

    async fn put_multipart(&self, local_path: &Path, key: String, size: u64) -> TransportResult<u64> {
        let resumed = match self.resumable_upload(&key).await? {
            Some((upload_id, listed)) => match self.reusable_parts(local_path, size, &listed).await? {
                Some(parts) => {
                    info!("Resuming multipart upload of {} ({} parts done)", key, parts.len());
                    Some((upload_id, parts))
                }
                None => {
                    warn!("Discarding multipart upload of {} left by different content", key);
                    self.abort(&key, upload_id).await;
                    None
                }
            },
            None => None,
        };

        let (upload_id, mut parts) = match resumed {
            Some(resumed) => resumed,
            None => {
                let created = self
                    .call(
                        &key,
                        self.client.create_multipart_upload(CreateMultipartUploadRequest {
                            bucket: self.config.bucket.clone(),
                            key: key.clone(),
                            storage_class: Some(self.config.storage_class.clone()),
                            ..Default::default()
                        }),
                    )
                    .await?;
                let upload_id = created.upload_id.ok_or_else(|| {
                    TransportError::connection(format!("{}: no upload id returned", key))
                })?;
                (upload_id, BTreeMap::new())
            }
        };

        match self
            .upload_parts(local_path, &key, &upload_id, size, &mut parts)
            .await
        {
            Ok(sent) => {
                self.call(
                    &key,
                    self.client
                        .complete_multipart_upload(CompleteMultipartUploadRequest {
                            bucket: self.config.bucket.clone(),
                            key: key.clone(),
                            upload_id,
                            multipart_upload: Some(CompletedMultipartUpload {
                                parts: Some(parts.into_values().collect()),
                            }),
                            ..Default::default()
                        }),
                )
                .await?;
                Ok(sent)
            }
            Err(e) => {
                self.abort(&key, upload_id).await;
                Err(e)
            }
        }
    }

    /// Send every part not already in `parts`; returns the bytes sent now.
    async fn upload_parts(
        &self,
        local_path: &Path,
        key: &str,
        upload_id: &str,
        size: u64,
        parts: &mut BTreeMap<i64, CompletedPart>,
    ) -> TransportResult<u64> {
        let part_size = self.config.part_size.max(1);
        let part_count = size.div_ceil(part_size).max(1) as i64;
        let mut file = open_source(local_path).await?;
        let mut sent = 0u64;

        for number in 1..=part_count {
            if parts.contains_key(&number) {
                continue;
            }
            let offset = (number as u64 - 1) * part_size;
            let length = part_size.min(size - offset);

            let buffer = read_chunk(&mut file, local_path, offset, length).await?;

            let output = self
                .call(
                    key,
                    self.client.upload_part(UploadPartRequest {
                        bucket: self.config.bucket.clone(),
                        key: key.to_string(),
                        upload_id: upload_id.to_string(),
                        part_number: number,
                        content_length: Some(length as i64),
                        body: Some(ByteStream::from(buffer)),
                        ..Default::default()
                    }),
                )
                .await?;

            let e_tag = output.e_tag.ok_or_else(|| {
                TransportError::connection(format!("{}: part {} returned no ETag", key, number))
            })?;
            parts.insert(
                number,
                CompletedPart {
                    e_tag: Some(e_tag),
                    part_number: Some(number),
                },
            );
            sent += length;
            debug!(
                "{}: part {}/{} sent ({})",
                key,
                number,
                part_count,
                format_bytes(sent)
            );
        }

        Ok(sent)
    }
}

#[async_trait]
impl Transport for ObjectStorageTransport {
    async fn list(&self, prefix: &str) -> TransportResult<Vec<RemoteEntry>> {
        let root = self.key_prefix();
        let scoped = self.key(prefix);
        let mut entries = Vec::new();
        let mut continuation_token = None;

        loop {
            let page = self
                .call(
                    "list objects",
                    self.client.list_objects_v2(ListObjectsV2Request {
                        bucket: self.config.bucket.clone(),
                        prefix: Some(scoped.clone()).filter(|p| !p.is_empty()),
                        continuation_token: continuation_token.take(),
                        ..Default::default()
                    }),
                )
                .await?;

            for object in page.contents.unwrap_or_default() {
                let key = match object.key {
                    Some(key) => key,
                    None => continue,
                };
                if key.ends_with('/') {
                    continue;
                }
                let path = key.strip_prefix(&root).unwrap_or(&key).to_string();
                entries.push(RemoteEntry {
                    path,
                    size: object.size.unwrap_or(0).max(0) as u64,
                });
            }

            match page.next_continuation_token {
                Some(token) if page.is_truncated.unwrap_or(false) => {
                    continuation_token = Some(token)
                }
                _ => break,
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn exists(&self, path: &str) -> TransportResult<bool> {
        let key = self.key(path);
        let result = self
            .call(
                &key,
                self.client.head_object(HeadObjectRequest {
                    bucket: self.config.bucket.clone(),
                    key: key.clone(),
                    ..Default::default()
                }),
            )
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.kind == TransportErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> TransportResult<u64> {
        let size = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| TransportError::from_source_io(&e, local_path.display()))?
            .len();
        let key = self.key(remote_path);

        if size >= self.config.multipart_threshold {
            self.put_multipart(local_path, key, size).await
        } else {
            self.put_single(local_path, key, size).await
        }
    }

    async fn delete(&self, remote_path: &str) -> TransportResult<()> {
        let key = self.key(remote_path);
        self.call(
            &key,
            self.client.delete_object(DeleteObjectRequest {
                bucket: self.config.bucket.clone(),
                key: key.clone(),
                ..Default::default()
            }),
        )
        .await?;
        Ok(())
    }
}

async fn open_source(local_path: &Path) -> TransportResult<tokio::fs::File> {
    tokio::fs::File::open(local_path)
        .await
        .map_err(|e| TransportError::from_source_io(&e, local_path.display()))
}

async fn read_chunk(
    file: &mut tokio::fs::File,
    local_path: &Path,
    offset: u64,
    length: u64,
) -> TransportResult<Vec<u8>> {
    let mut buffer = vec![0u8; length as usize];
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| TransportError::from_source_io(&e, local_path.display()))?;
    file.read_exact(&mut buffer)
        .await
        .map_err(|e| TransportError::from_source_io(&e, local_path.display()))?;
    Ok(buffer)
}

/// Length of part `number` (1-based) of a `size`-byte file, if it has one.
fn part_length(number: i64, size: u64, part_size: u64) -> Option<u64> {
    if number < 1 {
        return None;
    }
    let offset = (number as u64 - 1).checked_mul(part_size)?;
    if offset >= size {
        return None;
    }
    Some(part_size.min(size - offset))
}

/// A part's ETag is the quoted hex MD5 of its bytes.
fn etag_matches(e_tag: &str, chunk: &[u8]) -> bool {
    let hex = format!("{:x}", Md5::digest(chunk));
    e_tag.trim_matches('"').eq_ignore_ascii_case(&hex)
}

const CREDENTIAL_ERRORS: &[&str] = &[
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "ExpiredToken",
    "InvalidToken",
];

/// Translate a rusoto error into the shared taxonomy.
fn map_rusoto_error<E: std::error::Error + 'static>(err: RusotoError<E>, context: &str) -> TransportError {
    match err {
        RusotoError::Service(e) => {
            let detail = format!("{:?}", e);
            if detail.starts_with("NoSuch") {
                TransportError::not_found(format!("{}: {}", context, e))
            } else {
                TransportError::permission_denied(format!("{}: {}", context, e))
            }
        }
        RusotoError::HttpDispatch(e) => TransportError::connection(format!("{}: {}", context, e)),
        RusotoError::Credentials(e) => TransportError::auth(format!("{}: {}", context, e)),
        RusotoError::Validation(message) => {
            TransportError::permission_denied(format!("{}: {}", context, message))
        }
        RusotoError::Unknown(response) => {
            let body = String::from_utf8_lossy(&response.body).to_string();
            let status = response.status.as_u16();
            let message = format!("{}: HTTP {} {}", context, status, body.trim());
            match status {
                401 => TransportError::auth(message),
                403 if CREDENTIAL_ERRORS.iter().any(|code| body.contains(code)) => {
                    TransportError::auth(message)
                }
                403 => TransportError::permission_denied(message),
                404 => TransportError::not_found(message),
                408 | 500 | 502 | 503 | 504 => TransportError::timeout(message),
                _ => TransportError::permission_denied(message),
            }
        }
        other => TransportError::connection(format!("{}: {}", context, other)),
    }
}
