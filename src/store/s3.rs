//! S3 store: aws-sdk-s3 against AWS or any S3-compatible endpoint (MinIO, R2,
//! Ceph RGW). Small archives go up in one PutObject; larger ones use a
//! multipart upload with parts sent one at a time.

use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials as StaticCredentials, Region, RequestChecksumCalculation};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::{ByteStream, Length};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;

use super::{ObjectStore, UploadError};
use crate::config::{ConfigError, UploadDestination};

const MIB: u64 = 1024 * 1024;

/// Smallest multipart part size, also the single-PUT threshold
const MULTIPART_PART_BYTES: u64 = 8 * MIB;

/// S3 allows at most this many parts per upload
const MULTIPART_PARTS_COUNT_MAX: u64 = 10_000;

/// Largest object S3 accepts
const OBJECT_BYTES_MAX: u64 = 5 * 1024 * 1024 * MIB;

const CREDENTIALS_PROVIDER_NAME: &str = "volume-backup-static";

pub struct S3Store {
    client: Client,
    bucket: String,
    endpoint: String,
}

impl S3Store {
    /// Build a client for `destination`.
    ///
    /// Static credentials win when configured; otherwise the default provider
    /// chain (env, profile, IMDS) applies. Custom endpoints get path-style
    /// addressing.
    pub async fn connect(destination: &UploadDestination) -> Result<Self, ConfigError> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(destination.region.clone()));
        if let Some(creds) = &destination.credentials {
            loader = loader.credentials_provider(StaticCredentials::new(
                creds.access_key.clone(),
                creds.secret_key.clone(),
                None,
                None,
                CREDENTIALS_PROVIDER_NAME,
            ));
        }
        if let Some(endpoint) = &destination.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(destination.endpoint.is_some())
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .build();

        let store = Self::with_client(Client::from_conf(s3_config), destination);
        if destination.verify_bucket {
            store.verify_bucket().await?;
        }
        Ok(store)
    }

    fn with_client(client: Client, destination: &UploadDestination) -> Self {
        Self {
            client,
            bucket: destination.bucket.clone(),
            endpoint: destination
                .endpoint
                .clone()
                .unwrap_or_else(|| "aws".to_string()),
        }
    }

    /// HeadBucket probe; any failure is a startup misconfiguration.
    async fn verify_bucket(&self) -> Result<(), ConfigError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| ConfigError::Destination {
                bucket: self.bucket.clone(),
                reason: DisplayErrorContext(&e).to_string(),
            })?;
        tracing::info!(bucket = %self.bucket, "Destination bucket reachable");
        Ok(())
    }

    async fn put_single(&self, key: &str, path: &Path) -> Result<(), UploadError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| UploadError::Read {
                path: path.to_path_buf(),
                source: std::io::Error::other(e),
            })?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/gzip")
            .body(body)
            .send()
            .await
            .map_err(|e| request_error("PutObject", key, &e))?;
        Ok(())
    }

    async fn put_multipart(&self, key: &str, path: &Path, size: u64) -> Result<(), UploadError> {
        if size > OBJECT_BYTES_MAX {
            return Err(UploadError::Rejected {
                key: key.to_string(),
                reason: format!("{size} bytes is over the {OBJECT_BYTES_MAX} byte object limit"),
            });
        }
        let part_bytes = part_size(size);

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/gzip")
            .send()
            .await
            .map_err(|e| request_error("CreateMultipartUpload", key, &e))?;
        let upload_id = created.upload_id().ok_or_else(|| UploadError::Rejected {
            key: key.to_string(),
            reason: "CreateMultipartUpload returned no upload id".to_string(),
        })?;

        match self.upload_parts(key, path, size, part_bytes, upload_id).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| request_error("CompleteMultipartUpload", key, &e))?;
                Ok(())
            }
            Err(err) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(
                        key,
                        "Failed to abort multipart upload: {}",
                        DisplayErrorContext(&abort)
                    );
                }
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        path: &Path,
        size: u64,
        part_bytes: u64,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>, UploadError> {
        let mut parts = Vec::new();
        let mut offset = 0u64;
        let mut part_number = 1i32;

        while offset < size {
            let length = part_bytes.min(size - offset);
            let body = ByteStream::read_from()
                .path(path)
                .offset(offset)
                .length(Length::Exact(length))
                .build()
                .await
                .map_err(|e| UploadError::Read {
                    path: path.to_path_buf(),
                    source: std::io::Error::other(e),
                })?;

            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(body)
                .send()
                .await
                .map_err(|e| request_error("UploadPart", key, &e))?;

            tracing::trace!(key, part_number, length, "Uploaded part");
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .build(),
            );

            offset += length;
            part_number += 1;
        }
        Ok(parts)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_file(&self, key: &str, path: &Path) -> Result<(), UploadError> {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|source| UploadError::Read {
                path: path.to_path_buf(),
                source,
            })?
            .len();

        if size <= MULTIPART_PART_BYTES {
            self.put_single(key, path).await
        } else {
            self.put_multipart(key, path, size).await
        }
    }

    fn describe(&self) -> String {
        format!("s3://{} ({})", self.bucket, self.endpoint)
    }
}

/// Part size for an object of `size` bytes: the minimum, or larger in whole
/// MiB when the minimum would need too many parts.
fn part_size(size: u64) -> u64 {
    let needed = size.div_ceil(MULTIPART_PARTS_COUNT_MAX).div_ceil(MIB) * MIB;
    needed.max(MULTIPART_PART_BYTES)
}

fn request_error<E>(operation: &'static str, key: &str, err: &E) -> UploadError
where
    E: std::error::Error,
{
    UploadError::Request {
        operation,
        key: key.to_string(),
        reason: DisplayErrorContext(err).to_string(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::config::retry::RetryConfig;
    use aws_sdk_s3::config::{BehaviorVersion, StalledStreamProtectionConfig};
    use aws_smithy_http_client::test_util::{ReplayEvent, StaticReplayClient};
    use aws_smithy_types::body::SdkBody;
    use tempfile::tempdir;

    const ENDPOINT: &str = "http://localhost:9000";
    const KEY: &str = "nightly/app/app-20240309-140507.tar.gz";

    fn destination() -> UploadDestination {
        UploadDestination {
            bucket: "backups".to_string(),
            prefix: "nightly".to_string(),
            endpoint: Some(ENDPOINT.to_string()),
            region: "us-east-1".to_string(),
            credentials: None,
            verify_bucket: false,
        }
    }

    fn replay_store(events: Vec<ReplayEvent>) -> (S3Store, StaticReplayClient) {
        let http_client = StaticReplayClient::new(events);
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(StaticCredentials::new("AKID", "SECRET", None, None, "test"))
            .endpoint_url(ENDPOINT)
            .force_path_style(true)
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .retry_config(RetryConfig::disabled())
            .stalled_stream_protection(StalledStreamProtectionConfig::disabled())
            .http_client(http_client.clone())
            .build();
        let store = S3Store::with_client(Client::from_conf(config), &destination());
        (store, http_client)
    }

    fn event(status: u16, etag: Option<&str>, body: &str) -> ReplayEvent {
        let request = http::Request::builder()
            .uri(format!("{ENDPOINT}/backups/{KEY}"))
            .body(SdkBody::empty())
            .unwrap();
        let mut response = http::Response::builder().status(status);
        if let Some(etag) = etag {
            response = response.header("ETag", etag);
        }
        ReplayEvent::new(request, response.body(SdkBody::from(body.to_string())).unwrap())
    }

    fn created(upload_id: Option<&str>) -> ReplayEvent {
        let id = upload_id
            .map(|id| format!("<UploadId>{id}</UploadId>"))
            .unwrap_or_default();
        event(
            200,
            None,
            &format!(
                "<InitiateMultipartUploadResult>\
                 <Bucket>backups</Bucket><Key>{KEY}</Key>{id}\
                 </InitiateMultipartUploadResult>"
            ),
        )
    }

    fn completed() -> ReplayEvent {
        event(
            200,
            None,
            &format!(
                "<CompleteMultipartUploadResult>\
                 <Bucket>backups</Bucket><Key>{KEY}</Key><ETag>\"final\"</ETag>\
                 </CompleteMultipartUploadResult>"
            ),
        )
    }

    fn denied() -> ReplayEvent {
        event(
            403,
            None,
            "<Error><Code>AccessDenied</Code><Message>Access Denied</Message></Error>",
        )
    }

    fn archive_of_size(dir: &Path, size: u64) -> std::path::PathBuf {
        let path = dir.join("app-20240309-140507.tar.gz");
        std::fs::write(&path, vec![7u8; size as usize]).unwrap();
        path
    }

    #[test]
    fn test_part_size() {
        assert_eq!(part_size(MULTIPART_PART_BYTES + 1), MULTIPART_PART_BYTES);
        assert_eq!(part_size(10 * 1024 * MIB), MULTIPART_PART_BYTES);

        // 100 GiB would need 12,800 parts of 8 MiB.
        let size = 100 * 1024 * MIB;
        let part = part_size(size);
        assert_eq!(part % MIB, 0);
        assert!(part > MULTIPART_PART_BYTES);
        assert!(size.div_ceil(part) <= MULTIPART_PARTS_COUNT_MAX);

        let part = part_size(OBJECT_BYTES_MAX);
        assert!(OBJECT_BYTES_MAX.div_ceil(part) <= MULTIPART_PARTS_COUNT_MAX);
    }

    #[tokio::test]
    async fn test_threshold_size_uses_single_put() {
        let dir = tempdir().unwrap();
        let path = archive_of_size(dir.path(), MULTIPART_PART_BYTES);
        let (store, http) = replay_store(vec![event(200, Some("\"e\""), "")]);

        store.put_file(KEY, &path).await.unwrap();

        let requests: Vec<_> = http.actual_requests().collect();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method(), "PUT");
        assert!(requests[0].uri().contains(&format!("/backups/{KEY}")));
        assert!(!requests[0].uri().contains("partNumber"));
        assert_eq!(
            requests[0].headers().get("content-length"),
            Some(MULTIPART_PART_BYTES.to_string().as_str())
        );
    }

    #[tokio::test]
    async fn test_multipart_upload_splits_and_completes_in_order() {
        let dir = tempdir().unwrap();
        let path = archive_of_size(dir.path(), 2 * MULTIPART_PART_BYTES + 1);
        let (store, http) = replay_store(vec![
            created(Some("upload-1")),
            event(200, Some("\"etag-1\""), ""),
            event(200, Some("\"etag-2\""), ""),
            event(200, Some("\"etag-3\""), ""),
            completed(),
        ]);

        store.put_file(KEY, &path).await.unwrap();

        let requests: Vec<_> = http.actual_requests().collect();
        assert_eq!(requests.len(), 5);
        assert_eq!(requests[0].method(), "POST");
        assert!(requests[0].uri().contains("uploads"));

        let lengths: Vec<_> = requests[1..4]
            .iter()
            .map(|r| r.headers().get("content-length").map(str::to_string))
            .collect();
        let part = MULTIPART_PART_BYTES.to_string();
        assert_eq!(lengths, vec![Some(part.clone()), Some(part), Some("1".to_string())]);
        for (i, request) in requests[1..4].iter().enumerate() {
            assert_eq!(request.method(), "PUT");
            assert!(request.uri().contains(&format!("partNumber={}", i + 1)));
            assert!(request.uri().contains("uploadId=upload-1"));
        }

        let complete = requests[4];
        assert_eq!(complete.method(), "POST");
        assert!(complete.uri().contains("uploadId=upload-1"));
        let body = std::str::from_utf8(complete.body().bytes().unwrap()).unwrap();
        let positions: Vec<_> = ["etag-1", "etag-2", "etag-3"]
            .iter()
            .map(|tag| body.find(tag).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "parts out of order: {body}");
        assert!(body.contains("<PartNumber>3</PartNumber>"));
    }

    #[tokio::test]
    async fn test_failed_part_aborts_upload() {
        let dir = tempdir().unwrap();
        let path = archive_of_size(dir.path(), 2 * MULTIPART_PART_BYTES + 1);
        let (store, http) = replay_store(vec![
            created(Some("upload-1")),
            event(200, Some("\"etag-1\""), ""),
            denied(),
            event(204, None, ""),
        ]);

        let err = store.put_file(KEY, &path).await.unwrap_err();

        assert!(matches!(err, UploadError::Request { operation: "UploadPart", .. }), "{err}");
        let requests: Vec<_> = http.actual_requests().collect();
        assert_eq!(requests.len(), 4);
        let abort = requests[3];
        assert_eq!(abort.method(), "DELETE");
        assert!(abort.uri().contains("uploadId=upload-1"));
    }

    #[tokio::test]
    async fn test_missing_upload_id_is_rejected() {
        let dir = tempdir().unwrap();
        let path = archive_of_size(dir.path(), MULTIPART_PART_BYTES + 1);
        let (store, http) = replay_store(vec![created(None)]);

        let err = store.put_file(KEY, &path).await.unwrap_err();

        assert!(matches!(err, UploadError::Rejected { .. }), "{err}");
        assert_eq!(http.actual_requests().count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_put_is_a_request_error() {
        let dir = tempdir().unwrap();
        let path = archive_of_size(dir.path(), 1024);
        let (store, _http) = replay_store(vec![denied()]);

        let err = store.put_file(KEY, &path).await.unwrap_err();

        assert!(matches!(err, UploadError::Request { operation: "PutObject", .. }), "{err}");
    }
}
