//! The object-store transport boundary: a trait so the retry/state-machine
//! logic in `uploader/mod.rs` can be tested without a real S3 endpoint.

use std::path::Path;

use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, StorageClass};
use futures::future::BoxFuture;

use crate::error::UploadError;

/// Files larger than this use multipart upload.
pub const MULTIPART_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;
/// Size of each multipart part.
pub const PART_SIZE_BYTES: usize = 5 * 1024 * 1024;

/// Abstracts over "put a file at this key in the remote object store."
///
/// Implemented for the real `aws-sdk-s3` client and for an in-memory fake in
/// tests. Returns a boxed future rather than using `async fn` so the trait
/// stays object-safe for `Box<dyn UploadBackend>`.
pub trait UploadBackend: Send + Sync {
    /// Upload `local_path` to `key`, choosing multipart automatically for
    /// files over [`MULTIPART_THRESHOLD_BYTES`].
    fn put<'a>(&'a self, local_path: &'a Path, key: &'a str) -> BoxFuture<'a, Result<(), UploadError>>;
}

/// S3-compatible backend over `aws-sdk-s3`.
pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl S3Backend {
    /// Construct a backend from an already-loaded AWS SDK client.
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    async fn put_object(&self, local_path: &Path, key: &str) -> Result<(), UploadError> {
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .storage_class(StorageClass::Standard)
            .server_side_encryption(aws_sdk_s3::types::ServerSideEncryption::Aes256)
            .body(body)
            .send()
            .await
            .map_err(classify_sdk_error)?;
        Ok(())
    }

    async fn multipart_upload(&self, local_path: &Path, key: &str) -> Result<(), UploadError> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .storage_class(StorageClass::Standard)
            .server_side_encryption(aws_sdk_s3::types::ServerSideEncryption::Aes256)
            .send()
            .await
            .map_err(classify_sdk_error)?;

        let upload_id = create.upload_id().ok_or_else(|| {
            UploadError::Transport("multipart create response missing upload id".to_string())
        })?;

        match self.upload_parts(local_path, key, upload_id).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
                    .send()
                    .await
                    .map_err(classify_sdk_error)?;
                Ok(())
            }
            Err(e) => {
                tracing::error!(key, error = %e, "multipart upload failed, aborting");
                let _ = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .send()
                    .await;
                Err(UploadError::MultipartAborted(e.to_string()))
            }
        }
    }

    async fn upload_parts(
        &self,
        local_path: &Path,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>, UploadError> {
        use tokio::io::AsyncReadExt;

        let mut file = tokio::fs::File::open(local_path)
            .await
            .map_err(|e| UploadError::Transport(e.to_string()))?;
        let mut parts = Vec::new();
        let mut part_number: i32 = 1;

        loop {
            let mut buf = vec![0u8; PART_SIZE_BYTES];
            let mut filled = 0;
            while filled < buf.len() {
                let n = file.read(&mut buf[filled..]).await.map_err(|e| UploadError::Transport(e.to_string()))?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            buf.truncate(filled);

            let response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buf))
                .send()
                .await
                .map_err(classify_sdk_error)?;

            let etag = response.e_tag().unwrap_or_default().to_string();
            parts.push(CompletedPart::builder().part_number(part_number).e_tag(etag).build());
            part_number += 1;
        }

        Ok(parts)
    }
}

impl UploadBackend for S3Backend {
    fn put<'a>(&'a self, local_path: &'a Path, key: &'a str) -> BoxFuture<'a, Result<(), UploadError>> {
        Box::pin(async move {
            let size = tokio::fs::metadata(local_path)
                .await
                .map_err(|e| UploadError::Transport(e.to_string()))?
                .len();

            if size > MULTIPART_THRESHOLD_BYTES {
                tracing::info!(size_mb = size as f64 / (1024.0 * 1024.0), key, "using multipart upload");
                self.multipart_upload(local_path, key).await
            } else {
                self.put_object(local_path, key).await
            }
        })
    }
}

/// Classify an `aws-sdk-s3` SDK error into our transient/terminal split.
/// Network-layer and timeout errors are transient; any error the service
/// itself returned is inspected for a 5xx/429 status first.
fn classify_sdk_error<E, R>(err: aws_sdk_s3::error::SdkError<E, R>) -> UploadError
where
    E: std::error::Error + 'static,
{
    use aws_sdk_s3::error::SdkError;

    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => UploadError::Transport(err.to_string()),
        SdkError::ResponseError(context) => {
            let status = context.raw().status().as_u16();
            if status >= 500 || status == 429 {
                UploadError::Transient { code: status.to_string(), message: err.to_string() }
            } else {
                UploadError::Terminal { code: status.to_string(), message: err.to_string() }
            }
        }
        SdkError::ServiceError(context) => {
            let status = context.raw().status().as_u16();
            if status >= 500 || status == 429 {
                UploadError::Transient { code: status.to_string(), message: err.to_string() }
            } else {
                UploadError::Terminal { code: status.to_string(), message: err.to_string() }
            }
        }
        _ => UploadError::Terminal { code: "unknown".to_string(), message: err.to_string() },
    }
}

#[cfg(test)]
pub mod fakes {
    use super::*;
    use std::sync::Mutex;

    /// In-memory backend for uploader tests: records calls, optionally fails
    /// the first N attempts with a given error.
    pub struct FakeBackend {
        pub calls: Mutex<Vec<String>>,
        pub fail_times: Mutex<u32>,
        pub error: UploadError,
    }

    impl FakeBackend {
        pub fn always_succeeds() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_times: Mutex::new(0),
                error: UploadError::Transport("unused".to_string()),
            }
        }

        pub fn fails_n_times(n: u32, error: UploadError) -> Self {
            Self { calls: Mutex::new(Vec::new()), fail_times: Mutex::new(n), error }
        }
    }

    impl UploadBackend for FakeBackend {
        fn put<'a>(&'a self, _local_path: &'a Path, key: &'a str) -> BoxFuture<'a, Result<(), UploadError>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(key.to_string());
                let mut remaining = self.fail_times.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(match &self.error {
                        UploadError::Transport(m) => UploadError::Transport(m.clone()),
                        UploadError::Transient { code, message } => {
                            UploadError::Transient { code: code.clone(), message: message.clone() }
                        }
                        UploadError::Terminal { code, message } => {
                            UploadError::Terminal { code: code.clone(), message: message.clone() }
                        }
                        other => UploadError::Transport(other.to_string()),
                    });
                }
                Ok(())
            })
        }
    }
}
