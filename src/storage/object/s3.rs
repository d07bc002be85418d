//! S3-compatible client built on the AWS SDK.
//!
//! No conditional create is used here, so locks on this store fall back to
//! put-then-verify and are best-effort only.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use tracing::instrument;

use super::client::{ObjectClient, StoredObject};
use crate::config::S3StorageConfig;
use crate::error::{StorageError, StorageResult};

/// S3 client bound to one bucket.
#[derive(Clone)]
pub struct S3ObjectClient {
    s3_client: S3Client,
    bucket: String,
}

impl S3ObjectClient {
    /// Build a client from configuration.
    ///
    /// Region and credentials fall back to the SDK's default provider chain.
    /// An `endpoint_url` switches to path-style addressing for S3-compatible
    /// services.
    pub async fn new(config: &S3StorageConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region_name {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(credentials) = &config.credentials {
            loader = loader.credentials_provider(Credentials::new(
                &credentials.access_key_id,
                &credentials.secret_access_key,
                credentials.session_token.clone(),
                None,
                "docstore",
            ));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self::from_client(S3Client::from_conf(builder.build()), config.bucket.clone())
    }

    /// Wrap an existing SDK client.
    #[must_use]
    pub const fn from_client(s3_client: S3Client, bucket: String) -> Self {
        Self { s3_client, bucket }
    }
}

#[async_trait]
impl ObjectClient for S3ObjectClient {
    fn provider(&self) -> &'static str {
        "s3"
    }

    // TODO: use PutObject with `If-None-Match: *` for create_if_absent once the
    // S3-compatible stores we deploy against all honour it.

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, key: &str) -> StorageResult<Option<StoredObject>> {
        let result = self
            .s3_client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| StorageError::backend(key, format!("S3 body read failed: {e}")))?
                    .into_bytes();
                Ok(Some(StoredObject {
                    data: bytes.to_vec(),
                    generation: None,
                }))
            }
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StorageError::backend(
                        key,
                        format!("S3 get_object error: {service_error}"),
                    ))
                }
            }
        }
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        self.s3_client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StorageError::backend(key, format!("S3 put_object error: {e}")))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self
            .s3_client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(StorageError::backend(
                        key,
                        format!("S3 head_object error: {service_error}"),
                    ))
                }
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, key: &str) -> StorageResult<bool> {
        // DeleteObject succeeds on missing keys, so check first.
        if !self.exists(key).await? {
            return Ok(false);
        }
        self.s3_client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::backend(key, format!("S3 delete_object error: {e}")))?;
        Ok(true)
    }

    #[instrument(skip(self), level = "debug")]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .s3_client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let output = request
                .send()
                .await
                .map_err(|e| StorageError::backend(prefix, format!("S3 list_objects error: {e}")))?;

            keys.extend(output.contents().iter().filter_map(|obj| obj.key().map(str::to_string)));

            if output.is_truncated().unwrap_or(false) {
                continuation_token = output.next_continuation_token().map(str::to_string);
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        Ok(keys)
    }

    async fn probe(&self) -> StorageResult<()> {
        self.s3_client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                StorageError::Unavailable(format!("S3 bucket '{}': {e}", self.bucket))
            })?;
        Ok(())
    }
}
