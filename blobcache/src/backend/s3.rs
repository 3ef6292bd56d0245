//! S3 adapter: `ObjectBackend` on top of aws-sdk-s3.
//!
//! Part uploads map onto S3 multipart uploads. S3 hands out the upload id,
//! so the adapter remembers one open upload per (key, session) until the
//! session is committed or forgotten. S3 rejects non-final parts smaller
//! than [`MIN_PART_SIZE`]; configure `max_part_size` accordingly.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, MetadataDirective};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{BackendResult, CopyStatus, Download, Metadata, ObjectBackend, ObjectProperties};
use crate::config::AccountInfo;
use crate::error::Result;
use crate::upload::PartId;

pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;
const MAX_PART_NUMBER: i32 = 10_000;

#[derive(Clone)]
struct MultipartState {
    upload_id: String,
    etags: BTreeMap<u32, String>,
}

pub struct S3Backend {
    client: Client,
    bucket: String,
    uploads: Mutex<HashMap<(String, Uuid), MultipartState>>,
}

impl S3Backend {
    /// Builds a client from explicit credentials; fails with
    /// `Configuration` when they are incomplete.
    pub fn new(bucket: impl Into<String>, account: &AccountInfo) -> Result<Self> {
        account.validate()?;
        let credentials = Credentials::new(
            account.account.clone(),
            account.key.clone(),
            None,
            None,
            "blobcache",
        );
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(account.region.clone()))
            .credentials_provider(credentials);
        if let Some(endpoint) = &account.endpoint {
            builder = builder.endpoint_url(endpoint.clone()).force_path_style(true);
        }
        Ok(Self::with_client(Client::from_conf(builder.build()), bucket))
    }

    /// Loads credentials and region from the standard AWS provider chain.
    pub async fn from_environment(bucket: impl Into<String>, endpoint: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let conf = loader.load().await;
        Self::with_client(Client::new(&conf), bucket)
    }

    pub fn with_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            uploads: Mutex::new(HashMap::new()),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn md5_base64(data: &[u8]) -> String {
        let sum = md5::compute(data);
        B64.encode(sum.0)
    }

    fn copy_source(&self, key: &str) -> String {
        format!("{}/{}", self.bucket, urlencoding::encode(key))
    }

    fn part_number(part: &PartId) -> BackendResult<i32> {
        i32::try_from(part.number())
            .ok()
            .filter(|n| (1..=MAX_PART_NUMBER).contains(n))
            .ok_or_else(|| {
                format!(
                    "part number {} is outside the S3 range 1..={MAX_PART_NUMBER}",
                    part.number()
                )
                .into()
            })
    }

    async fn upload_id_for(&self, key: &str, session: Uuid) -> BackendResult<String> {
        let mut uploads = self.uploads.lock().await;
        if let Some(state) = uploads.get(&(key.to_string(), session)) {
            return Ok(state.upload_id.clone());
        }
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| format!("no upload id returned for `{key}`"))?
            .to_string();
        uploads.insert(
            (key.to_string(), session),
            MultipartState {
                upload_id: upload_id.clone(),
                etags: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    /// Copies the object onto itself with a replaced metadata map, returning
    /// the ETag S3 assigned to the rewritten object.
    async fn replace_metadata(
        &self,
        key: &str,
        metadata: &Metadata,
        content_type: Option<&str>,
    ) -> BackendResult<Option<String>> {
        let out = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .key(key)
            .copy_source(self.copy_source(key))
            .metadata_directive(MetadataDirective::Replace)
            .set_metadata(Some(metadata.clone()))
            .set_content_type(content_type.map(str::to_string))
            .send()
            .await?;
        Ok(out
            .copy_object_result()
            .and_then(|r| r.e_tag())
            .map(str::to_string))
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn ensure_container(&self) -> BackendResult<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(()),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => {
                tracing::info!(bucket = %self.bucket, "creating missing bucket");
                self.client
                    .create_bucket()
                    .bucket(&self.bucket)
                    .send()
                    .await?;
                Ok(())
            }
            Err(e) => Err(Box::new(e)),
        }
    }

    async fn head_object(&self, key: &str) -> BackendResult<Option<ObjectProperties>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(out) => Ok(Some(ObjectProperties {
                etag: out.e_tag().unwrap_or_default().to_string(),
                length: out.content_length().unwrap_or_default().max(0) as u64,
                content_type: out.content_type().map(str::to_string),
                metadata: out.metadata().cloned().unwrap_or_default(),
            })),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(None),
            Err(e) => Err(Box::new(e)),
        }
    }

    async fn get_object(&self, key: &str) -> BackendResult<Option<Download>> {
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(out) => {
                let etag = out.e_tag().unwrap_or_default().to_string();
                let data = out.body.collect().await?.into_bytes();
                Ok(Some(Download { data, etag }))
            }
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => Ok(None),
            Err(e) => Err(Box::new(e)),
        }
    }

    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
        metadata: &Metadata,
    ) -> BackendResult<String> {
        let checksum = Self::md5_base64(&data);
        let out = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .set_content_type(content_type.map(str::to_string))
            .set_metadata(Some(metadata.clone()))
            .content_md5(checksum)
            .body(ByteStream::from(data))
            .send()
            .await?;
        Ok(out.e_tag().unwrap_or_default().to_string())
    }

    async fn delete_object(&self, key: &str) -> BackendResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;
        Ok(())
    }

    async fn set_metadata(
        &self,
        key: &str,
        metadata: &Metadata,
        content_type: Option<&str>,
    ) -> BackendResult<()> {
        self.replace_metadata(key, metadata, content_type).await?;
        Ok(())
    }

    async fn start_copy(&self, source: &str, dest: &str) -> BackendResult<CopyStatus> {
        // CopyObject completes before the response is returned.
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(dest)
            .copy_source(self.copy_source(source))
            .send()
            .await?;
        Ok(CopyStatus::Success)
    }

    async fn copy_status(&self, dest: &str) -> BackendResult<CopyStatus> {
        Ok(match self.head_object(dest).await? {
            Some(_) => CopyStatus::Success,
            None => CopyStatus::Failed,
        })
    }

    async fn stage_part(&self, key: &str, part: &PartId, data: Bytes) -> BackendResult<()> {
        let part_number = Self::part_number(part)?;
        let upload_id = self.upload_id_for(key, part.session()).await?;
        let checksum = Self::md5_base64(&data);
        let out = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .part_number(part_number)
            .content_md5(checksum)
            .body(ByteStream::from(data))
            .send()
            .await?;
        let etag = out.e_tag().unwrap_or_default().to_string();
        if let Some(state) = self
            .uploads
            .lock()
            .await
            .get_mut(&(key.to_string(), part.session()))
        {
            state.etags.insert(part.number(), etag);
        }
        Ok(())
    }

    async fn commit_parts(
        &self,
        key: &str,
        parts: &[PartId],
        content_type: Option<&str>,
    ) -> BackendResult<String> {
        let session = parts
            .first()
            .map(PartId::session)
            .ok_or_else(|| format!("no parts to commit for `{key}`"))?;
        let upload_key = (key.to_string(), session);
        // Kept until the store accepts the commit so a failed one can be retried.
        let state = self
            .uploads
            .lock()
            .await
            .get(&upload_key)
            .cloned()
            .ok_or_else(|| format!("no open upload for `{key}` in session {session}"))?;

        let mut completed = Vec::with_capacity(parts.len());
        for part in parts {
            completed.push(
                CompletedPart::builder()
                    .part_number(Self::part_number(part)?)
                    .set_e_tag(state.etags.get(&part.number()).cloned())
                    .build(),
            );
        }
        let out = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(state.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await?;
        self.uploads.lock().await.remove(&upload_key);
        let mut etag = out.e_tag().unwrap_or_default().to_string();

        if let Some(content_type) = content_type {
            if let Some(rewritten) = self
                .replace_metadata(key, &Metadata::new(), Some(content_type))
                .await?
            {
                etag = rewritten;
            }
        }
        Ok(etag)
    }

    async fn forget_session(&self, key: &str, session: Uuid) -> BackendResult<()> {
        self.uploads.lock().await.remove(&(key.to_string(), session));
        Ok(())
    }
}
