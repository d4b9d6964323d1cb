// dbsnapshot/src/storage/s3.rs
use anyhow::anyhow;
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::{BehaviorVersion, Credentials, Region};
use s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use super::destination::{CredentialSource, RemoteTarget};
use super::{ArtifactLocation, ArtifactStore, FetchedArtifact, StoredArtifact};
use crate::backup::archive::StagedArtifact;
use crate::errors::BackupError;
use crate::utils::interrupt::Interrupt;

/// Objects up to this size go up in one `PutObject`.
const SINGLE_PUT_LIMIT: u64 = 64 * 1024 * 1024;
const PART_SIZE: usize = 16 * 1024 * 1024;
const ABORT_TIMEOUT: Duration = Duration::from_secs(30);
const SHA256_METADATA: &str = "sha256";
const CONTENT_TYPE: &str = "application/gzip";

/// An S3-compatible bucket/prefix (AWS, DigitalOcean Spaces, MinIO, ...).
pub struct S3Store {
    client: s3::Client,
    bucket: String,
    prefix: String,
    staging_dir: PathBuf,
    multipart_threshold: u64,
    part_size: usize,
}

impl S3Store {
    pub async fn connect(target: &RemoteTarget, staging_dir: PathBuf) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(target.region.clone()));
        if let Some(endpoint) = &target.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        if let CredentialSource::Explicit {
            access_key_id,
            secret_access_key,
            session_token,
        } = &target.credentials
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key,
                session_token.clone(),
                None,     // expiry
                "Static", // provider_name
            ));
        }
        let sdk_config = loader.load().await;

        let mut s3_config = s3::config::Builder::from(&sdk_config);
        if target.endpoint_url.is_some() {
            // Most S3-compatible services only route path-style requests.
            s3_config = s3_config.force_path_style(true);
        }

        tracing::debug!(
            "S3 client initialized: bucket={}, prefix={}, region={}",
            target.bucket,
            target.prefix,
            target.region
        );

        Self {
            client: s3::Client::from_conf(s3_config.build()),
            bucket: target.bucket.clone(),
            prefix: target.prefix.clone(),
            staging_dir,
            multipart_threshold: SINGLE_PUT_LIMIT,
            part_size: PART_SIZE,
        }
    }

    fn key_for(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn location(&self, key: &str) -> ArtifactLocation {
        ArtifactLocation::Remote {
            bucket: self.bucket.clone(),
            key: key.to_string(),
        }
    }

    async fn put_single(
        &self,
        key: &str,
        artifact: &StagedArtifact,
        interrupt: &Interrupt,
    ) -> Result<(), BackupError> {
        let location = self.location(key).to_string();
        let body = ByteStream::from_path(artifact.file.path())
            .await
            .map_err(|e| BackupError::upload(&location, e))?;

        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(CONTENT_TYPE)
            .metadata(SHA256_METADATA, &artifact.sha256)
            .body(body)
            .send();

        // Dropping an unfinished PutObject never creates the object.
        tokio::select! {
            sent = request => {
                sent.map_err(|e| BackupError::upload(&location, DisplayErrorContext(&e)))?;
            }
            stop = interrupt.triggered() => return Err(stop),
        }
        Ok(())
    }

    async fn put_multipart(
        &self,
        key: &str,
        artifact: &StagedArtifact,
        interrupt: &Interrupt,
    ) -> Result<(), BackupError> {
        let location = self.location(key).to_string();
        tracing::info!(
            "Starting multipart upload: {} ({} bytes, {} parts)",
            location,
            artifact.size,
            artifact.size.div_ceil(self.part_size as u64)
        );

        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(CONTENT_TYPE)
            .metadata(SHA256_METADATA, &artifact.sha256)
            .send();
        tokio::pin!(create);
        let created = tokio::select! {
            created = &mut create => created.map_err(|e| BackupError::upload(&location, DisplayErrorContext(&e)))?,
            stop = interrupt.triggered() => {
                // The server may already have issued an upload id; wait for it so it can be aborted.
                if let Ok(Ok(created)) = tokio::time::timeout(ABORT_TIMEOUT, create).await {
                    if let Some(upload_id) = created.upload_id() {
                        self.abort(key, upload_id).await;
                    }
                }
                return Err(stop);
            }
        };
        let upload_id = created
            .upload_id()
            .ok_or_else(|| BackupError::upload(&location, "no upload id returned"))?
            .to_string();

        let outcome = match self
            .upload_parts(key, &upload_id, artifact.file.path(), interrupt)
            .await
        {
            Ok(parts) => self.complete(key, &upload_id, parts, interrupt).await,
            Err(e) => Err(e),
        };

        if outcome.is_err() {
            self.abort(key, &upload_id).await;
        }
        outcome
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        path: &Path,
        interrupt: &Interrupt,
    ) -> Result<Vec<CompletedPart>, BackupError> {
        let location = self.location(key).to_string();
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| BackupError::upload(&location, e))?;
        let mut completed = Vec::new();
        let mut part_number = 1;

        loop {
            interrupt.check()?;
            let chunk = read_chunk(&mut file, self.part_size)
                .await
                .map_err(|e| BackupError::upload(&location, e))?;
            if chunk.is_empty() {
                break;
            }
            tracing::debug!("Uploading part {} ({} bytes)", part_number, chunk.len());

            let uploaded = tokio::select! {
                uploaded = self
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(chunk))
                    .send() => uploaded.map_err(|e| {
                        BackupError::upload(&location, format!("part {}: {}", part_number, DisplayErrorContext(&e)))
                    })?,
                stop = interrupt.triggered() => return Err(stop),
            };

            completed.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(uploaded.e_tag().unwrap_or_default())
                    .build(),
            );
            part_number += 1;
        }
        Ok(completed)
    }

    async fn complete(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
        interrupt: &Interrupt,
    ) -> Result<(), BackupError> {
        let location = self.location(key).to_string();
        interrupt.check()?;
        let request = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send();
        interrupt
            .bound(async {
                request
                    .await
                    .map_err(|e| BackupError::upload(&location, DisplayErrorContext(&e)))
            })
            .await?;
        Ok(())
    }

    async fn abort(&self, key: &str, upload_id: &str) {
        let request = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send();
        match tokio::time::timeout(ABORT_TIMEOUT, request).await {
            Ok(Ok(_)) => tracing::info!("Aborted multipart upload {} for {}", upload_id, key),
            Ok(Err(e)) => tracing::warn!(
                "⚠️ Failed to abort multipart upload {} for {}: {}",
                upload_id,
                key,
                DisplayErrorContext(&e)
            ),
            Err(_) => tracing::warn!(
                "⚠️ Abort of multipart upload {} for {} timed out; the bucket lifecycle rules must clean it up",
                upload_id,
                key
            ),
        }
    }
}

/// Fills up to `size` bytes, short only at end of input.
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, size: usize) -> std::io::Result<Vec<u8>> {
    let mut buffer = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = reader.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buffer.truncate(filled);
    Ok(buffer)
}

/// The artifact name of `key` under `prefix`; nested keys are not artifacts.
pub fn relative_name<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let name = key.strip_prefix(prefix)?;
    (!name.is_empty() && !name.contains('/')).then_some(name)
}

#[async_trait]
impl ArtifactStore for S3Store {
    fn describe(&self) -> String {
        format!("remote:{}/{}", self.bucket, self.prefix)
    }

    fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    async fn put(
        &self,
        name: &str,
        artifact: StagedArtifact,
        interrupt: &Interrupt,
    ) -> Result<StoredArtifact, BackupError> {
        let key = self.key_for(name);
        tracing::info!(
            "Uploading {} bytes to S3 bucket {} with key {}",
            artifact.size,
            self.bucket,
            key
        );

        if artifact.size <= self.multipart_threshold {
            self.put_single(&key, &artifact, interrupt).await?;
        } else {
            self.put_multipart(&key, &artifact, interrupt).await?;
        }

        tracing::info!("✅ Successfully uploaded to s3://{}/{}", self.bucket, key);
        Ok(StoredArtifact {
            name: name.to_string(),
            location: self.location(&key),
            size: artifact.size,
            sha256: artifact.sha256,
        })
    }

    async fn list(&self) -> Result<Vec<String>, BackupError> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&self.prefix)
            .into_paginator()
            .send();

        let mut names = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                anyhow!(
                    "Failed to list s3://{}/{}: {}",
                    self.bucket,
                    self.prefix,
                    DisplayErrorContext(&e)
                )
            })?;
            for object in page.contents() {
                if let Some(name) = object.key().and_then(|key| relative_name(&self.prefix, key)) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<(), BackupError> {
        let key = self.key_for(name);
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            // S3 itself answers 204 for missing keys; compatible stores may not.
            Err(e) if e.code() == Some("NoSuchKey") => Ok(()),
            Err(e) if e.raw_response().map(|r| r.status().as_u16()) == Some(404) => Ok(()),
            Err(e) => Err(anyhow!(
                "Failed to delete s3://{}/{}: {}",
                self.bucket,
                key,
                DisplayErrorContext(&e)
            )
            .into()),
        }
    }

    async fn fetch(&self, name: &str, scratch_dir: &Path) -> Result<FetchedArtifact, BackupError> {
        let key = self.key_for(name);
        tracing::info!("Downloading s3://{}/{}", self.bucket, key);

        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                anyhow!(
                    "Failed to get object s3://{}/{}: {}",
                    self.bucket,
                    key,
                    DisplayErrorContext(&e)
                )
            })?;
        let recorded = object
            .metadata()
            .and_then(|m| m.get(SHA256_METADATA))
            .map(|digest| digest.to_ascii_lowercase());

        std::fs::create_dir_all(scratch_dir).map_err(BackupError::local_write(scratch_dir))?;
        let download = tempfile::Builder::new()
            .prefix(".download-")
            .suffix(".partial")
            .tempfile_in(scratch_dir)
            .map_err(BackupError::local_write(scratch_dir))?;
        let (file, path) = download.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut body = object.body.into_async_read();
        let downloaded = tokio::io::copy(&mut body, &mut file)
            .await
            .map_err(BackupError::local_write(path.to_path_buf()))?;
        file.flush()
            .await
            .map_err(BackupError::local_write(path.to_path_buf()))?;

        tracing::info!(
            "✅ Successfully downloaded {} bytes from s3://{}/{}",
            downloaded,
            self.bucket,
            key
        );
        Ok(FetchedArtifact::downloaded(path, recorded))
    }
}
