// zrb_common is the main zrb library implementing the backup pipeline shared logic.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::config::{S3Config, StorageClassConfig};
use crate::manifest::{LastBackup, Manifest};
use crate::ZrbError;

use std::cmp;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Mutex;

use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, StorageClass};
use aws_sdk_s3::Client;
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::runtime::Runtime;

/// The object tag value marking manifest uploads.
pub const MANIFEST_TAG: &str = "manifest";

/// The object metadata key carrying the content digest.
const META_BLAKE3: &str = "blake3";

/// Payloads above this size are uploaded in multiple parts (64 MiB).
const MULTIPART_THRESHOLD: u64 = 64 * 1024 * 1024;

/// The size of a single multipart part (64 MiB).
const PART_SIZE: u64 = 64 * 1024 * 1024;

/// The number of parts uploaded concurrently.
const MULTIPART_CONCURRENCY: usize = 4;

/// Storage classes whose data is not readable
/// without a separate restore request to the provider.
const COLD_CLASSES: [&str; 2] = ["GLACIER", "DEEP_ARCHIVE"];

/// Metadata of a stored object as reported by [`ObjectStore::head`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectInfo {
    /// The size of the object in bytes.
    pub size: u64,
    /// The content digest recorded as object metadata at upload time.
    pub blake3: Option<String>,
}

/// An `ObjectStore` is the narrow interface to a remote blob store
/// keyed by string paths. Keys are deterministic, so uploads are
/// idempotent from the caller's perspective.
pub trait ObjectStore: Send + Sync {
    /// Puts the local file at the remote key, attaching the content
    /// digest as object metadata and a `backup-level` tag.
    fn upload(
        &self,
        local: &Path,
        remote: &str,
        blake3_hex: &str,
        level_tag: &str,
    ) -> Result<(), ZrbError>;

    /// Fetches the object at the remote key into the local file.
    fn download(&self, remote: &str, local: &Path) -> Result<(), ZrbError>;

    /// Returns size and recorded digest of the object at the remote key.
    fn head(&self, remote: &str) -> Result<ObjectInfo, ZrbError>;

    /// Probes that credentials and bucket are usable.
    fn verify_access(&self) -> Result<(), ZrbError>;
}

/// Fails with [`ZrbError::ColdStorageClass`] if the storage class
/// is one of the archival tiers that cannot be read directly.
pub fn validate_immediate(class: &str) -> Result<(), ZrbError> {
    if COLD_CLASSES
        .iter()
        .any(|cold| class.eq_ignore_ascii_case(cold))
    {
        return Err(ZrbError::ColdStorageClass(class.to_string()));
    }

    Ok(())
}

/// Returns the remote key of a chunk within a backup's path prefix.
pub fn data_key(s3_path: &str, file_name: &str) -> String {
    format!("data/{}/{}", s3_path, file_name)
}

/// Returns the remote key of a backup's manifest.
pub fn manifest_key(s3_path: &str) -> String {
    format!("manifests/{}/{}", s3_path, Manifest::FILE_NAME)
}

/// Returns the remote key of a dataset's last backup pointer.
pub fn last_backup_key(pool: &str, dataset: &str) -> String {
    format!("manifests/{}/{}/{}", pool, dataset, LastBackup::FILE_NAME)
}

/// An `S3Store` talks to an S3 or S3-compatible bucket.
///
/// It owns a private tokio runtime so the thread-based pipelines
/// can use the SDK through a blocking interface. Transient errors are
/// retried by the SDK with bounded exponential backoff.
pub struct S3Store {
    runtime: Runtime,
    client: Client,
    bucket: String,
    prefix: String,
    classes: StorageClassConfig,
}

impl S3Store {
    /// Connects to the configured bucket.
    ///
    /// With a custom endpoint the standard `AWS_ACCESS_KEY_ID` and
    /// `AWS_SECRET_ACCESS_KEY` environment variables must be set;
    /// otherwise the SDK default credential chain applies.
    pub fn new(config: &S3Config) -> Result<Self, ZrbError> {
        let runtime = Runtime::new()?;

        let credentials = match &config.endpoint {
            Some(_) => Some(Credentials::new(
                env_credential("AWS_ACCESS_KEY_ID")?,
                env_credential("AWS_SECRET_ACCESS_KEY")?,
                None,
                None,
                "zrb-env",
            )),
            None => None,
        };

        let sdk_config = runtime.block_on(async {
            let mut loader = aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(config.region.clone()))
                .retry_config(RetryConfig::standard().with_max_attempts(config.max_retries));

            if let Some(endpoint) = &config.endpoint {
                loader = loader.endpoint_url(endpoint);
            }
            if let Some(credentials) = credentials {
                loader = loader.credentials_provider(credentials);
            }

            loader.load().await
        });

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if config.endpoint.is_some() {
            // S3-compatible stores usually don't resolve bucket subdomains.
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            runtime,
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
            prefix: config.prefix.trim_matches('/').to_string(),
            classes: config.storage_class.clone(),
        })
    }

    fn key(&self, remote: &str) -> String {
        if self.prefix.is_empty() {
            remote.to_string()
        } else {
            format!("{}/{}", self.prefix, remote)
        }
    }

    fn class_for(&self, level_tag: &str) -> StorageClass {
        let class = if level_tag == MANIFEST_TAG {
            self.classes.manifest.as_str()
        } else {
            level_tag
                .parse::<u32>()
                .map(|level| self.classes.data_class(level))
                .unwrap_or("STANDARD")
        };

        StorageClass::from(class)
    }

    async fn upload_single(
        &self,
        local: &Path,
        key: &str,
        blake3_hex: &str,
        tagging: &str,
        class: StorageClass,
    ) -> Result<(), ZrbError> {
        let body = ByteStream::from_path(local)
            .await
            .map_err(|e| ZrbError::Remote(format!("read {}: {e}", local.display())))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .metadata(META_BLAKE3, blake3_hex)
            .tagging(tagging)
            .storage_class(class)
            .send()
            .await
            .map_err(|e| remote_err("upload", key, e))?;

        Ok(())
    }

    async fn upload_multipart(
        &self,
        local: &Path,
        key: &str,
        blake3_hex: &str,
        tagging: &str,
        class: StorageClass,
        size: u64,
    ) -> Result<(), ZrbError> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .metadata(META_BLAKE3, blake3_hex)
            .tagging(tagging)
            .storage_class(class)
            .send()
            .await
            .map_err(|e| remote_err("create multipart upload", key, e))?;

        let upload_id = create
            .upload_id()
            .ok_or_else(|| ZrbError::Remote(format!("upload {key}: missing upload id")))?
            .to_string();

        let part_count = size.div_ceil(PART_SIZE);
        let uploaded = stream::iter(0..part_count)
            .map(|i| {
                let client = self.client.clone();
                let bucket = self.bucket.clone();
                let key = key.to_string();
                let upload_id = upload_id.clone();
                let local = local.to_path_buf();

                async move {
                    let offset = i * PART_SIZE;
                    let len = cmp::min(PART_SIZE, size - offset) as usize;

                    let mut file = tokio::fs::File::open(&local).await?;
                    file.seek(SeekFrom::Start(offset)).await?;
                    let mut buf = vec![0; len];
                    file.read_exact(&mut buf).await?;

                    let part_number = (i + 1) as i32;
                    let part = client
                        .upload_part()
                        .bucket(&bucket)
                        .key(&key)
                        .upload_id(&upload_id)
                        .part_number(part_number)
                        .body(ByteStream::from(buf))
                        .send()
                        .await
                        .map_err(|e| remote_err("upload part", &key, e))?;

                    Ok::<CompletedPart, ZrbError>(
                        CompletedPart::builder()
                            .part_number(part_number)
                            .set_e_tag(part.e_tag().map(str::to_string))
                            .build(),
                    )
                }
            })
            .buffer_unordered(MULTIPART_CONCURRENCY)
            .try_collect::<Vec<_>>()
            .await;

        let mut parts = match uploaded {
            Ok(parts) => parts,
            Err(e) => {
                self.client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                    .ok();

                return Err(e);
            }
        };
        parts.sort_by_key(|part| part.part_number().unwrap_or(0));

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| remote_err("complete multipart upload", key, e))?;

        Ok(())
    }
}

impl ObjectStore for S3Store {
    fn upload(
        &self,
        local: &Path,
        remote: &str,
        blake3_hex: &str,
        level_tag: &str,
    ) -> Result<(), ZrbError> {
        let key = self.key(remote);
        let tagging = format!("backup-level={}", level_tag);
        let class = self.class_for(level_tag);
        let size = fs::metadata(local)?.len();

        self.runtime.block_on(async {
            if size > MULTIPART_THRESHOLD {
                self.upload_multipart(local, &key, blake3_hex, &tagging, class, size)
                    .await
            } else {
                self.upload_single(local, &key, blake3_hex, &tagging, class)
                    .await
            }
        })
    }

    fn download(&self, remote: &str, local: &Path) -> Result<(), ZrbError> {
        let key = self.key(remote);

        self.runtime.block_on(async {
            let resp = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| {
                    if let SdkError::ServiceError(ref service) = e {
                        if service.err().is_no_such_key() {
                            return ZrbError::NoSuchObject(key.clone());
                        }
                    }
                    remote_err("download", &key, e)
                })?;

            let mut body = resp.body.into_async_read();
            let mut file = tokio::fs::File::create(local).await?;
            tokio::io::copy(&mut body, &mut file).await?;

            Ok(())
        })
    }

    fn head(&self, remote: &str) -> Result<ObjectInfo, ZrbError> {
        let key = self.key(remote);

        self.runtime.block_on(async {
            let resp = self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| {
                    if let SdkError::ServiceError(ref service) = e {
                        if service.err().is_not_found() {
                            return ZrbError::NoSuchObject(key.clone());
                        }
                    }
                    remote_err("head", &key, e)
                })?;

            Ok(ObjectInfo {
                size: resp.content_length().unwrap_or(0) as u64,
                blake3: resp
                    .metadata()
                    .and_then(|meta| meta.get(META_BLAKE3).cloned()),
            })
        })
    }

    fn verify_access(&self) -> Result<(), ZrbError> {
        self.runtime.block_on(async {
            self.client
                .head_bucket()
                .bucket(&self.bucket)
                .send()
                .await
                .map_err(|e| remote_err("verify access", &self.bucket, e))?;

            Ok(())
        })
    }
}

fn remote_err<E>(op: &str, key: &str, err: E) -> ZrbError
where
    E: std::error::Error + Send + Sync + 'static,
{
    ZrbError::Remote(format!("{op} {key}: {}", DisplayErrorContext(err)))
}

fn env_credential(name: &str) -> Result<String, ZrbError> {
    env::var(name).map_err(|_| {
        ZrbError::InvalidConfig(format!("{name} must be set when a custom endpoint is used"))
    })
}

/// A stored object of the in-memory implementation.
#[derive(Clone, Debug)]
pub struct MemoryObject {
    pub data: Vec<u8>,
    pub blake3: String,
    pub level_tag: String,
}

/// A `MemoryStore` keeps objects in process memory.
/// Used by the test suite in place of a real bucket.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, MemoryObject>>,
    upload_counts: Mutex<HashMap<String, u32>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports whether an object exists at the key.
    pub fn contains(&self, remote: &str) -> bool {
        self.objects.lock().unwrap().contains_key(remote)
    }

    /// Returns a copy of the object at the key.
    pub fn object(&self, remote: &str) -> Option<MemoryObject> {
        self.objects.lock().unwrap().get(remote).cloned()
    }

    /// Returns all keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Returns how many successful uploads the key has seen.
    pub fn upload_count(&self, remote: &str) -> u32 {
        self.upload_counts
            .lock()
            .unwrap()
            .get(remote)
            .copied()
            .unwrap_or(0)
    }

    /// Overwrites the stored bytes without touching the recorded digest,
    /// simulating remote corruption.
    pub fn corrupt(&self, remote: &str) {
        if let Some(object) = self.objects.lock().unwrap().get_mut(remote) {
            for byte in &mut object.data {
                *byte = !*byte;
            }
        }
    }
}

impl ObjectStore for MemoryStore {
    fn upload(
        &self,
        local: &Path,
        remote: &str,
        blake3_hex: &str,
        level_tag: &str,
    ) -> Result<(), ZrbError> {
        let data = fs::read(local)?;

        self.objects.lock().unwrap().insert(
            remote.to_string(),
            MemoryObject {
                data,
                blake3: blake3_hex.to_string(),
                level_tag: level_tag.to_string(),
            },
        );
        *self
            .upload_counts
            .lock()
            .unwrap()
            .entry(remote.to_string())
            .or_insert(0) += 1;

        Ok(())
    }

    fn download(&self, remote: &str, local: &Path) -> Result<(), ZrbError> {
        let object = self
            .object(remote)
            .ok_or_else(|| ZrbError::NoSuchObject(remote.to_string()))?;

        fs::write(local, object.data)?;
        Ok(())
    }

    fn head(&self, remote: &str) -> Result<ObjectInfo, ZrbError> {
        let object = self
            .object(remote)
            .ok_or_else(|| ZrbError::NoSuchObject(remote.to_string()))?;

        Ok(ObjectInfo {
            size: object.data.len() as u64,
            blake3: Some(object.blake3),
        })
    }

    fn verify_access(&self) -> Result<(), ZrbError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cold_classes_are_rejected() {
        assert!(validate_immediate("STANDARD").is_ok());
        assert!(validate_immediate("STANDARD_IA").is_ok());

        assert!(matches!(
            validate_immediate("GLACIER"),
            Err(ZrbError::ColdStorageClass(_))
        ));
        assert!(matches!(
            validate_immediate("deep_archive"),
            Err(ZrbError::ColdStorageClass(_))
        ));
    }

    #[test]
    fn remote_layout_keys() {
        assert_eq!(
            data_key("tank/data/level0/20240115", "snapshot.part-aaaaaa.age"),
            "data/tank/data/level0/20240115/snapshot.part-aaaaaa.age"
        );
        assert_eq!(
            manifest_key("tank/data/level0/20240115"),
            "manifests/tank/data/level0/20240115/task_manifest.yaml"
        );
        assert_eq!(
            last_backup_key("tank", "data"),
            "manifests/tank/data/last_backup_manifest.yaml"
        );
    }

    #[test]
    fn memory_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("chunk.age");
        let dst = dir.path().join("downloaded.age");
        fs::write(&src, b"ciphertext bytes").unwrap();

        let store = MemoryStore::new();
        store.upload(&src, "data/x/chunk.age", "abc123", "0").unwrap();
        store.upload(&src, "data/x/chunk.age", "abc123", "0").unwrap();

        assert!(store.contains("data/x/chunk.age"));
        assert_eq!(store.upload_count("data/x/chunk.age"), 2);

        let info = store.head("data/x/chunk.age").unwrap();
        assert_eq!(info.size, 16);
        assert_eq!(info.blake3.as_deref(), Some("abc123"));

        store.download("data/x/chunk.age", &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"ciphertext bytes");

        assert!(matches!(
            store.download("data/x/other.age", &dst),
            Err(ZrbError::NoSuchObject(_))
        ));
        assert!(matches!(
            store.head("data/x/other.age"),
            Err(ZrbError::NoSuchObject(_))
        ));
    }

    #[test]
    fn corruption_keeps_recorded_digest() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("chunk.age");
        fs::write(&src, b"payload").unwrap();

        let store = MemoryStore::new();
        store.upload(&src, "k", "digest", "1").unwrap();
        store.corrupt("k");

        let object = store.object("k").unwrap();
        assert_ne!(object.data, b"payload");
        assert_eq!(object.blake3, "digest");
        assert_eq!(object.level_tag, "1");
    }
}
