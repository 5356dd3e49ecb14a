//! Object storage access. One lazily created S3 client is shared by the
//! whole process; the [`ObjectStore`] trait keeps the pipeline testable
//! without the SDK.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rastergrid_core::{EnvSettings, RasterGridError};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::OnceCell;

/// Split an `s3://bucket/key` URI. Google Cloud Storage sources are read by
/// GDAL through `/vsigs/`; manifests and destinations must live on S3.
pub fn split_s3_uri(uri: &str) -> Result<(&str, &str)> {
	let rest = match uri.strip_prefix("s3://") {
		Some(rest) => rest,
		None => bail!("not an s3:// URI: {uri}"),
	};
	match rest.split_once('/') {
		Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok((bucket, key)),
		_ => bail!("malformed s3:// URI: {uri}"),
	}
}

/// GDAL virtual filesystem path for a remote raster URI.
pub fn to_vsi_path(uri: &str) -> String {
	if let Some(rest) = uri.strip_prefix("s3://") {
		format!("/vsis3/{rest}")
	} else if let Some(rest) = uri.strip_prefix("gs://") {
		format!("/vsigs/{rest}")
	} else {
		uri.to_string()
	}
}

/// Minimal object storage interface used by the pipeline: existence checks,
/// manifest reads, uploads and (for `process_locally`) downloads.
#[async_trait]
pub trait ObjectStore: Send + Sync {
	async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;
	async fn read(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;
	async fn upload(&self, path: &Path, bucket: &str, key: &str) -> Result<()>;
	async fn download(&self, bucket: &str, key: &str, dest: &Path) -> Result<()>;
}

/// S3-backed store. The client is created on first use and reused; it is safe
/// for concurrent use.
pub struct S3Store {
	region: String,
	endpoint_url: Option<String>,
	client: OnceCell<aws_sdk_s3::Client>,
}

impl S3Store {
	pub fn new(settings: &EnvSettings) -> S3Store {
		S3Store {
			region: settings.aws_region.clone(),
			endpoint_url: settings.endpoint_url.clone(),
			client: OnceCell::new(),
		}
	}

	async fn client(&self) -> &aws_sdk_s3::Client {
		self
			.client
			.get_or_init(|| async {
				let region = aws_config::Region::new(self.region.clone());
				let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region);
				if let Some(endpoint) = &self.endpoint_url {
					loader = loader.endpoint_url(endpoint);
				}
				let config = loader.load().await;
				aws_sdk_s3::Client::new(&config)
			})
			.await
	}
}

#[async_trait]
impl ObjectStore for S3Store {
	async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
		let result = self.client().await.head_object().bucket(bucket).key(key).send().await;
		match result {
			Ok(_) => Ok(true),
			Err(err) => {
				let service_err = err.into_service_error();
				if service_err.is_not_found() {
					Ok(false)
				} else {
					Err(anyhow::Error::from(service_err)).with_context(|| format!("head_object failed for s3://{bucket}/{key}"))
				}
			}
		}
	}

	async fn read(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
		let response = self
			.client()
			.await
			.get_object()
			.bucket(bucket)
			.key(key)
			.send()
			.await
			.map_err(|err| {
				let service_err = err.into_service_error();
				if matches!(&service_err, aws_sdk_s3::operation::get_object::GetObjectError::NoSuchKey(_)) {
					anyhow::Error::from(RasterGridError::ManifestNotFound(format!("s3://{bucket}/{key}")))
				} else {
					anyhow::Error::from(service_err)
				}
			})
			.with_context(|| format!("get_object failed for s3://{bucket}/{key}"))?;
		let bytes = response
			.body
			.collect()
			.await
			.with_context(|| format!("failed to read body of s3://{bucket}/{key}"))?;
		Ok(bytes.into_bytes().to_vec())
	}

	async fn upload(&self, path: &Path, bucket: &str, key: &str) -> Result<()> {
		let body = aws_sdk_s3::primitives::ByteStream::from_path(path)
			.await
			.with_context(|| format!("failed to open {path:?} for upload"))?;
		self
			.client()
			.await
			.put_object()
			.bucket(bucket)
			.key(key)
			.body(body)
			.send()
			.await
			.map_err(|err| RasterGridError::Upload(format!("s3://{bucket}/{key}: {}", err.into_service_error())))?;
		log::debug!("uploaded {path:?} to s3://{bucket}/{key}");
		Ok(())
	}

	async fn download(&self, bucket: &str, key: &str, dest: &Path) -> Result<()> {
		if let Some(parent) = dest.parent() {
			tokio::fs::create_dir_all(parent)
				.await
				.with_context(|| format!("failed to create {parent:?}"))?;
		}
		let bytes = self.read(bucket, key).await?;
		tokio::fs::write(dest, bytes)
			.await
			.with_context(|| format!("failed to write {dest:?}"))?;
		log::debug!("downloaded s3://{bucket}/{key} to {dest:?}");
		Ok(())
	}
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryStore {
	objects: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryStore {
	pub fn new() -> MemoryStore {
		MemoryStore::default()
	}

	pub fn put(&self, bucket: &str, key: &str, content: impl Into<Vec<u8>>) {
		self
			.objects
			.lock()
			.unwrap()
			.insert((bucket.to_string(), key.to_string()), content.into());
	}

	pub fn keys(&self, bucket: &str) -> Vec<String> {
		let mut keys: Vec<String> = self
			.objects
			.lock()
			.unwrap()
			.keys()
			.filter(|(b, _)| b == bucket)
			.map(|(_, k)| k.clone())
			.collect();
		keys.sort();
		keys
	}
}

#[async_trait]
impl ObjectStore for MemoryStore {
	async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
		Ok(
			self
				.objects
				.lock()
				.unwrap()
				.contains_key(&(bucket.to_string(), key.to_string())),
		)
	}

	async fn read(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
		self
			.objects
			.lock()
			.unwrap()
			.get(&(bucket.to_string(), key.to_string()))
			.cloned()
			.ok_or_else(|| RasterGridError::ManifestNotFound(format!("s3://{bucket}/{key}")).into())
	}

	async fn upload(&self, path: &Path, bucket: &str, key: &str) -> Result<()> {
		let content = std::fs::read(path).with_context(|| format!("failed to read {path:?}"))?;
		self.put(bucket, key, content);
		Ok(())
	}

	async fn download(&self, bucket: &str, key: &str, dest: &Path) -> Result<()> {
		let content = self.read(bucket, key).await?;
		if let Some(parent) = dest.parent() {
			std::fs::create_dir_all(parent)?;
		}
		std::fs::write(dest, content)?;
		Ok(())
	}
}
