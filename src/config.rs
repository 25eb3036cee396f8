//! Bucket wiring for services embedding the engine.
//!
//! The engine itself only consumes an `Arc<dyn ObjectStore>`; this module
//! maps a storage location string onto one so deployments do not each
//! reimplement the mapping.

use crate::{Error, Result};
use object_store::{aws::AmazonS3Builder, memory::InMemory, ObjectStore};
use std::sync::Arc;
use tracing::info;

const S3_SCHEME: &str = "s3://";

/// Open the bucket named by a storage location.
///
/// Supported forms:
/// - `memory`: in-process store for development and tests
/// - `s3://<bucket>`: S3, or any S3-compatible store when `endpoint` is
///   given. Credentials come from the usual AWS environment; the region
///   falls back to `us-east-1` when none is configured.
pub fn open_bucket(location: &str, endpoint: Option<&str>) -> Result<Arc<dyn ObjectStore>> {
    match location.trim() {
        "memory" => {
            info!("using in-memory bucket");
            Ok(Arc::new(InMemory::new()))
        }
        trimmed if trimmed.starts_with(S3_SCHEME) => {
            let bucket = &trimmed[S3_SCHEME.len()..];
            if bucket.is_empty() || bucket.contains('/') {
                return Err(Error::Config(format!(
                    "storage location '{trimmed}' must name a bucket, like s3://blocks"
                )));
            }

            let region = std::env::var("AWS_REGION")
                .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
                .unwrap_or_else(|_| "us-east-1".to_string());
            let mut builder = AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .with_region(&region);
            if let Some(endpoint) = endpoint {
                builder = builder.with_endpoint(endpoint).with_allow_http(true);
            }

            info!(bucket, %region, endpoint = endpoint.unwrap_or("default"), "using S3 bucket");
            Ok(Arc::new(builder.build()?))
        }
        other => Err(Error::Config(format!(
            "unsupported storage location '{other}', expected 'memory' or 's3://<bucket>'"
        ))),
    }
}
