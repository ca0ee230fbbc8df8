//! S3 storage service backed by `aws-sdk-s3`

use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as AwsS3Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::{MultipartSink, ObjectDescriptor, ObjectKey, ObjectSource, ObjectStat, PartHandle};
use crate::error::{TransferError, TransferResult};

/// S3 (or S3-compatible) storage service
#[derive(Clone)]
pub struct S3Store {
    client: AwsS3Client,
}

impl S3Store {
    /// Wrap an already configured SDK client
    pub fn new(client: AwsS3Client) -> Self {
        Self { client }
    }

    /// Build a client from the default credential chain
    ///
    /// `endpoint` selects an S3-compatible service (MinIO, LocalStack, ...),
    /// which usually also needs `force_path_style`.
    pub async fn from_env(
        region: Option<String>,
        endpoint: Option<String>,
        force_path_style: bool,
    ) -> Self {
        let region_provider = match region {
            Some(region) => RegionProviderChain::first_try(Region::new(region)),
            None => RegionProviderChain::default_provider(),
        };
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        if force_path_style {
            builder = builder.force_path_style(true);
        }

        Self::new(AwsS3Client::from_conf(builder.build()))
    }
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos())
}

fn part_number(number: u32) -> TransferResult<i32> {
    i32::try_from(number)
        .map_err(|_| TransferError::InvalidConfig(format!("part number {} out of range", number)))
}

/// Convert AWS SDK errors to TransferError
impl<E> From<aws_sdk_s3::error::SdkError<E>> for TransferError
where
    E: std::error::Error + 'static,
{
    fn from(error: aws_sdk_s3::error::SdkError<E>) -> Self {
        match error {
            aws_sdk_s3::error::SdkError::DispatchFailure(e) => {
                TransferError::Network(format!("Network dispatch failure: {:?}", e))
            }
            aws_sdk_s3::error::SdkError::ResponseError(e) => {
                TransferError::Network(format!("Response error: {:?}", e))
            }
            aws_sdk_s3::error::SdkError::TimeoutError(e) => {
                TransferError::Network(format!("Timeout: {:?}", e))
            }
            aws_sdk_s3::error::SdkError::ServiceError(e) => {
                let err_str = format!("{:?}", e);
                if err_str.contains("AccessDenied") {
                    TransferError::AccessDenied("Access denied to resource".to_string())
                } else if err_str.contains("NoSuchUpload") {
                    TransferError::Session("The specified upload does not exist".to_string())
                } else {
                    TransferError::Service {
                        code: "Unknown".to_string(),
                        message: err_str,
                    }
                }
            }
            _ => TransferError::Sdk(format!("{:?}", error)),
        }
    }
}

fn map_missing<E>(key: &ObjectKey, error: aws_sdk_s3::error::SdkError<E>) -> TransferError
where
    E: std::error::Error + 'static,
{
    let text = format!("{:?}", error);
    if text.contains("NotFound") || text.contains("NoSuchKey") || text.contains("404") {
        TransferError::NotFound {
            bucket: key.bucket.clone(),
            key: key.key.clone(),
        }
    } else {
        TransferError::from(error)
    }
}

#[async_trait]
impl ObjectSource for S3Store {
    async fn stat(&self, key: &ObjectKey) -> TransferResult<ObjectStat> {
        let response = self
            .client
            .head_object()
            .bucket(&key.bucket)
            .key(&key.key)
            .send()
            .await
            .map_err(|e| map_missing(key, e))?;

        Ok(ObjectStat {
            size: response.content_length().unwrap_or(0).max(0) as u64,
            last_modified: response.last_modified().and_then(to_chrono),
            etag: response.e_tag().map(|s| s.to_string()),
        })
    }

    async fn fetch_range(&self, key: &ObjectKey, start: u64, end: u64) -> TransferResult<Bytes> {
        let response = self
            .client
            .get_object()
            .bucket(&key.bucket)
            .key(&key.key)
            .range(format!("bytes={}-{}", start, end))
            .send()
            .await
            .map_err(|e| map_missing(key, e))?;

        let body = response.body.collect().await.map_err(|e| {
            TransferError::Network(format!("Failed to collect response body: {}", e))
        })?;

        let data = body.into_bytes();
        let expected = end - start + 1;
        if data.len() as u64 != expected {
            return Err(TransferError::Network(format!(
                "short range read: expected {} bytes, got {}",
                expected,
                data.len()
            )));
        }
        Ok(data)
    }
}

#[async_trait]
impl MultipartSink for S3Store {
    async fn initiate_session(&self, key: &ObjectKey) -> TransferResult<String> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(&key.bucket)
            .key(&key.key)
            .send()
            .await
            .map_err(TransferError::from)?;

        response
            .upload_id()
            .map(|s| s.to_string())
            .ok_or_else(|| TransferError::Session("No upload ID returned".to_string()))
    }

    async fn send_part(
        &self,
        key: &ObjectKey,
        upload_id: &str,
        number: u32,
        data: Bytes,
    ) -> TransferResult<PartHandle> {
        let size = data.len() as u64;

        let response = self
            .client
            .upload_part()
            .bucket(&key.bucket)
            .key(&key.key)
            .upload_id(upload_id)
            .part_number(part_number(number)?)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(TransferError::from)?;

        let etag = response
            .e_tag()
            .ok_or_else(|| TransferError::Session("No ETag returned for part".to_string()))?;

        Ok(PartHandle::new(number, etag, size))
    }

    async fn complete_session(
        &self,
        key: &ObjectKey,
        upload_id: &str,
        parts: &[PartHandle],
    ) -> TransferResult<ObjectDescriptor> {
        // S3 refuses to complete a session with no parts; an empty object
        // is a single empty part.
        let empty;
        let parts = if parts.is_empty() {
            empty = [self.send_part(key, upload_id, 1, Bytes::new()).await?];
            &empty[..]
        } else {
            parts
        };

        let completed_parts = parts
            .iter()
            .map(|p| {
                Ok(CompletedPart::builder()
                    .part_number(part_number(p.number)?)
                    .e_tag(&p.etag)
                    .build())
            })
            .collect::<TransferResult<Vec<_>>>()?;

        let multipart_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        let response = self
            .client
            .complete_multipart_upload()
            .bucket(&key.bucket)
            .key(&key.key)
            .upload_id(upload_id)
            .multipart_upload(multipart_upload)
            .send()
            .await
            .map_err(TransferError::from)?;

        Ok(ObjectDescriptor {
            key: key.clone(),
            etag: response.e_tag().map(|s| s.to_string()),
            size: parts.iter().map(|p| p.size).sum(),
        })
    }

    async fn abort_session(&self, key: &ObjectKey, upload_id: &str) -> TransferResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&key.bucket)
            .key(&key.key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(TransferError::from)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_number_conversion() {
        assert_eq!(part_number(1).unwrap(), 1);
        assert!(part_number(u32::MAX).is_err());
    }

    #[test]
    fn test_to_chrono() {
        let dt = aws_sdk_s3::primitives::DateTime::from_secs(1_700_000_000);
        let converted = to_chrono(&dt).unwrap();
        assert_eq!(converted.timestamp(), 1_700_000_000);
    }
}
