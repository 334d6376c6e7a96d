//! Object storage adapter: streamed artifact download and resumable
//! multipart upload.

use crate::{
    coordination::CoordinationClient,
    errors::ContributeError,
    status::{StatusSink, StatusUpdate},
};
use anyhow::Result;
use async_trait::async_trait;
use phase2_shared::structures::{EtagWithPartNumber, TempContributionData};
use reqwest::header::{CONTENT_LENGTH, ETAG};
use std::sync::Arc;
use tracing::{debug, info};

/// Part size for multipart uploads.
const UPLOAD_PART_SIZE: usize = 50 * 1024 * 1024;
/// Bytes downloaded between two progress reports.
const DOWNLOAD_PROGRESS_STRIDE: usize = 8 * 1024 * 1024;

#[async_trait]
pub trait StorageOps: Send + Sync {
    /// Streams an artifact into memory, reporting periodic progress.
    /// Retriable whole-file on transport failure.
    async fn download_artifact(&self, bucket: &str, key: &str, sink: &dyn StatusSink) -> Result<Vec<u8>>;

    /// Uploads `bytes` in fixed-size parts. Parts already acknowledged in
    /// `temp` are skipped; every newly uploaded part is acknowledged
    /// through the coordinator before the next one starts, so a later
    /// resumption picks up where this one stopped.
    async fn multipart_upload(
        &self,
        ceremony_id: &str,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        sink: &dyn StatusSink,
        temp: Option<&TempContributionData>,
    ) -> Result<()>;
}

/// Splits an artifact into upload parts of at most `part_size` bytes.
pub fn split_into_parts(bytes: &[u8], part_size: usize) -> Vec<&[u8]> {
    bytes.chunks(part_size.max(1)).collect()
}

/// First part number (1-based) not yet acknowledged. Parts are uploaded
/// and acknowledged strictly in order, so the highest acknowledged
/// number tells us where to pick up.
pub fn first_unacknowledged_part(acknowledged: &[EtagWithPartNumber]) -> u32 {
    acknowledged.iter().map(|chunk| chunk.part_number).max().unwrap_or(0) + 1
}

/// Talks to object storage through presigned URLs handed out by the
/// coordinator.
pub struct StorageClient {
    coordinator: Arc<dyn CoordinationClient>,
    http: reqwest::Client,
    part_size: usize,
}

impl StorageClient {
    pub fn new(coordinator: Arc<dyn CoordinationClient>) -> Self {
        Self {
            coordinator,
            http: reqwest::Client::new(),
            part_size: UPLOAD_PART_SIZE,
        }
    }
}

#[async_trait]
impl StorageOps for StorageClient {
    async fn download_artifact(&self, bucket: &str, key: &str, sink: &dyn StatusSink) -> Result<Vec<u8>> {
        let url = self.coordinator.generate_get_object_pre_signed_url(bucket, key).await?;
        let mut response = self.http.get(url).send().await?.error_for_status()?;
        let total = response.content_length();
        let mut artifact = Vec::new();
        let mut reported = 0;
        while let Some(chunk) = response.chunk().await? {
            artifact.extend_from_slice(&chunk);
            if artifact.len() - reported >= DOWNLOAD_PROGRESS_STRIDE {
                reported = artifact.len();
                let progress = match total {
                    Some(total) => format!("{} / {} bytes", artifact.len(), total),
                    None => format!("{} bytes", artifact.len()),
                };
                sink.report(StatusUpdate::busy(format!("Downloading {} ({})", key, progress)));
            }
        }
        info!("Downloaded {} ({} bytes)", key, artifact.len());
        Ok(artifact)
    }

    async fn multipart_upload(
        &self,
        ceremony_id: &str,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        sink: &dyn StatusSink,
        temp: Option<&TempContributionData>,
    ) -> Result<()> {
        let upload_id = match temp {
            Some(temp) if !temp.upload_id.is_empty() => temp.upload_id.clone(),
            _ => self.coordinator.open_multipart_upload(ceremony_id, bucket, key).await?,
        };
        let mut acknowledged: Vec<EtagWithPartNumber> = temp.map(|temp| temp.chunks.clone()).unwrap_or_default();
        acknowledged.sort_by_key(|chunk| chunk.part_number);
        let resume_from = first_unacknowledged_part(&acknowledged);

        let parts = split_into_parts(bytes, self.part_size);
        let urls = self
            .coordinator
            .generate_pre_signed_urls_parts(ceremony_id, bucket, key, &upload_id, parts.len())
            .await?;
        if urls.len() != parts.len() {
            return Err(ContributeError::PresignedUrlCountError(urls.len(), parts.len()).into());
        }

        for (index, part) in parts.iter().enumerate() {
            let part_number = index as u32 + 1;
            if part_number < resume_from {
                debug!("Skipping already acknowledged part {}", part_number);
                continue;
            }
            let response = self
                .http
                .put(urls[index].as_str())
                .header(CONTENT_LENGTH, part.len())
                .body(part.to_vec())
                .send()
                .await?
                .error_for_status()?;
            let etag = response
                .headers()
                .get(ETAG)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.to_string())
                .ok_or(ContributeError::MissingEtagError(part_number))?;
            let chunk = EtagWithPartNumber { etag, part_number };
            self.coordinator
                .temporarily_store_uploaded_chunk(ceremony_id, chunk.clone())
                .await?;
            acknowledged.push(chunk);
            sink.report(StatusUpdate::busy(format!(
                "Uploaded part {} of {}",
                part_number,
                parts.len()
            )));
        }

        self.coordinator
            .complete_multipart_upload(ceremony_id, bucket, key, &upload_id, &acknowledged)
            .await?;
        info!("Completed multipart upload of {} ({} parts)", key, parts.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(part_number: u32, etag: &str) -> EtagWithPartNumber {
        EtagWithPartNumber {
            etag: etag.to_string(),
            part_number,
        }
    }

    #[test]
    fn splits_preserve_all_bytes_in_order() {
        let bytes: Vec<u8> = (0u8..=255).collect();
        let parts = split_into_parts(&bytes, 100);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 100);
        assert_eq!(parts[2].len(), 56);
        let rejoined: Vec<u8> = parts.concat();
        assert_eq!(rejoined, bytes);
    }

    #[test]
    fn split_of_exact_multiple_has_no_empty_tail() {
        let bytes = vec![7u8; 200];
        let parts = split_into_parts(&bytes, 100);
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|part| part.len() == 100));
    }

    #[test]
    fn resume_starts_after_the_highest_acknowledged_part() {
        assert_eq!(first_unacknowledged_part(&[]), 1);
        assert_eq!(first_unacknowledged_part(&[chunk(1, "a")]), 2);
        assert_eq!(first_unacknowledged_part(&[chunk(1, "a"), chunk(2, "b")]), 3);
        // Out-of-order acknowledgements still resolve to the right part.
        assert_eq!(first_unacknowledged_part(&[chunk(2, "b"), chunk(1, "a")]), 3);
    }
}
