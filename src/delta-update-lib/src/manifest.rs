use log::*;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

use crate::{ChunkCompression, HttpChunkTransport, UpdateError, UpdateResult};

pub const DEFAULT_MATCHING_FIELD: &str = "game";

/// The branch api sends sizes and counts either as numbers or as strings.
fn de_lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        String(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::String(s) if s.trim().is_empty() => Ok(0),
        NumberOrString::String(s) => s.trim().parse::<u64>().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestBuildBranch {
    #[serde(default)]
    pub retcode: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<ManifestBuildData>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestBuildData {
    #[serde(default)]
    pub build_id: String,
    #[serde(default)]
    pub tag: String,
    #[serde(rename = "manifests", default)]
    pub manifest_identity_list: Vec<ManifestIdentity>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestIdentity {
    #[serde(default, deserialize_with = "de_lenient_u64")]
    pub category_id: u64,
    #[serde(default)]
    pub category_name: String,
    #[serde(default)]
    pub matching_field: String,
    #[serde(rename = "manifest", default)]
    pub manifest_file_info: Option<ManifestFileInfo>,
    #[serde(rename = "chunk_download", default)]
    pub chunks_url_info: Option<ManifestUrlInfo>,
    #[serde(rename = "manifest_download", default)]
    pub manifest_url_info: Option<ManifestUrlInfo>,
    #[serde(rename = "stats", default)]
    pub chunk_info: Option<ManifestChunkInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFileInfo {
    #[serde(rename = "id", default)]
    pub file_name: String,
    #[serde(default)]
    pub checksum: String,
    #[serde(default, deserialize_with = "de_lenient_u64")]
    pub compressed_size: u64,
    #[serde(default, deserialize_with = "de_lenient_u64")]
    pub uncompressed_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestUrlInfo {
    #[serde(default)]
    pub url_prefix: String,
    #[serde(default)]
    pub url_suffix: String,
    #[serde(default, deserialize_with = "de_lenient_u64")]
    pub compression: u64,
}

impl ManifestUrlInfo {
    pub fn is_compressed(&self) -> bool {
        self.compression != 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestChunkInfo {
    #[serde(default, deserialize_with = "de_lenient_u64")]
    pub compressed_size: u64,
    #[serde(default, deserialize_with = "de_lenient_u64")]
    pub uncompressed_size: u64,
    #[serde(default, deserialize_with = "de_lenient_u64")]
    pub file_count: u64,
    #[serde(default, deserialize_with = "de_lenient_u64")]
    pub chunk_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunksInfo {
    pub chunks_base_url: String,
    pub chunk_count: u64,
    pub file_count: u64,
    pub is_use_compression: bool,
    pub total_size: u64,
    pub total_compressed_size: u64,
}

impl ChunksInfo {
    pub fn compression(&self) -> ChunkCompression {
        if self.is_use_compression {
            ChunkCompression::Zstd
        } else {
            ChunkCompression::None
        }
    }

    /// Transport fetching chunks of this branch from its CDN prefix.
    pub fn chunk_transport(&self, timeout: Duration) -> UpdateResult<HttpChunkTransport> {
        HttpChunkTransport::with_timeout(&self.chunks_base_url, timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestInfo {
    pub manifest_base_url: String,
    pub manifest_checksum: String,
    pub manifest_id: String,
    pub is_use_compression: bool,
    pub manifest_size: u64,
    pub manifest_compressed_size: u64,
}

impl ManifestInfo {
    pub fn manifest_url(&self) -> String {
        format!(
            "{}/{}",
            self.manifest_base_url.trim_end_matches('/'),
            self.manifest_id
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct ManifestInfoPair {
    pub is_found: bool,
    pub return_code: i32,
    pub return_message: String,
    pub chunks_info: Option<ChunksInfo>,
    pub manifest_info: Option<ManifestInfo>,
    pub build_data: Option<ManifestBuildData>,
}

pub async fn get_branch_info(client: &Client, url: &str) -> UpdateResult<ManifestBuildBranch> {
    debug!("get manifest branch info from {}", url);
    let res = client
        .get(url)
        .send()
        .await
        .map_err(|e| UpdateError::RemoteError(format!("Request failed: {}", e)))?;

    if !res.status().is_success() {
        return Err(UpdateError::from_http_status(res.status(), url.to_string()));
    }

    res.json::<ManifestBuildBranch>()
        .await
        .map_err(|e| UpdateError::DecodeError(format!("parse branch info from {} failed: {}", url, e)))
}

/// Pick the manifest identity with `matching_field` (default "game") out of a branch.
pub async fn create_manifest_info_pair(
    client: &Client,
    url: &str,
    matching_field: Option<&str>,
) -> UpdateResult<ManifestInfoPair> {
    let branch = get_branch_info(client, url).await?;
    let data = match branch.data {
        Some(data) => data,
        None => {
            warn!(
                "branch {} has no build data, retcode: {}, message: {}",
                url, branch.retcode, branch.message
            );
            return Ok(ManifestInfoPair {
                is_found: false,
                return_code: branch.retcode,
                return_message: branch.message,
                ..Default::default()
            });
        }
    };

    let matching_field = match matching_field {
        Some(field) if !field.is_empty() => field,
        _ => DEFAULT_MATCHING_FIELD,
    };
    let identity = data
        .manifest_identity_list
        .iter()
        .find(|identity| identity.matching_field == matching_field)
        .ok_or_else(|| {
            UpdateError::NotFound(format!(
                "manifest with matching field: {} is not found!",
                matching_field
            ))
        })?;

    let chunks_info = match (&identity.chunk_info, &identity.chunks_url_info) {
        (Some(stats), Some(url_info)) => Some(ChunksInfo {
            chunks_base_url: url_info.url_prefix.clone(),
            chunk_count: stats.chunk_count,
            file_count: stats.file_count,
            is_use_compression: url_info.is_compressed(),
            total_size: stats.uncompressed_size,
            total_compressed_size: stats.compressed_size,
        }),
        _ => None,
    };
    let manifest_info = match (&identity.manifest_file_info, &identity.manifest_url_info) {
        (Some(file_info), Some(url_info)) => Some(ManifestInfo {
            manifest_base_url: url_info.url_prefix.clone(),
            manifest_checksum: file_info.checksum.clone(),
            manifest_id: file_info.file_name.clone(),
            is_use_compression: url_info.is_compressed(),
            manifest_size: file_info.uncompressed_size,
            manifest_compressed_size: file_info.compressed_size,
        }),
        _ => None,
    };

    Ok(ManifestInfoPair {
        is_found: true,
        return_code: branch.retcode,
        return_message: branch.message,
        chunks_info,
        manifest_info,
        build_data: Some(data),
    })
}
