use log::*;
use std::path::{Path, PathBuf};

use crate::{
    append_path_suffix, chunk_staging_name, file_len, remove_file_if_exists, unassign_readonly,
    ChunkDescriptor, UpdateError, UpdateResult,
};

pub const VERIFIED_MARKER_SUFFIX: &str = ".verified";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedChunkState {
    Missing,
    Valid(PathBuf),
    /// staged file exists but its size differs from compressed_size
    Corrupt(PathBuf, u64),
}

/// 预下载(preload)阶段写入的chunk缓存目录。这里只负责查找、校验大小和删除，不负责写入
#[derive(Debug, Clone)]
pub struct ChunkCache {
    chunk_dir: PathBuf,
}

impl ChunkCache {
    pub fn new(chunk_dir: impl Into<PathBuf>) -> Self {
        Self {
            chunk_dir: chunk_dir.into(),
        }
    }

    pub fn chunk_dir(&self) -> &Path {
        &self.chunk_dir
    }

    pub fn staging_path(&self, asset_name: &str, chunk: &ChunkDescriptor) -> PathBuf {
        self.chunk_dir.join(chunk_staging_name(asset_name, &chunk.checksum))
    }

    pub fn marker_path(&self, asset_name: &str, chunk: &ChunkDescriptor) -> PathBuf {
        append_path_suffix(&self.staging_path(asset_name, chunk), VERIFIED_MARKER_SUFFIX)
    }

    pub fn staged_len(&self, asset_name: &str, chunk: &ChunkDescriptor) -> Option<u64> {
        file_len(&self.staging_path(asset_name, chunk))
    }

    pub fn is_marked_verified(&self, asset_name: &str, chunk: &ChunkDescriptor) -> bool {
        self.marker_path(asset_name, chunk).is_file()
    }

    /// Size check of the staged copy, run on the blocking pool.
    pub async fn check_chunk(
        &self,
        asset_name: &str,
        chunk: &ChunkDescriptor,
    ) -> UpdateResult<CachedChunkState> {
        let path = self.staging_path(asset_name, chunk);
        let expected = chunk.compressed_size;
        tokio::task::spawn_blocking(move || {
            unassign_readonly(&path);
            match file_len(&path) {
                None => CachedChunkState::Missing,
                Some(len) if len == expected => CachedChunkState::Valid(path),
                Some(len) => CachedChunkState::Corrupt(path, len),
            }
        })
        .await
        .map_err(|e| UpdateError::Internal(format!("check cached chunk task failed: {}", e)))
    }

    pub async fn remove_marker(&self, asset_name: &str, chunk: &ChunkDescriptor) -> UpdateResult<bool> {
        remove_file_if_exists(&self.marker_path(asset_name, chunk)).await
    }

    /// Drop a staged chunk together with its marker.
    pub async fn remove_chunk(&self, asset_name: &str, chunk: &ChunkDescriptor) -> UpdateResult<()> {
        let path = self.staging_path(asset_name, chunk);
        if remove_file_if_exists(&path).await? {
            debug!("removed staged chunk {} for {}", path.display(), asset_name);
        }
        self.remove_marker(asset_name, chunk).await?;
        Ok(())
    }
}
