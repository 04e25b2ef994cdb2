use log::*;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::{file_len, unassign_readonly, CachedChunkState, ChunkCache, ChunkDescriptor, UpdateResult};

/// Tag passed to observers so reuse can be told apart from download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceStreamType {
    Internet,
    CachedLocal,
    OldReference,
}

impl fmt::Display for SourceStreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceStreamType::Internet => "internet",
            SourceStreamType::CachedLocal => "cached",
            SourceStreamType::OldReference => "old",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkSource {
    OldFileReference { path: PathBuf, offset: u64 },
    CachedLocal { path: PathBuf, delete_on_close: bool },
    Remote,
}

impl ChunkSource {
    pub fn stream_type(&self) -> SourceStreamType {
        match self {
            ChunkSource::OldFileReference { .. } => SourceStreamType::OldReference,
            ChunkSource::CachedLocal { .. } => SourceStreamType::CachedLocal,
            ChunkSource::Remote => SourceStreamType::Internet,
        }
    }
}

/// Snapshot of the old asset taken once per update session.
#[derive(Debug, Clone)]
pub struct OldFileInfo {
    pub path: PathBuf,
    pub len: Option<u64>,
}

impl OldFileInfo {
    pub fn probe(path: &Path) -> Self {
        unassign_readonly(path);
        Self {
            path: path.to_path_buf(),
            len: file_len(path),
        }
    }

    pub fn exists(&self) -> bool {
        self.len.is_some()
    }

    /// Offset check only, the bytes are trusted as certified by the manifest diff.
    pub fn reusable_offset(&self, chunk: &ChunkDescriptor) -> Option<u64> {
        let old_len = self.len?;
        let offset = chunk.old_offset()?;
        let end = offset.checked_add(chunk.decompressed_size)?;
        if old_len >= end {
            Some(offset)
        } else {
            None
        }
    }
}

/// 决定一个chunk的数据来源: 旧文件 > 预下载缓存 > 网络
pub async fn resolve_chunk_source(
    asset_name: &str,
    chunk: &ChunkDescriptor,
    old_file: &OldFileInfo,
    cache: &ChunkCache,
    remove_chunk_after_apply: bool,
) -> UpdateResult<ChunkSource> {
    if let Some(offset) = old_file.reusable_offset(chunk) {
        debug!(
            "Using old file as reference at offset: 0x{:08x} -> 0x{:08x} for: {}",
            offset, chunk.decompressed_size, asset_name
        );
        return Ok(ChunkSource::OldFileReference {
            path: old_file.path.clone(),
            offset,
        });
    }

    match cache.check_chunk(asset_name, chunk).await? {
        CachedChunkState::Missing => Ok(ChunkSource::Remote),
        CachedChunkState::Corrupt(_, len) => {
            warn!(
                "Cached chunk has invalid size for: {}. Expecting: 0x{:08x} but get: 0x{:08x} instead. Fallback to download it instead!",
                asset_name, chunk.compressed_size, len
            );
            cache.remove_chunk(asset_name, chunk).await?;
            Ok(ChunkSource::Remote)
        }
        CachedChunkState::Valid(path) => {
            // marker只说明上一次预下载校验通过，被消费后就不再有意义
            cache.remove_marker(asset_name, chunk).await?;
            debug!(
                "Using cached chunk as reference at offset: 0x{:08x} -> 0x{:08x} for: {}",
                chunk.target_offset, chunk.decompressed_size, asset_name
            );
            Ok(ChunkSource::CachedLocal {
                path,
                delete_on_close: remove_chunk_after_apply,
            })
        }
    }
}
