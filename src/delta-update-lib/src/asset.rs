use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path};

use crate::{UpdateError, UpdateResult};

/// `old_offset` sentinel: the chunk has no equivalent bytes in the old asset.
pub const OLD_OFFSET_NONE: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkCompression {
    None,
    Zstd,
    Gzip,
}

impl Default for ChunkCompression {
    fn default() -> Self {
        ChunkCompression::Zstd
    }
}

/// One contiguous byte range of the final asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    /// remote object name, used to build the chunk url
    pub chunk_name: String,
    pub target_offset: u64,
    pub compressed_size: u64,
    pub decompressed_size: u64,
    #[serde(default = "default_old_offset")]
    pub old_offset: i64,
    /// hex sha256 of the payload as stored remotely (compressed bytes)
    pub checksum: String,
}

fn default_old_offset() -> i64 {
    OLD_OFFSET_NONE
}

impl ChunkDescriptor {
    pub fn new(
        chunk_name: &str,
        target_offset: u64,
        compressed_size: u64,
        decompressed_size: u64,
        checksum: &str,
    ) -> Self {
        Self {
            chunk_name: chunk_name.to_string(),
            target_offset,
            compressed_size,
            decompressed_size,
            old_offset: OLD_OFFSET_NONE,
            checksum: checksum.to_string(),
        }
    }

    pub fn with_old_offset(mut self, old_offset: u64) -> Self {
        self.old_offset = old_offset as i64;
        self
    }

    /// `None` when the chunk cannot be copied from the old asset.
    pub fn old_offset(&self) -> Option<u64> {
        if self.old_offset < 0 {
            None
        } else {
            Some(self.old_offset as u64)
        }
    }

    pub fn target_end(&self) -> Option<u64> {
        self.target_offset.checked_add(self.decompressed_size)
    }
}

/// 一个需要被还原的目标文件，由manifest加载后只读
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub asset_name: String,
    pub asset_size: u64,
    /// hex sha256 of the whole final file
    pub asset_hash: String,
    #[serde(default)]
    pub compression: ChunkCompression,
    pub chunks: Vec<ChunkDescriptor>,
}

impl AssetDescriptor {
    pub fn new(asset_name: &str, asset_size: u64, asset_hash: &str) -> Self {
        Self {
            asset_name: asset_name.to_string(),
            asset_size,
            asset_hash: asset_hash.to_string(),
            compression: ChunkCompression::default(),
            chunks: Vec::new(),
        }
    }

    pub fn with_compression(mut self, compression: ChunkCompression) -> Self {
        self.compression = compression;
        self
    }

    pub fn push_chunk(&mut self, chunk: ChunkDescriptor) {
        self.chunks.push(chunk);
    }

    pub fn total_compressed_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.compressed_size).sum()
    }

    /// Chunks in manifest order, a chunk repeated with the same target applied once.
    pub fn unique_chunks(&self) -> Vec<&ChunkDescriptor> {
        let mut unique: Vec<&ChunkDescriptor> = Vec::with_capacity(self.chunks.len());
        let mut seen = HashSet::with_capacity(self.chunks.len());
        for chunk in self.chunks.iter() {
            if seen.insert((chunk.target_offset, chunk.decompressed_size, chunk.checksum.as_str())) {
                unique.push(chunk);
            }
        }
        unique
    }

    /// Chunk list must be non-empty and in bounds. Ranges may only overlap
    /// when both chunks describe the same target.
    pub fn validate(&self) -> UpdateResult<()> {
        validate_asset_name(&self.asset_name)?;

        if self.chunks.is_empty() {
            return Err(UpdateError::InvalidParam(format!(
                "asset {} has no chunk",
                self.asset_name
            )));
        }

        let mut ranges = Vec::with_capacity(self.chunks.len());
        for chunk in self.chunks.iter() {
            let end = chunk.target_end().ok_or_else(|| {
                UpdateError::InvalidParam(format!(
                    "chunk {} range overflow at offset {}",
                    chunk.chunk_name, chunk.target_offset
                ))
            })?;
            if end > self.asset_size {
                return Err(UpdateError::InvalidParam(format!(
                    "chunk {} ends at {} beyond asset {} size {}",
                    chunk.chunk_name, end, self.asset_name, self.asset_size
                )));
            }
            if chunk.checksum.is_empty() {
                return Err(UpdateError::InvalidParam(format!(
                    "chunk {} has empty checksum",
                    chunk.chunk_name
                )));
            }
            ranges.push((chunk.target_offset, end, chunk.checksum.as_str()));
        }

        ranges.sort_unstable();
        ranges.dedup();
        for pair in ranges.windows(2) {
            if pair[1].0 < pair[0].1 {
                return Err(UpdateError::InvalidParam(format!(
                    "asset {} has overlapping chunks at offset {}",
                    self.asset_name, pair[1].0
                )));
            }
        }
        Ok(())
    }
}

/// asset_name 会被拼接到输出目录下，不允许跳出目录
pub fn validate_asset_name(asset_name: &str) -> UpdateResult<()> {
    if asset_name.is_empty() {
        return Err(UpdateError::InvalidParam("empty asset name".to_string()));
    }
    let all_normal = Path::new(asset_name)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !all_normal {
        return Err(UpdateError::InvalidParam(format!(
            "asset name {} must be a relative path",
            asset_name
        )));
    }
    Ok(())
}
