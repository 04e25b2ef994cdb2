use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{UpdateError, UpdateResult};

const HASH_READ_BUFFER: usize = 64 * 1024;
const STAGING_NAME_LEN: usize = 32;

pub struct ChunkHasher {
    hasher: Sha256,
    pos: u64,
}

impl ChunkHasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            pos: 0,
        }
    }

    pub fn update_from_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.pos += bytes.len() as u64;
    }

    /// lowercase hex
    pub fn finish(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }

    pub fn calc_from_bytes(bytes: &[u8]) -> String {
        let mut hasher = Self::new();
        hasher.update_from_bytes(bytes);
        hasher.finish()
    }

    pub async fn calc_from_reader<T: AsyncRead + Unpin>(
        mut self,
        reader: &mut T,
    ) -> UpdateResult<(String, u64)> {
        let mut buffer = vec![0u8; HASH_READ_BUFFER];
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            self.update_from_bytes(&buffer[..n]);
        }
        let len = self.pos;
        Ok((self.finish(), len))
    }

    pub async fn calc_from_file(path: &Path) -> UpdateResult<(String, u64)> {
        let mut file = tokio::fs::File::open(path).await.map_err(|e| {
            UpdateError::IoError(format!("open {} for hashing failed: {}", path.display(), e))
        })?;
        Self::new().calc_from_reader(&mut file).await
    }
}

impl Default for ChunkHasher {
    fn default() -> Self {
        Self::new()
    }
}

pub fn is_checksum_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual)
}

/// 缓存chunk的文件名只由 (asset_name, chunk checksum) 决定
pub fn chunk_staging_name(asset_name: &str, chunk_checksum: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(asset_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(chunk_checksum.to_ascii_lowercase().as_bytes());
    let mut name = format!("{:x}", hasher.finalize());
    name.truncate(STAGING_NAME_LEN);
    name
}
