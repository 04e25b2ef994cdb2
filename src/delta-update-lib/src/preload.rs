use log::*;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::{
    default_parallel_chunks, file_len_async, AssetDescriptor, ChunkCache, ChunkDescriptor,
    UpdateError, UpdateResult,
};

pub const PRELOAD_PARALLEL_THRESHOLD: usize = 512;

/// Counts bytes of an asset that are already staged in the chunk dir.
#[derive(Debug, Clone)]
pub struct PreloadSizeCalculator {
    parallel_threshold: usize,
    workers: usize,
}

impl Default for PreloadSizeCalculator {
    fn default() -> Self {
        Self::new(PRELOAD_PARALLEL_THRESHOLD)
    }
}

impl PreloadSizeCalculator {
    pub fn new(parallel_threshold: usize) -> Self {
        Self {
            parallel_threshold,
            workers: default_parallel_chunks(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub async fn preloaded_bytes(
        &self,
        asset: &AssetDescriptor,
        chunk_dir: &Path,
        output_dir: &Path,
        use_compressed_size: bool,
        cancel: &CancellationToken,
    ) -> UpdateResult<u64> {
        check_cancelled(asset, cancel)?;
        if asset.chunks.is_empty() {
            return Ok(0);
        }

        let final_path = output_dir.join(&asset.asset_name);
        let asset_complete = file_len_async(&final_path).await == Some(asset.asset_size);
        let cache = ChunkCache::new(chunk_dir);

        // small lists are walked by a single blocking task
        let workers = if asset.chunks.len() < self.parallel_threshold {
            1
        } else {
            self.workers
        };
        sum_on_blocking_pool(asset, cache, asset_complete, use_compressed_size, workers, cancel)
            .await
    }
}

/// Fans the lookups over blocking workers into a dense buffer, then reduces it.
async fn sum_on_blocking_pool(
    asset: &AssetDescriptor,
    cache: ChunkCache,
    asset_complete: bool,
    use_compressed_size: bool,
    workers: usize,
    cancel: &CancellationToken,
) -> UpdateResult<u64> {
    let chunk_count = asset.chunks.len();
    let workers = workers.min(chunk_count).max(1);
    let part_len = chunk_count.div_ceil(workers);
    debug!(
        "sum preloaded size of {} ({} chunks) with {} workers",
        asset.asset_name, chunk_count, workers
    );

    let shared_asset = Arc::new(asset.clone());
    let mut handles = Vec::with_capacity(workers);
    for start in (0..chunk_count).step_by(part_len) {
        let end = (start + part_len).min(chunk_count);
        let asset = shared_asset.clone();
        let cache = cache.clone();
        let cancel = cancel.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let mut sizes = Vec::with_capacity(end - start);
            for chunk in asset.chunks[start..end].iter() {
                if cancel.is_cancelled() {
                    return None;
                }
                sizes.push(chunk_contribution(
                    &cache,
                    &asset,
                    chunk,
                    asset_complete,
                    use_compressed_size,
                ));
            }
            Some((start, sizes))
        }));
    }

    let mut dense = vec![0u64; chunk_count];
    let mut cancelled = false;
    for handle in handles {
        let part = handle
            .await
            .map_err(|e| UpdateError::Internal(format!("preload size task failed: {}", e)))?;
        match part {
            Some((start, sizes)) => {
                dense[start..start + sizes.len()].copy_from_slice(&sizes);
            }
            None => cancelled = true,
        }
    }
    if cancelled {
        check_cancelled(asset, cancel)?;
    }
    Ok(dense.iter().sum())
}

pub async fn preloaded_bytes(
    asset: &AssetDescriptor,
    chunk_dir: &Path,
    output_dir: &Path,
    use_compressed_size: bool,
    cancel: &CancellationToken,
) -> UpdateResult<u64> {
    PreloadSizeCalculator::default()
        .preloaded_bytes(asset, chunk_dir, output_dir, use_compressed_size, cancel)
        .await
}

fn chunk_contribution(
    cache: &ChunkCache,
    asset: &AssetDescriptor,
    chunk: &ChunkDescriptor,
    asset_complete: bool,
    use_compressed_size: bool,
) -> u64 {
    let staged_len = cache.staged_len(&asset.asset_name, chunk);
    // already materialized and the staged copy was consumed
    if asset_complete && staged_len.is_none() {
        return 0;
    }
    match staged_len {
        Some(len) if len <= chunk.compressed_size => {
            if use_compressed_size {
                chunk.compressed_size
            } else {
                chunk.decompressed_size
            }
        }
        _ => 0,
    }
}

fn check_cancelled(asset: &AssetDescriptor, cancel: &CancellationToken) -> UpdateResult<()> {
    if cancel.is_cancelled() {
        return Err(UpdateError::Cancelled(format!(
            "preload size of {} is cancelled",
            asset.asset_name
        )));
    }
    Ok(())
}
