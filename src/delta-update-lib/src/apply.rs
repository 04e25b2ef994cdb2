use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use log::*;
use std::fs::File;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::{
    is_checksum_match, read_at_blocking, remove_file_if_exists, write_at_blocking,
    AssetDescriptor, ChunkCompression, ChunkDescriptor, ChunkHasher, ChunkSource, ChunkTransport,
    SourceStreamType, SpeedLimiter, SpeedLimiterGuard, UpdateError, UpdateResult,
};

const OLD_COPY_BLOCK_SIZE: usize = 1024 * 1024;
const DOWNLOAD_BLOCK_SIZE: usize = 64 * 1024;
/// Upper bound of any buffer pre-sized from manifest fields.
const MAX_PREALLOC_SIZE: u64 = 16 * 1024 * 1024;

fn prealloc_len(expected: u64) -> usize {
    expected.min(MAX_PREALLOC_SIZE) as usize
}

#[derive(Debug, Clone)]
pub struct WriteProgress {
    pub stream_type: SourceStreamType,
    pub chunk_written: u64,
    pub chunk_size: u64,
    pub asset_written: u64,
    pub asset_size: u64,
}

#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub chunk_downloaded: u64,
    pub chunk_total: u64,
    pub asset_downloaded: u64,
}

pub type StreamOpenedCallback = Arc<dyn Fn(&ChunkDescriptor, SourceStreamType) + Send + Sync>;
pub type WriteProgressCallback = Arc<dyn Fn(&WriteProgress) + Send + Sync>;
pub type DownloadProgressCallback = Arc<dyn Fn(&DownloadProgress) + Send + Sync>;
pub type AssetCompleteCallback = Arc<dyn Fn(&AssetDescriptor) + Send + Sync>;

/// Observer slots of one update call. Every slot is optional.
#[derive(Clone, Default)]
pub struct UpdateCallbacks {
    pub stream_opened: Option<StreamOpenedCallback>,
    pub write_progress: Option<WriteProgressCallback>,
    pub download_progress: Option<DownloadProgressCallback>,
    pub asset_complete: Option<AssetCompleteCallback>,
}

impl UpdateCallbacks {
    pub fn with_stream_opened(
        mut self,
        callback: impl Fn(&ChunkDescriptor, SourceStreamType) + Send + Sync + 'static,
    ) -> Self {
        self.stream_opened = Some(Arc::new(callback));
        self
    }

    pub fn with_write_progress(
        mut self,
        callback: impl Fn(&WriteProgress) + Send + Sync + 'static,
    ) -> Self {
        self.write_progress = Some(Arc::new(callback));
        self
    }

    pub fn with_download_progress(
        mut self,
        callback: impl Fn(&DownloadProgress) + Send + Sync + 'static,
    ) -> Self {
        self.download_progress = Some(Arc::new(callback));
        self
    }

    pub fn with_asset_complete(
        mut self,
        callback: impl Fn(&AssetDescriptor) + Send + Sync + 'static,
    ) -> Self {
        self.asset_complete = Some(Arc::new(callback));
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkApplyOutcome {
    pub stream_type: SourceStreamType,
    pub bytes_written: u64,
    pub bytes_downloaded: u64,
}

/// 把一个chunk的数据写到输出文件的 target_offset 处
///
/// 输出文件句柄由 session 持有，所有并发的chunk共用同一个句柄，只使用带偏移的写入，
/// 不依赖共享的文件游标。
pub struct ChunkApplier<'a> {
    asset: &'a AssetDescriptor,
    old_file: Option<Arc<File>>,
    output: Arc<File>,
    transport: &'a dyn ChunkTransport,
    speed_limiter: Option<&'a dyn SpeedLimiter>,
    callbacks: &'a UpdateCallbacks,
    cancel: CancellationToken,
    asset_written: AtomicU64,
    asset_downloaded: AtomicU64,
}

impl<'a> ChunkApplier<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        asset: &'a AssetDescriptor,
        old_file: Option<Arc<File>>,
        output: Arc<File>,
        transport: &'a dyn ChunkTransport,
        speed_limiter: Option<&'a dyn SpeedLimiter>,
        callbacks: &'a UpdateCallbacks,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            asset,
            old_file,
            output,
            transport,
            speed_limiter,
            callbacks,
            cancel,
            asset_written: AtomicU64::new(0),
            asset_downloaded: AtomicU64::new(0),
        }
    }

    pub fn asset_written(&self) -> u64 {
        self.asset_written.load(Ordering::SeqCst)
    }

    pub fn asset_downloaded(&self) -> u64 {
        self.asset_downloaded.load(Ordering::SeqCst)
    }

    pub async fn apply_chunk(
        &self,
        source: &ChunkSource,
        chunk: &ChunkDescriptor,
    ) -> UpdateResult<ChunkApplyOutcome> {
        self.check_cancelled()?;
        let stream_type = source.stream_type();
        if let Some(callback) = &self.callbacks.stream_opened {
            callback(chunk, stream_type);
        }

        let (bytes_written, bytes_downloaded) = match source {
            ChunkSource::OldFileReference { offset, .. } => {
                (self.copy_from_old_file(chunk, *offset).await?, 0)
            }
            ChunkSource::CachedLocal {
                path,
                delete_on_close,
            } => (
                self.write_from_cached(chunk, path, *delete_on_close)
                    .await?,
                0,
            ),
            ChunkSource::Remote => self.write_from_remote(chunk).await?,
        };

        Ok(ChunkApplyOutcome {
            stream_type,
            bytes_written,
            bytes_downloaded,
        })
    }

    fn check_cancelled(&self) -> UpdateResult<()> {
        if self.cancel.is_cancelled() {
            return Err(UpdateError::Cancelled(format!(
                "update of {} is cancelled",
                self.asset.asset_name
            )));
        }
        Ok(())
    }

    /// Only for pure waits (network, throttle). Blocking file ops are never
    /// raced against the token so they always finish before the handle drops.
    async fn cancellable<T>(&self, fut: impl Future<Output = T>) -> UpdateResult<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(UpdateError::Cancelled(format!(
                "update of {} is cancelled",
                self.asset.asset_name
            ))),
            value = fut => Ok(value),
        }
    }

    async fn write_at(
        &self,
        chunk: &ChunkDescriptor,
        buf: Vec<u8>,
        chunk_pos: u64,
        stream_type: SourceStreamType,
    ) -> UpdateResult<()> {
        let len = buf.len() as u64;
        write_at_blocking(self.output.clone(), buf, chunk.target_offset + chunk_pos).await?;
        let asset_written = self.asset_written.fetch_add(len, Ordering::SeqCst) + len;
        if let Some(callback) = &self.callbacks.write_progress {
            callback(&WriteProgress {
                stream_type,
                chunk_written: chunk_pos + len,
                chunk_size: chunk.decompressed_size,
                asset_written,
                asset_size: self.asset.asset_size,
            });
        }
        Ok(())
    }

    async fn copy_from_old_file(
        &self,
        chunk: &ChunkDescriptor,
        old_offset: u64,
    ) -> UpdateResult<u64> {
        let old_file = self.old_file.clone().ok_or_else(|| {
            UpdateError::Internal(format!(
                "old file of {} is not opened",
                self.asset.asset_name
            ))
        })?;

        let mut pos = 0u64;
        while pos < chunk.decompressed_size {
            self.check_cancelled()?;
            let len = (chunk.decompressed_size - pos).min(OLD_COPY_BLOCK_SIZE as u64) as usize;
            let buf = read_at_blocking(old_file.clone(), len, old_offset + pos).await?;
            self.write_at(chunk, buf, pos, SourceStreamType::OldReference).await?;
            pos += len as u64;
        }
        Ok(pos)
    }

    async fn write_from_cached(
        &self,
        chunk: &ChunkDescriptor,
        path: &Path,
        delete_on_close: bool,
    ) -> UpdateResult<u64> {
        self.check_cancelled()?;
        let read_path = path.to_path_buf();
        let read_result = tokio::task::spawn_blocking(move || std::fs::read(&read_path))
            .await
            .map_err(|e| UpdateError::Internal(format!("read task failed: {}", e)))?
            .map_err(|e| {
                UpdateError::IoError(format!("read cached chunk {} failed: {}", path.display(), e))
            });
        if delete_on_close {
            if let Err(e) = remove_file_if_exists(path).await {
                warn!("delete cached chunk {} failed: {}", path.display(), e);
            }
        }
        let payload = read_result?;
        if payload.len() as u64 != chunk.compressed_size {
            return Err(UpdateError::VerifyError(format!(
                "cached chunk {} size changed: expect {} got {}",
                path.display(),
                chunk.compressed_size,
                payload.len()
            )));
        }

        let data = decode_payload(self.asset.compression, payload, chunk.decompressed_size).await?;
        self.check_cancelled()?;
        let len = data.len() as u64;
        self.write_at(chunk, data, 0, SourceStreamType::CachedLocal).await?;
        Ok(len)
    }

    async fn write_from_remote(&self, chunk: &ChunkDescriptor) -> UpdateResult<(u64, u64)> {
        let _limiter_guard = SpeedLimiterGuard::begin(self.speed_limiter);
        let (reader, content_length) = self
            .cancellable(self.transport.open_chunk(chunk))
            .await??;
        if let Some(content_length) = content_length {
            if content_length != chunk.compressed_size {
                return Err(UpdateError::VerifyError(format!(
                    "chunk {} remote length {} != expected {}",
                    chunk.chunk_name, content_length, chunk.compressed_size
                )));
            }
        }

        // 多读一个字节用于发现超长的响应
        let mut reader = reader.take(chunk.compressed_size.saturating_add(1));
        let mut hasher = ChunkHasher::new();
        let mut payload = Vec::with_capacity(prealloc_len(chunk.compressed_size));
        let mut buf = vec![0u8; DOWNLOAD_BLOCK_SIZE];
        loop {
            let n = self.cancellable(reader.read(&mut buf)).await?.map_err(|e| {
                UpdateError::RemoteError(format!("read chunk {} failed: {}", chunk.chunk_name, e))
            })?;
            if n == 0 {
                break;
            }
            hasher.update_from_bytes(&buf[..n]);
            payload.extend_from_slice(&buf[..n]);
            if let Some(limiter) = self.speed_limiter {
                self.cancellable(limiter.acquire(n as u64)).await?;
            }
            let asset_downloaded =
                self.asset_downloaded.fetch_add(n as u64, Ordering::SeqCst) + n as u64;
            if let Some(callback) = &self.callbacks.download_progress {
                callback(&DownloadProgress {
                    chunk_downloaded: payload.len() as u64,
                    chunk_total: chunk.compressed_size,
                    asset_downloaded,
                });
            }
        }
        drop(reader);

        let downloaded = payload.len() as u64;
        if downloaded != chunk.compressed_size {
            return Err(UpdateError::VerifyError(format!(
                "chunk {} downloaded {} bytes, expected {}",
                chunk.chunk_name, downloaded, chunk.compressed_size
            )));
        }
        let actual_hash = hasher.finish();
        if !is_checksum_match(&chunk.checksum, &actual_hash) {
            return Err(UpdateError::VerifyError(format!(
                "chunk {} checksum mismatch: expect {} got {}",
                chunk.chunk_name, chunk.checksum, actual_hash
            )));
        }

        let data = decode_payload(self.asset.compression, payload, chunk.decompressed_size).await?;
        self.check_cancelled()?;
        let written = data.len() as u64;
        self.write_at(chunk, data, 0, SourceStreamType::Internet).await?;
        Ok((written, downloaded))
    }
}

/// Decompress a chunk payload; the result must be exactly `expected_len` bytes.
pub async fn decode_payload(
    compression: ChunkCompression,
    payload: Vec<u8>,
    expected_len: u64,
) -> UpdateResult<Vec<u8>> {
    let data = match compression {
        ChunkCompression::None => payload,
        ChunkCompression::Zstd => {
            read_limited(ZstdDecoder::new(payload.as_slice()), expected_len).await?
        }
        ChunkCompression::Gzip => {
            read_limited(GzipDecoder::new(payload.as_slice()), expected_len).await?
        }
    };
    if data.len() as u64 != expected_len {
        return Err(UpdateError::DecodeError(format!(
            "decoded chunk is {} bytes, expected {}",
            data.len(),
            expected_len
        )));
    }
    Ok(data)
}

async fn read_limited<R: AsyncRead + Unpin>(
    decoder: R,
    expected_len: u64,
) -> UpdateResult<Vec<u8>> {
    let mut out = Vec::with_capacity(prealloc_len(expected_len));
    decoder
        .take(expected_len.saturating_add(1))
        .read_to_end(&mut out)
        .await
        .map_err(|e| UpdateError::DecodeError(format!("decompress chunk failed: {}", e)))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use std::sync::Mutex;

    fn open_output(path: &Path, len: u64) -> Arc<File> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .unwrap();
        file.set_len(len).unwrap();
        Arc::new(file)
    }

    #[tokio::test]
    async fn test_decode_payload() {
        let data = b"hello hello hello hello".to_vec();
        let zstd = zstd_compress(&data).await;
        assert_eq!(
            decode_payload(ChunkCompression::Zstd, zstd.clone(), data.len() as u64)
                .await
                .unwrap(),
            data
        );
        let gzip = gzip_compress(&data).await;
        assert_eq!(
            decode_payload(ChunkCompression::Gzip, gzip, data.len() as u64)
                .await
                .unwrap(),
            data
        );
        let err = decode_payload(ChunkCompression::Zstd, zstd, 5).await.unwrap_err();
        assert!(matches!(err, UpdateError::DecodeError(_)));
        let err = decode_payload(ChunkCompression::Zstd, b"not zstd".to_vec(), 8)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::DecodeError(_)));
    }

    #[tokio::test]
    async fn test_apply_remote_chunk_reports_progress() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let fixture = AssetFixture::build("a.bin", &[300], ChunkCompression::Zstd).await;
        let transport = MemoryTransport::from_fixture(&fixture);
        let callbacks_log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = callbacks_log.clone();
        let callbacks = UpdateCallbacks::default().with_download_progress(move |p| {
            log_clone.lock().unwrap().push(p.chunk_downloaded);
        });
        let output_path = dir.path().join("out.bin");
        let output = open_output(&output_path, fixture.asset.asset_size);
        let applier = ChunkApplier::new(
            &fixture.asset,
            None,
            output,
            &transport,
            None,
            &callbacks,
            CancellationToken::new(),
        );

        let chunk = &fixture.asset.chunks[0];
        let outcome = applier.apply_chunk(&ChunkSource::Remote, chunk).await.unwrap();
        assert_eq!(outcome.stream_type, SourceStreamType::Internet);
        assert_eq!(outcome.bytes_written, 300);
        assert_eq!(outcome.bytes_downloaded, chunk.compressed_size);
        assert_eq!(applier.asset_downloaded(), chunk.compressed_size);
        assert_eq!(
            callbacks_log.lock().unwrap().last().copied(),
            Some(chunk.compressed_size)
        );
        drop(applier);
        assert_eq!(std::fs::read(&output_path).unwrap(), fixture.content);
    }

    #[tokio::test]
    async fn test_apply_remote_checksum_mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut fixture = AssetFixture::build("a.bin", &[64], ChunkCompression::None).await;
        let transport = MemoryTransport::from_fixture(&fixture);
        fixture.asset.chunks[0].checksum = ChunkHasher::calc_from_bytes(b"other");
        let callbacks = UpdateCallbacks::default();
        let output = open_output(&dir.path().join("out.bin"), 64);
        let applier = ChunkApplier::new(
            &fixture.asset,
            None,
            output,
            &transport,
            None,
            &callbacks,
            CancellationToken::new(),
        );
        let err = applier
            .apply_chunk(&ChunkSource::Remote, &fixture.asset.chunks[0])
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::VerifyError(_)));
        assert_eq!(applier.asset_written(), 0);
    }

    #[tokio::test]
    async fn test_apply_cached_chunk_deletes_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = AssetFixture::build("a.bin", &[128], ChunkCompression::Gzip).await;
        let chunk = &fixture.asset.chunks[0];
        let staged = dir.path().join("staged");
        std::fs::write(&staged, &fixture.payloads[0]).unwrap();

        let transport = MemoryTransport::default();
        let callbacks = UpdateCallbacks::default();
        let output_path = dir.path().join("out.bin");
        let output = open_output(&output_path, 128);
        let applier = ChunkApplier::new(
            &fixture.asset,
            None,
            output,
            &transport,
            None,
            &callbacks,
            CancellationToken::new(),
        );
        let source = ChunkSource::CachedLocal {
            path: staged.clone(),
            delete_on_close: true,
        };
        let outcome = applier.apply_chunk(&source, chunk).await.unwrap();
        assert_eq!(outcome.stream_type, SourceStreamType::CachedLocal);
        assert_eq!(outcome.bytes_downloaded, 0);
        assert!(!staged.exists());
        assert_eq!(transport.request_count(), 0);
        drop(applier);
        assert_eq!(std::fs::read(&output_path).unwrap(), fixture.content);
    }

    #[tokio::test]
    async fn test_apply_old_reference_copies_range() {
        let dir = tempfile::tempdir().unwrap();
        let old_path = dir.path().join("old.bin");
        let old_content: Vec<u8> = (0..=255u8).cycle().take(OLD_COPY_BLOCK_SIZE + 100).collect();
        std::fs::write(&old_path, &old_content).unwrap();
        let old_file = Arc::new(File::open(&old_path).unwrap());

        let size = OLD_COPY_BLOCK_SIZE as u64 + 50;
        let mut asset = AssetDescriptor::new("a.bin", size, "00");
        let chunk = ChunkDescriptor::new("c0", 0, 1, size, "aa").with_old_offset(50);
        asset.push_chunk(chunk.clone());

        let transport = MemoryTransport::default();
        let callbacks = UpdateCallbacks::default();
        let output_path = dir.path().join("out.bin");
        let output = open_output(&output_path, size);
        let applier = ChunkApplier::new(
            &asset,
            Some(old_file),
            output,
            &transport,
            None,
            &callbacks,
            CancellationToken::new(),
        );
        let source = ChunkSource::OldFileReference {
            path: old_path.clone(),
            offset: 50,
        };
        let outcome = applier.apply_chunk(&source, &chunk).await.unwrap();
        assert_eq!(outcome.bytes_written, size);
        drop(applier);
        assert_eq!(std::fs::read(&output_path).unwrap(), &old_content[50..]);
    }

    #[tokio::test]
    async fn test_apply_observes_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = AssetFixture::build("a.bin", &[32], ChunkCompression::None).await;
        let transport = MemoryTransport::from_fixture(&fixture);
        let callbacks = UpdateCallbacks::default();
        let output = open_output(&dir.path().join("out.bin"), 32);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let applier = ChunkApplier::new(
            &fixture.asset,
            None,
            output,
            &transport,
            None,
            &callbacks,
            cancel,
        );
        let err = applier
            .apply_chunk(&ChunkSource::Remote, &fixture.asset.chunks[0])
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_manifest_sizes_fail_the_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = AssetFixture::build("a.bin", &[64], ChunkCompression::Zstd).await;
        let mut asset = fixture.asset.clone();
        asset.chunks[0].compressed_size = u64::MAX / 2;
        let transport = MemoryTransport::from_fixture(&fixture).without_content_length();
        let callbacks = UpdateCallbacks::default();
        let output = open_output(&dir.path().join("out.bin"), 64);
        let applier = ChunkApplier::new(
            &asset,
            None,
            output,
            &transport,
            None,
            &callbacks,
            CancellationToken::new(),
        );
        let err = applier
            .apply_chunk(&ChunkSource::Remote, &asset.chunks[0])
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::VerifyError(_)));

        let err = decode_payload(ChunkCompression::Zstd, fixture.payloads[0].clone(), u64::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::DecodeError(_)));
    }
}
