use futures::stream::{self, StreamExt};
use log::*;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{
    append_path_suffix, ensure_dir_exists, file_len, file_len_async, is_checksum_match,
    resolve_chunk_source, unassign_readonly, AssetDescriptor, ChunkApplier, ChunkCache,
    ChunkDescriptor, ChunkHasher, ChunkTransport, OldFileInfo, SourceStreamType, SpeedLimiter,
    UpdateCallbacks, UpdateError, UpdateResult, UpdateStage,
};

pub const TEMP_UPDATE_SUFFIX: &str = "_tempUpdate";
pub const DEFAULT_MAX_PARALLEL_CHUNKS: usize = 8;

/// min(8, available parallelism)
pub fn default_parallel_chunks() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    DEFAULT_MAX_PARALLEL_CHUNKS.min(cpus)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Sequential,
    Parallel { max_concurrency: Option<usize> },
}

impl Default for UpdateMode {
    fn default() -> Self {
        UpdateMode::Parallel {
            max_concurrency: None,
        }
    }
}

impl UpdateMode {
    pub fn concurrency(&self) -> usize {
        match self {
            UpdateMode::Sequential => 1,
            UpdateMode::Parallel {
                max_concurrency: Some(n),
            } => (*n).max(1),
            UpdateMode::Parallel {
                max_concurrency: None,
            } => default_parallel_chunks(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub mode: UpdateMode,
    pub remove_chunk_after_apply: bool,
    pub verify_after_apply: bool,
}

impl UpdateOptions {
    pub fn sequential() -> Self {
        Self {
            mode: UpdateMode::Sequential,
            ..Default::default()
        }
    }

    pub fn parallel(max_concurrency: Option<usize>) -> Self {
        Self {
            mode: UpdateMode::Parallel { max_concurrency },
            ..Default::default()
        }
    }

    pub fn remove_chunk_after_apply(mut self, remove: bool) -> Self {
        self.remove_chunk_after_apply = remove;
        self
    }

    pub fn verify_after_apply(mut self, verify: bool) -> Self {
        self.verify_after_apply = verify;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    pub asset_name: String,
    /// final file was already complete, no chunk was applied
    pub short_circuited: bool,
    pub chunks_from_old: u64,
    pub chunks_from_cache: u64,
    pub chunks_downloaded: u64,
    pub bytes_written: u64,
    pub bytes_downloaded: u64,
}

#[derive(Default)]
struct ReportCounter {
    from_old: AtomicU64,
    from_cache: AtomicU64,
    downloaded: AtomicU64,
}

impl ReportCounter {
    fn record(&self, stream_type: SourceStreamType) {
        let counter = match stream_type {
            SourceStreamType::OldReference => &self.from_old,
            SourceStreamType::CachedLocal => &self.from_cache,
            SourceStreamType::Internet => &self.downloaded,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct UpdatePaths {
    pub old_path: PathBuf,
    pub final_path: PathBuf,
    pub temp_path: PathBuf,
}

impl UpdatePaths {
    pub fn new(asset_name: &str, old_dir: &Path, new_dir: &Path) -> Self {
        let final_path = new_dir.join(asset_name);
        Self {
            old_path: old_dir.join(asset_name),
            temp_path: append_path_suffix(&final_path, TEMP_UPDATE_SUFFIX),
            final_path,
        }
    }
}

/// 一次 write_update 调用期间持有的文件句柄和取消范围，调用返回时全部释放
pub struct UpdateSession {
    pub paths: UpdatePaths,
    pub old_file_info: OldFileInfo,
    old_file: Option<Arc<File>>,
    output: Option<Arc<File>>,
    cancel: CancellationToken,
}

impl UpdateSession {
    /// Preflight: validate the asset, prepare dirs and open the handles.
    pub async fn open(
        asset: &AssetDescriptor,
        old_dir: &Path,
        new_dir: &Path,
        chunk_dir: &Path,
        cancel: &CancellationToken,
    ) -> UpdateResult<Self> {
        asset.validate()?;
        ensure_dir_exists(old_dir).await?;
        ensure_dir_exists(new_dir).await?;
        ensure_dir_exists(chunk_dir).await?;

        let paths = UpdatePaths::new(&asset.asset_name, old_dir, new_dir);
        if let Some(parent) = paths.final_path.parent() {
            ensure_dir_exists(parent).await?;
        }
        unassign_readonly(&paths.final_path);
        unassign_readonly(&paths.temp_path);

        let old_file_info = OldFileInfo::probe(&paths.old_path);
        let old_file = if old_file_info.exists() {
            let file = tokio::fs::File::open(&paths.old_path).await.map_err(|e| {
                UpdateError::IoError(format!(
                    "open old file {} failed: {}",
                    paths.old_path.display(),
                    e
                ))
            })?;
            Some(Arc::new(file.into_std().await))
        } else {
            None
        };

        let mut session = Self {
            paths,
            old_file_info,
            old_file,
            output: None,
            cancel: cancel.child_token(),
        };

        if session.is_final_complete(asset) {
            debug!(
                "final file {} already has {} bytes, skip applying chunks",
                session.paths.final_path.display(),
                asset.asset_size
            );
            return Ok(session);
        }

        let output = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&session.paths.temp_path)
            .await
            .map_err(|e| {
                UpdateError::IoError(format!(
                    "open temp file {} failed: {}",
                    session.paths.temp_path.display(),
                    e
                ))
            })?;
        output.set_len(asset.asset_size).await.map_err(|e| {
            UpdateError::IoError(format!(
                "resize {} to {} failed: {}",
                session.paths.temp_path.display(),
                asset.asset_size,
                e
            ))
        })?;
        session.output = Some(Arc::new(output.into_std().await));
        Ok(session)
    }

    fn is_final_complete(&self, asset: &AssetDescriptor) -> bool {
        file_len(&self.paths.final_path) == Some(asset.asset_size)
    }

    /// True when the temp path aliases the already complete final file.
    pub fn is_short_circuited(&self) -> bool {
        self.output.is_none()
    }

    /// Drop every handle so the temp file can be renamed or deleted.
    fn close(&mut self) {
        self.old_file = None;
        self.output = None;
    }
}

impl Drop for UpdateSession {
    fn drop(&mut self) {
        // stop any sibling still polling the session's scope
        self.cancel.cancel();
    }
}

/// Update Orchestrator: materializes one asset from old file, cache and network.
pub struct AssetUpdater {
    transport: Arc<dyn ChunkTransport>,
    speed_limiter: Option<Arc<dyn SpeedLimiter>>,
}

impl AssetUpdater {
    pub fn new(transport: Arc<dyn ChunkTransport>) -> Self {
        Self {
            transport,
            speed_limiter: None,
        }
    }

    pub fn with_speed_limiter(mut self, speed_limiter: Option<Arc<dyn SpeedLimiter>>) -> Self {
        self.speed_limiter = speed_limiter;
        self
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn write_update(
        &self,
        asset: &AssetDescriptor,
        old_dir: &Path,
        new_dir: &Path,
        chunk_dir: &Path,
        options: &UpdateOptions,
        callbacks: &UpdateCallbacks,
        cancel: &CancellationToken,
    ) -> UpdateResult<UpdateReport> {
        let asset_name = asset.asset_name.as_str();
        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled(format!("update of {} is cancelled", asset_name))
                .in_stage(UpdateStage::Preflight, asset_name));
        }
        let mut session = UpdateSession::open(asset, old_dir, new_dir, chunk_dir, cancel)
            .await
            .map_err(|e| e.in_stage(UpdateStage::Preflight, asset_name))?;

        let mut report = UpdateReport {
            asset_name: asset.asset_name.clone(),
            ..Default::default()
        };

        if session.is_short_circuited() {
            report.short_circuited = true;
        } else {
            let cache = ChunkCache::new(chunk_dir);
            let result = self
                .apply_all(asset, &session, &cache, options, callbacks, &mut report)
                .await;
            session.close();
            result?;

            self.publish(asset, &session, options)
                .await
                .map_err(|e| e.in_stage(UpdateStage::Publish, asset_name))?;
        }

        info!(
            "Asset: {} | (Hash: {} -> {} bytes) has been completely downloaded!",
            asset.asset_name, asset.asset_hash, asset.asset_size
        );
        if let Some(callback) = &callbacks.asset_complete {
            callback(asset);
        }
        Ok(report)
    }

    async fn apply_all(
        &self,
        asset: &AssetDescriptor,
        session: &UpdateSession,
        cache: &ChunkCache,
        options: &UpdateOptions,
        callbacks: &UpdateCallbacks,
        report: &mut UpdateReport,
    ) -> UpdateResult<()> {
        let output = session.output.clone().ok_or_else(|| {
            UpdateError::Internal(format!("temp file of {} is not opened", asset.asset_name))
        })?;
        let applier = ChunkApplier::new(
            asset,
            session.old_file.clone(),
            output,
            self.transport.as_ref(),
            self.speed_limiter.as_deref(),
            callbacks,
            session.cancel.clone(),
        );
        let counter = ReportCounter::default();

        let result = match options.mode {
            UpdateMode::Sequential => {
                self.apply_sequential(asset, session, cache, options, &applier, &counter)
                    .await
            }
            UpdateMode::Parallel { .. } => {
                self.apply_parallel(asset, session, cache, options, &applier, &counter)
                    .await
            }
        };

        report.chunks_from_old = counter.from_old.load(Ordering::SeqCst);
        report.chunks_from_cache = counter.from_cache.load(Ordering::SeqCst);
        report.chunks_downloaded = counter.downloaded.load(Ordering::SeqCst);
        report.bytes_written = applier.asset_written();
        report.bytes_downloaded = applier.asset_downloaded();
        result
    }

    async fn apply_sequential(
        &self,
        asset: &AssetDescriptor,
        session: &UpdateSession,
        cache: &ChunkCache,
        options: &UpdateOptions,
        applier: &ChunkApplier<'_>,
        counter: &ReportCounter,
    ) -> UpdateResult<()> {
        for chunk in asset.unique_chunks() {
            apply_one(asset, chunk, session, cache, options, applier, counter).await?;
        }
        Ok(())
    }

    /// Bounded pool over the chunk list. The first failure cancels the
    /// session scope, which stops admission; in-flight chunks are awaited so
    /// every handle clone is back before this returns.
    async fn apply_parallel(
        &self,
        asset: &AssetDescriptor,
        session: &UpdateSession,
        cache: &ChunkCache,
        options: &UpdateOptions,
        applier: &ChunkApplier<'_>,
        counter: &ReportCounter,
    ) -> UpdateResult<()> {
        let max_concurrency = options.mode.concurrency();
        let chunks = asset.unique_chunks();
        let first_error: Mutex<Option<UpdateError>> = Mutex::new(None);
        let cancel = &session.cancel;
        debug!(
            "apply {} chunks of {} with {} workers",
            chunks.len(),
            asset.asset_name,
            max_concurrency
        );

        stream::iter(chunks)
            .take_while(|_| futures::future::ready(!cancel.is_cancelled()))
            .for_each_concurrent(max_concurrency, |chunk| {
                let first_error = &first_error;
                async move {
                    let result =
                        apply_one(asset, chunk, session, cache, options, applier, counter).await;
                    if let Err(e) = result {
                        let mut slot = match first_error.lock() {
                            Ok(slot) => slot,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        if slot.is_none() {
                            if !e.is_cancelled() {
                                error!("chunk {} of {} failed: {}", chunk.chunk_name, asset.asset_name, e);
                            }
                            *slot = Some(e);
                        }
                        cancel.cancel();
                    }
                }
            })
            .await;

        let first_error = match first_error.into_inner() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(e) = first_error {
            return Err(e);
        }
        // caller cancelled before any chunk could report it
        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled(format!(
                "update of {} is cancelled",
                asset.asset_name
            ))
            .in_stage(UpdateStage::Apply, &asset.asset_name));
        }
        Ok(())
    }

    async fn publish(
        &self,
        asset: &AssetDescriptor,
        session: &UpdateSession,
        options: &UpdateOptions,
    ) -> UpdateResult<()> {
        let paths = &session.paths;
        if session.cancel.is_cancelled() {
            return Err(UpdateError::Cancelled(format!(
                "update of {} is cancelled",
                asset.asset_name
            )));
        }

        if options.verify_after_apply {
            let (hash, len) = ChunkHasher::calc_from_file(&paths.temp_path).await?;
            if len != asset.asset_size || !is_checksum_match(&asset.asset_hash, &hash) {
                return Err(UpdateError::VerifyError(format!(
                    "asset {} hash mismatch: expect {} ({} bytes) got {} ({} bytes)",
                    asset.asset_name, asset.asset_hash, asset.asset_size, hash, len
                )));
            }
        }

        if paths.temp_path == paths.final_path {
            return Ok(());
        }
        if let Some(parent) = paths.final_path.parent() {
            ensure_dir_exists(parent).await?;
        }

        // 另一个进程可能已经抢先完成了同一个文件，重命名前重新检查
        match file_len_async(&paths.temp_path).await {
            Some(len) if len == asset.asset_size => {
                unassign_readonly(&paths.final_path);
                tokio::fs::rename(&paths.temp_path, &paths.final_path)
                    .await
                    .map_err(|e| {
                        UpdateError::IoError(format!(
                            "rename {} to {} failed: {}",
                            paths.temp_path.display(),
                            paths.final_path.display(),
                            e
                        ))
                    })?;
                Ok(())
            }
            Some(len) => Err(UpdateError::IoError(format!(
                "temp file {} has {} bytes, expected {}",
                paths.temp_path.display(),
                len,
                asset.asset_size
            ))),
            None => {
                if file_len_async(&paths.final_path).await == Some(asset.asset_size) {
                    warn!(
                        "temp file {} vanished but {} is complete, assume another process published it",
                        paths.temp_path.display(),
                        paths.final_path.display()
                    );
                    Ok(())
                } else {
                    Err(UpdateError::IoError(format!(
                        "temp file {} is missing before publish",
                        paths.temp_path.display()
                    )))
                }
            }
        }
    }
}

async fn apply_one(
    asset: &AssetDescriptor,
    chunk: &ChunkDescriptor,
    session: &UpdateSession,
    cache: &ChunkCache,
    options: &UpdateOptions,
    applier: &ChunkApplier<'_>,
    counter: &ReportCounter,
) -> UpdateResult<()> {
    let asset_name = asset.asset_name.as_str();
    if session.cancel.is_cancelled() {
        return Err(
            UpdateError::Cancelled(format!("update of {} is cancelled", asset_name))
                .in_stage(UpdateStage::Apply, asset_name),
        );
    }
    let source = resolve_chunk_source(
        asset_name,
        chunk,
        &session.old_file_info,
        cache,
        options.remove_chunk_after_apply,
    )
    .await
    .map_err(|e| e.in_stage(UpdateStage::Resolve, asset_name))?;

    let outcome = applier
        .apply_chunk(&source, chunk)
        .await
        .map_err(|e| e.in_stage(UpdateStage::Apply, asset_name))?;
    counter.record(outcome.stream_type);
    Ok(())
}
