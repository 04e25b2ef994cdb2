/*
update.cfg.json 更新引擎的配置文件，不存在则使用默认配置
{
    "max_parallel_chunks": 8,
    "sequential": false,
    "remove_chunk_after_apply": true,
    "download_speed_limit": 10485760
}
*/
use log::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    PreloadSizeCalculator, SpeedLimiter, TokenBucketSpeedLimiter, UpdateError, UpdateMode,
    UpdateOptions, UpdateResult, DEFAULT_HTTP_TIMEOUT_SECS, PRELOAD_PARALLEL_THRESHOLD,
};

pub const UPDATE_CONFIG_FILE_NAME: &str = "update.cfg.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateEngineConfig {
    /// None: min(8, cpu count)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_parallel_chunks: Option<usize>,
    pub sequential: bool,
    pub remove_chunk_after_apply: bool,
    pub verify_after_apply: bool,
    /// bytes per second, None or 0 is unlimited
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_speed_limit: Option<u64>,
    pub preload_parallel_threshold: usize,
    pub http_timeout_secs: u64,
}

impl Default for UpdateEngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_chunks: None,
            sequential: false,
            remove_chunk_after_apply: false,
            verify_after_apply: false,
            download_speed_limit: None,
            preload_parallel_threshold: PRELOAD_PARALLEL_THRESHOLD,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

impl UpdateEngineConfig {
    /// Missing file gives the defaults, a malformed one is an error.
    pub async fn load_from_file(config_path: &Path) -> UpdateResult<Self> {
        if !config_path.exists() {
            debug!(
                "update config {} not exists, use default config",
                config_path.display()
            );
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(config_path).await.map_err(|e| {
            UpdateError::IoError(format!(
                "read update config {} failed: {}",
                config_path.display(),
                e
            ))
        })?;
        let config = serde_json::from_str::<Self>(&content).map_err(|e| {
            UpdateError::InvalidParam(format!(
                "parse update config {} failed: {}",
                config_path.display(),
                e
            ))
        })?;
        debug!("load update config {} OK.", config_path.display());
        Ok(config)
    }

    /// Loads `update.cfg.json` from `work_dir`, falling back to defaults on any error.
    pub async fn load_or_default(work_dir: &Path) -> Self {
        let config_path = work_dir.join(UPDATE_CONFIG_FILE_NAME);
        match Self::load_from_file(&config_path).await {
            Ok(config) => config,
            Err(e) => {
                warn!("load {} failed, use default config. {}", config_path.display(), e);
                Self::default()
            }
        }
    }

    pub fn to_update_options(&self) -> UpdateOptions {
        let mode = if self.sequential {
            UpdateMode::Sequential
        } else {
            UpdateMode::Parallel {
                max_concurrency: self.max_parallel_chunks,
            }
        };
        UpdateOptions {
            mode,
            remove_chunk_after_apply: self.remove_chunk_after_apply,
            verify_after_apply: self.verify_after_apply,
        }
    }

    pub fn build_speed_limiter(&self) -> Option<Arc<dyn SpeedLimiter>> {
        match self.download_speed_limit {
            Some(limit) if limit > 0 => Some(Arc::new(TokenBucketSpeedLimiter::new(limit))),
            _ => None,
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn preload_calculator(&self) -> PreloadSizeCalculator {
        PreloadSizeCalculator::new(self.preload_parallel_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AssetDescriptor, ChunkCache, ChunkDescriptor};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = UpdateEngineConfig::load_or_default(dir.path()).await;
        assert_eq!(config, UpdateEngineConfig::default());
        assert!(config.build_speed_limiter().is_none());
        assert_eq!(
            config.to_update_options().mode,
            UpdateMode::Parallel {
                max_concurrency: None
            }
        );

        let config_path = dir.path().join(UPDATE_CONFIG_FILE_NAME);
        std::fs::write(
            &config_path,
            r#"{"sequential": true, "remove_chunk_after_apply": true, "download_speed_limit": 1024}"#,
        )
        .unwrap();
        let config = UpdateEngineConfig::load_from_file(&config_path).await.unwrap();
        assert!(config.sequential);
        assert_eq!(config.preload_parallel_threshold, PRELOAD_PARALLEL_THRESHOLD);
        assert_eq!(config.http_timeout(), Duration::from_secs(30));
        let options = config.to_update_options();
        assert_eq!(options.mode, UpdateMode::Sequential);
        assert!(options.remove_chunk_after_apply);
        assert!(config.build_speed_limiter().is_some());

        std::fs::write(&config_path, "{not json").unwrap();
        let err = UpdateEngineConfig::load_from_file(&config_path)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::InvalidParam(_)));
        let config = UpdateEngineConfig::load_or_default(dir.path()).await;
        assert_eq!(config, UpdateEngineConfig::default());
    }

    #[tokio::test]
    async fn test_preload_calculator_follows_threshold() {
        let chunk_dir = tempfile::tempdir().unwrap();
        let output_dir = tempfile::tempdir().unwrap();
        let mut asset = AssetDescriptor::new("Data/small.pak", 400, "00");
        for i in 0..4u64 {
            asset.push_chunk(ChunkDescriptor::new(
                &format!("chunk_{}", i),
                i * 100,
                40,
                100,
                &format!("{:064x}", i),
            ));
        }
        let cache = ChunkCache::new(chunk_dir.path());
        for chunk in asset.chunks.iter().take(3) {
            std::fs::write(cache.staging_path(&asset.asset_name, chunk), vec![1u8; 40]).unwrap();
        }

        let cancel = CancellationToken::new();
        let sequential = UpdateEngineConfig::default().preload_calculator();
        let parallel = UpdateEngineConfig {
            preload_parallel_threshold: 1,
            ..Default::default()
        }
        .preload_calculator();
        for calculator in [sequential, parallel] {
            let total = calculator
                .preloaded_bytes(&asset, chunk_dir.path(), output_dir.path(), false, &cancel)
                .await
                .unwrap();
            assert_eq!(total, 300);
        }
    }
}
