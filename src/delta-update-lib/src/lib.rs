mod apply;
mod asset;
mod chunk_cache;
mod config;
mod file_util;
mod hasher;
mod manifest;
mod preload;
mod source;
mod speed_limiter;
mod transport;
mod update;

pub use apply::*;
pub use asset::*;
pub use chunk_cache::*;
pub use config::*;
pub use file_util::*;
pub use hasher::*;
pub use manifest::*;
pub use preload::*;
pub use source::*;
pub use speed_limiter::*;
pub use transport::*;
pub use update::*;

use reqwest::StatusCode;
use std::fmt;
use thiserror::Error;

#[cfg(test)]
mod test_support;

/// 一次资产更新中出错的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStage {
    Preflight,
    Resolve,
    Apply,
    Publish,
}

impl fmt::Display for UpdateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateStage::Preflight => "preflight",
            UpdateStage::Resolve => "resolve",
            UpdateStage::Apply => "apply",
            UpdateStage::Publish => "publish",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("verify chunk error: {0}")]
    VerifyError(String),
    #[error("remote error: {0}")]
    RemoteError(String),
    #[error("decode error: {0}")]
    DecodeError(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("{stage} failed for asset {asset}: {source}")]
    StageFailed {
        stage: UpdateStage,
        asset: String,
        #[source]
        source: Box<UpdateError>,
    },
}

impl UpdateError {
    pub fn from_http_status(code: StatusCode, info: String) -> Self {
        match code {
            StatusCode::NOT_FOUND => UpdateError::NotFound(info),
            StatusCode::INTERNAL_SERVER_ERROR => UpdateError::Internal(info),
            _ => UpdateError::RemoteError(format!("HTTP error: {} for {}", code, info)),
        }
    }

    /// Tag the error with the stage it surfaced from. Already tagged errors keep their stage.
    pub fn in_stage(self, stage: UpdateStage, asset: &str) -> Self {
        match self {
            UpdateError::StageFailed { .. } => self,
            other => UpdateError::StageFailed {
                stage,
                asset: asset.to_string(),
                source: Box::new(other),
            },
        }
    }

    pub fn stage(&self) -> Option<UpdateStage> {
        match self {
            UpdateError::StageFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The error without its stage wrapper.
    pub fn root(&self) -> &UpdateError {
        match self {
            UpdateError::StageFailed { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), UpdateError::Cancelled(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), UpdateError::NotFound(_))
    }
}

pub type UpdateResult<T> = std::result::Result<T, UpdateError>;

impl From<std::io::Error> for UpdateError {
    fn from(err: std::io::Error) -> Self {
        UpdateError::IoError(err.to_string())
    }
}
