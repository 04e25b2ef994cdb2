use async_trait::async_trait;
use futures_util::StreamExt;
use log::*;
use reqwest::Client;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use crate::{ChunkDescriptor, UpdateError, UpdateResult};

pub type ChunkReader = Pin<Box<dyn AsyncRead + Unpin + Send>>;

pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Network side of a chunk fetch. Returns the payload as stored remotely
/// (still compressed) and its length when the remote reports one.
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    async fn open_chunk(&self, chunk: &ChunkDescriptor) -> UpdateResult<(ChunkReader, Option<u64>)>;
}

pub struct HttpChunkTransport {
    client: Client,
    url_prefix: String,
}

impl HttpChunkTransport {
    pub fn new(url_prefix: &str) -> UpdateResult<Self> {
        Self::with_timeout(url_prefix, Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS))
    }

    pub fn with_timeout(url_prefix: &str, timeout: Duration) -> UpdateResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpdateError::Internal(format!("Failed to create client: {}", e)))?;
        Ok(Self::with_client(client, url_prefix))
    }

    pub fn with_client(client: Client, url_prefix: &str) -> Self {
        Self {
            client,
            url_prefix: url_prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn gen_chunk_url(&self, chunk: &ChunkDescriptor) -> String {
        format!("{}/{}", self.url_prefix, chunk.chunk_name)
    }
}

#[async_trait]
impl ChunkTransport for HttpChunkTransport {
    async fn open_chunk(&self, chunk: &ChunkDescriptor) -> UpdateResult<(ChunkReader, Option<u64>)> {
        let chunk_url = self.gen_chunk_url(chunk);
        debug!("open chunk reader by url: {}", chunk_url);
        let res = self
            .client
            .get(&chunk_url)
            .send()
            .await
            .map_err(|e| UpdateError::RemoteError(format!("Request {} failed: {}", chunk_url, e)))?;

        if !res.status().is_success() {
            return Err(UpdateError::from_http_status(res.status(), chunk_url));
        }

        let content_length = res.content_length();
        let stream = res.bytes_stream().map(|r| {
            r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, format!("Stream error: {}", e)))
        });
        let reader: ChunkReader = Box::pin(StreamReader::new(stream));
        Ok((reader, content_length))
    }
}
