use async_compression::tokio::bufread::{GzipEncoder, ZstdEncoder};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;
use std::time::Duration;
use tokio::io::AsyncReadExt;

use crate::{
    AssetDescriptor, ChunkCompression, ChunkDescriptor, ChunkHasher, ChunkReader, ChunkTransport,
    UpdateError, UpdateResult,
};

static INIT_LOGGER: Once = Once::new();

pub fn init_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub async fn zstd_compress(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    ZstdEncoder::new(data).read_to_end(&mut out).await.unwrap();
    out
}

pub async fn gzip_compress(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    GzipEncoder::new(data).read_to_end(&mut out).await.unwrap();
    out
}

pub async fn compress(compression: ChunkCompression, data: &[u8]) -> Vec<u8> {
    match compression {
        ChunkCompression::None => data.to_vec(),
        ChunkCompression::Zstd => zstd_compress(data).await,
        ChunkCompression::Gzip => gzip_compress(data).await,
    }
}

/// Deterministic, non repeating-per-chunk content.
pub fn make_content(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u32).wrapping_mul(31).wrapping_add(seed as u32 * 7) % 251) as u8)
        .collect()
}

/// An asset with contiguous chunks plus the remote payloads that build it.
pub struct AssetFixture {
    pub asset: AssetDescriptor,
    pub content: Vec<u8>,
    /// remote payload per chunk, same order as asset.chunks
    pub payloads: Vec<Vec<u8>>,
}

impl AssetFixture {
    pub async fn build(asset_name: &str, chunk_sizes: &[usize], compression: ChunkCompression) -> Self {
        Self::build_with_seed(asset_name, chunk_sizes, compression, 1).await
    }

    pub async fn build_with_seed(
        asset_name: &str,
        chunk_sizes: &[usize],
        compression: ChunkCompression,
        seed: u8,
    ) -> Self {
        let total: usize = chunk_sizes.iter().sum();
        let content = make_content(total, seed);
        let mut asset = AssetDescriptor::new(asset_name, total as u64, &ChunkHasher::calc_from_bytes(&content))
            .with_compression(compression);
        let mut payloads = Vec::new();
        let mut offset = 0usize;
        for (i, size) in chunk_sizes.iter().enumerate() {
            let payload = compress(compression, &content[offset..offset + size]).await;
            asset.push_chunk(ChunkDescriptor::new(
                &format!("{}_chunk_{}", seed, i),
                offset as u64,
                payload.len() as u64,
                *size as u64,
                &ChunkHasher::calc_from_bytes(&payload),
            ));
            payloads.push(payload);
            offset += size;
        }
        Self {
            asset,
            content,
            payloads,
        }
    }

    pub fn chunk_content(&self, index: usize) -> &[u8] {
        let chunk = &self.asset.chunks[index];
        let start = chunk.target_offset as usize;
        &self.content[start..start + chunk.decompressed_size as usize]
    }
}

/// In-memory chunk server keyed by chunk_name.
#[derive(Default)]
pub struct MemoryTransport {
    chunks: HashMap<String, Vec<u8>>,
    failing: HashSet<String>,
    delay: Option<Duration>,
    hide_content_length: bool,
    on_open: Option<Box<dyn Fn(&ChunkDescriptor) + Send + Sync>>,
    requests: AtomicUsize,
    requested: std::sync::Mutex<Vec<String>>,
}

impl MemoryTransport {
    pub fn from_fixture(fixture: &AssetFixture) -> Self {
        let mut transport = Self::default();
        for (chunk, payload) in fixture.asset.chunks.iter().zip(fixture.payloads.iter()) {
            transport.insert(&chunk.chunk_name, payload.clone());
        }
        transport
    }

    pub fn insert(&mut self, chunk_name: &str, payload: Vec<u8>) {
        self.chunks.insert(chunk_name.to_string(), payload);
    }

    pub fn fail_chunk(mut self, chunk_name: &str) -> Self {
        self.failing.insert(chunk_name.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Behave like a chunked http response.
    pub fn without_content_length(mut self) -> Self {
        self.hide_content_length = true;
        self
    }

    /// Runs before the payload of each requested chunk is handed out.
    pub fn on_open(mut self, hook: impl Fn(&ChunkDescriptor) + Send + Sync + 'static) -> Self {
        self.on_open = Some(Box::new(hook));
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChunkTransport for MemoryTransport {
    async fn open_chunk(&self, chunk: &ChunkDescriptor) -> UpdateResult<(ChunkReader, Option<u64>)> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().unwrap().push(chunk.chunk_name.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(&chunk.chunk_name) {
            return Err(UpdateError::RemoteError(format!(
                "HTTP error: 502 Bad Gateway for {}",
                chunk.chunk_name
            )));
        }
        let payload = self
            .chunks
            .get(&chunk.chunk_name)
            .cloned()
            .ok_or_else(|| UpdateError::NotFound(chunk.chunk_name.clone()))?;
        if let Some(hook) = &self.on_open {
            hook(chunk);
        }
        let len = payload.len() as u64;
        let reader: ChunkReader = Box::pin(Cursor::new(payload));
        if self.hide_content_length {
            return Ok((reader, None));
        }
        Ok((reader, Some(len)))
    }
}
