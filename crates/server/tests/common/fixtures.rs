//! Test fixtures for generating test data and multipart bodies.

use bytes::Bytes;
use sha2::{Digest, Sha256};

/// Boundary used by every hand-built multipart body.
pub const BOUNDARY: &str = "depot-test-boundary-7d1f";

/// Generate deterministic test data based on a seed.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        // Simple LCG for deterministic data
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Compute SHA-256 hash of data as hex string.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub fn sha256_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    result.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Split `data` into `count` contiguous chunks; the last takes the remainder.
#[allow(dead_code)]
pub fn split_chunks(data: &Bytes, count: usize) -> Vec<Bytes> {
    let size = data.len().div_ceil(count);
    (0..count)
        .map(|i| {
            let start = (i * size).min(data.len());
            let end = ((i + 1) * size).min(data.len());
            data.slice(start..end)
        })
        .collect()
}

/// One chunk upload form.
#[derive(Clone, Debug)]
pub struct ChunkPart {
    pub data: Bytes,
    pub chunk_index: String,
    pub total_chunks: String,
    pub file_name: Option<String>,
    pub upload_id: Option<String>,
    pub checksum: Option<String>,
}

#[allow(dead_code)]
impl ChunkPart {
    pub fn new(data: Bytes, chunk_index: u32, total_chunks: u32, file_name: &str) -> Self {
        Self {
            data,
            chunk_index: chunk_index.to_string(),
            total_chunks: total_chunks.to_string(),
            file_name: Some(file_name.to_string()),
            upload_id: None,
            checksum: None,
        }
    }

    pub fn upload_id(mut self, upload_id: &str) -> Self {
        self.upload_id = Some(upload_id.to_string());
        self
    }

    pub fn checksum(mut self, checksum: &str) -> Self {
        self.checksum = Some(checksum.to_string());
        self
    }

    /// Encode as a `multipart/form-data` body with [`BOUNDARY`].
    pub fn to_body(&self) -> Vec<u8> {
        let mut body = Vec::new();

        let mut text = |name: &str, value: &str| {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        };
        text("chunkIndex", &self.chunk_index);
        text("totalChunks", &self.total_chunks);
        if let Some(file_name) = &self.file_name {
            text("fileName", file_name);
        }
        if let Some(upload_id) = &self.upload_id {
            text("uploadId", upload_id);
        }
        if let Some(checksum) = &self.checksum {
            text("checksum", checksum);
        }

        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"chunk\"; filename=\"blob\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(&self.data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }
}
