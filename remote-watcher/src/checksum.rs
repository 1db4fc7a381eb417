//! Content checksums shared by stores and the mirror reconciler.
//!
//! Checksums are SHA-256 digests encoded as standard base64.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

const READ_CHUNK: usize = 64 * 1024;

/// Checksum of an in-memory buffer.
pub fn sha256_bytes(content: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(content))
}

/// Checksum of a file, streamed in chunks.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(STANDARD.encode(hasher.finalize()))
}
