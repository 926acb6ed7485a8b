//! Content fingerprints for images, used as cache keys.

use std::{fmt, io};

use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt as _};

/// How much to read at a time when hashing.
const CHUNK_SIZE: usize = 64 * 1024;

/// A stable fingerprint of some bytes, as lowercase hex.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint everything `reader` produces. We only return once the
    /// reader hits EOF, so a fingerprint never covers partial data.
    pub async fn from_reader<R>(mut reader: R) -> io::Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut hasher = Sha256::new();
        let mut buf = vec![0; CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(format!("{:x}", hasher.finalize())))
    }

    /// Fingerprint an in-memory buffer.
    pub async fn from_bytes(data: &[u8]) -> io::Result<Self> {
        Self::from_reader(data).await
    }

    /// The fingerprint as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
