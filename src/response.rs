use std::io::SeekFrom;
use std::path::PathBuf;

use anyhow::{Context, Result};
use http::{HeaderMap, StatusCode};
use tokio::fs::File as AsyncFile;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use crate::lock::LockGuard;

/// One piece of a response body: literal bytes or a slice of a file on disk.
#[derive(Debug, Clone)]
pub enum BodySegment {
    Bytes(Vec<u8>),
    FileRange { path: PathBuf, start: u64, len: u64 },
}

impl BodySegment {
    pub fn len(&self) -> u64 {
        match self {
            BodySegment::Bytes(bytes) => bytes.len() as u64,
            BodySegment::FileRange { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A response body the cache can produce or consume. File-backed variants
/// are read lazily when the body is written out, so serving a cached body
/// never buffers it in memory.
#[derive(Debug, Clone, Default)]
pub enum ResponseBody {
    #[default]
    Empty,
    Bytes(Vec<u8>),
    File {
        path: PathBuf,
        len: u64,
    },
    Segments(Vec<BodySegment>),
}

impl ResponseBody {
    pub fn len(&self) -> u64 {
        match self {
            ResponseBody::Empty => 0,
            ResponseBody::Bytes(bytes) => bytes.len() as u64,
            ResponseBody::File { len, .. } => *len,
            ResponseBody::Segments(segments) => segments.iter().map(BodySegment::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stream the body into `writer`, returning the byte count.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<u64> {
        match self {
            ResponseBody::Empty => Ok(0),
            ResponseBody::Bytes(bytes) => {
                writer.write_all(bytes).await?;
                Ok(bytes.len() as u64)
            }
            ResponseBody::File { path, len } => {
                copy_file_range(path.clone(), 0, *len, writer).await
            }
            ResponseBody::Segments(segments) => {
                let mut total = 0u64;
                for segment in segments {
                    total += match segment {
                        BodySegment::Bytes(bytes) => {
                            writer.write_all(bytes).await?;
                            bytes.len() as u64
                        }
                        BodySegment::FileRange { path, start, len } => {
                            copy_file_range(path.clone(), *start, *len, writer).await?
                        }
                    };
                }
                Ok(total)
            }
        }
    }

    /// Collect the whole body into memory.
    pub async fn into_bytes(self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.len() as usize);
        self.write_to(&mut out).await?;
        Ok(out)
    }
}

async fn copy_file_range<W: AsyncWrite + Unpin>(
    path: PathBuf,
    start: u64,
    len: u64,
    writer: &mut W,
) -> Result<u64> {
    let mut file = AsyncFile::open(&path)
        .await
        .with_context(|| format!("failed to open cached body {}", path.display()))?;
    if start > 0 {
        file.seek(SeekFrom::Start(start)).await?;
    }
    let mut remaining = len;
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let read = file.read(&mut buf[..want]).await?;
        if read == 0 {
            break;
        }
        writer.write_all(&buf[..read]).await?;
        remaining -= read as u64;
        total += read as u64;
    }
    Ok(total)
}

/// Read-lock guards held while a file-backed response is being consumed.
/// Dropping the response releases them, which is what makes the entity
/// evictable again.
#[derive(Debug, Default)]
pub struct ServeLease {
    guards: Vec<LockGuard>,
}

impl ServeLease {
    pub(crate) fn new(guards: Vec<LockGuard>) -> Self {
        Self { guards }
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

/// A response flowing through the cache: either produced by the downstream
/// pipeline or rendered from a stored entity.
#[derive(Debug)]
pub struct CacheResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    lease: Option<ServeLease>,
}

impl CacheResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        Self {
            status,
            headers,
            body,
            lease: None,
        }
    }

    pub fn empty(status: StatusCode) -> Self {
        Self::new(status, HeaderMap::new(), ResponseBody::Empty)
    }

    pub(crate) fn with_lease(mut self, lease: ServeLease) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn header_str(&self, name: http::header::HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}
