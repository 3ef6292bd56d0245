//! Part-based uploads for bodies too large to send in one request.
//!
//! A session id is a purely local seed: it namespaces the part ids of one
//! upload and has no server-side counterpart. Part ids are derived from the
//! session and a zero-padded part number so every id of an object has the
//! same encoded length.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::content_type::ContentType;
use crate::error::{BlobError, Result};
use crate::reference::ObjectRef;

/// Digits in the part-number suffix of an encoded part id.
pub const NUMBER_WIDTH: usize = 6;
const MAX_PART_NUMBER: u32 = 999_999;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartId {
    session: Uuid,
    number: u32,
}

impl PartId {
    pub fn new(session: Uuid, number: u32) -> Result<Self> {
        if number > MAX_PART_NUMBER {
            return Err(BlobError::Argument(format!(
                "part number {number} does not fit in {NUMBER_WIDTH} digits"
            )));
        }
        Ok(Self { session, number })
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    /// Base64 of `<session>-<number>`, fixed length for every part.
    pub fn encoded(&self) -> String {
        B64.encode(format!(
            "{}-{:0width$}",
            self.session.simple(),
            self.number,
            width = NUMBER_WIDTH
        ))
    }

    pub fn decode(encoded: &str) -> Option<Self> {
        let raw = B64.decode(encoded).ok()?;
        let raw = String::from_utf8(raw).ok()?;
        let (session, number) = raw.split_once('-')?;
        if number.len() != NUMBER_WIDTH {
            return None;
        }
        let session = Uuid::parse_str(session).ok()?;
        let number = number.parse().ok()?;
        Self::new(session, number).ok()
    }
}

impl fmt::Display for PartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded())
    }
}

pub struct ChunkedUploader {
    max_part_size: usize,
}

impl ChunkedUploader {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        Self::with_part_size(config.max_part_size)
    }

    pub fn with_part_size(max_part_size: usize) -> Result<Self> {
        if max_part_size == 0 {
            return Err(BlobError::Configuration(
                "max_part_size must be at least 1 byte".into(),
            ));
        }
        Ok(Self { max_part_size })
    }

    pub fn max_part_size(&self) -> usize {
        self.max_part_size
    }

    pub fn init_session(&self) -> Uuid {
        Uuid::new_v4()
    }

    /// Stages `reader` as consecutive parts starting at `start_part` and
    /// returns their ids in upload order. At least one part is always
    /// produced, so an empty stream stages one empty part.
    pub async fn upload_from_stream<R>(
        &self,
        r: &ObjectRef,
        session: Uuid,
        start_part: u32,
        reader: &mut R,
    ) -> Result<Vec<PartId>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let backend = r.container().backend();
        let mut buf = vec![0u8; self.max_part_size];
        let mut parts = Vec::new();
        let mut number = start_part;

        loop {
            let filled = read_full(reader, &mut buf).await?;
            if filled == 0 && !parts.is_empty() {
                break;
            }
            let part = PartId::new(session, number)?;
            backend
                .stage_part(r.name(), &part, Bytes::copy_from_slice(&buf[..filled]))
                .await
                .map_err(BlobError::Transport)?;
            tracing::debug!(path = r.name(), part = number, len = filled, "part staged");
            parts.push(part);

            if filled < buf.len() {
                break;
            }
            number = number
                .checked_add(1)
                .ok_or_else(|| BlobError::Argument("part number overflow".into()))?;
        }

        r.invalidate();
        Ok(parts)
    }

    /// Commits `parts`, in the given order, as the object body.
    pub async fn complete_session(
        &self,
        r: &ObjectRef,
        session: Uuid,
        parts: &[PartId],
    ) -> Result<String> {
        if parts.is_empty() {
            return Err(BlobError::Argument("no parts to commit".into()));
        }
        if let Some(foreign) = parts.iter().find(|p| p.session() != session) {
            return Err(BlobError::Argument(format!(
                "part {foreign} does not belong to session {session}"
            )));
        }
        let content_type = ContentType::from_path(r.name());
        let etag = r
            .container()
            .backend()
            .commit_parts(r.name(), parts, Some(content_type.as_str()))
            .await
            .map_err(BlobError::Transport)?;
        r.invalidate();
        tracing::info!(
            container = r.container().name(),
            path = r.name(),
            parts = parts.len(),
            "upload session committed"
        );
        r.audit("CompleteSession");
        Ok(etag)
    }

    /// Abandons a session. Staged parts are left for the store to expire.
    pub async fn abort_session(&self, r: &ObjectRef, session: Uuid) -> Result<()> {
        r.invalidate();
        r.container()
            .backend()
            .forget_session(r.name(), session)
            .await
            .map_err(BlobError::Transport)?;
        tracing::debug!(path = r.name(), %session, "upload session aborted");
        Ok(())
    }
}

/// Reads until `buf` is full or the reader is exhausted.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
