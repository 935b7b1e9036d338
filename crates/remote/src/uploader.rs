// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Single-object upload of an unbounded, non-seekable stream
//!
//! The stream is buffered into an unlinked spill file until EOF or the
//! part threshold. EOF first means one `PutObject`; otherwise a multipart
//! upload ships one threshold-sized part at a time, reusing the same
//! spill file. The store client is expected to retry idempotent requests;
//! the uploader never re-reads a shipped part.
//!
//! A stream of exactly the threshold length is detected by a one-read
//! probe after the part fills, so it still uses a single PUT; the probed
//! bytes carry over into the next part otherwise.

use std::path::{Path as StdPath, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};
use object_store::path::Path;
use object_store::{MultipartUpload, ObjectStore, PutPayload};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::{RemoteError, Result};

pub const DEFAULT_PART_THRESHOLD: u64 = 5 * (1 << 30);
pub const DEFAULT_MAX_PARTS: u64 = 10_000;
pub const DEFAULT_MAX_OBJECT: u64 = 5 * (1 << 40);

const COPY_BUFFER: usize = 1 << 20;

/// Payload chunk size when re-reading the spill file for the network.
const PAYLOAD_CHUNK: usize = 8 * (1 << 20);

#[derive(Debug, Clone)]
pub struct UploadParams {
    pub part_threshold: u64,
    pub max_parts: u64,
    pub max_object: u64,
    /// Where spill files live; the system temp dir when unset.
    pub spill_dir: Option<PathBuf>,
}

impl Default for UploadParams {
    fn default() -> Self {
        UploadParams {
            part_threshold: DEFAULT_PART_THRESHOLD,
            max_parts: DEFAULT_MAX_PARTS,
            max_object: DEFAULT_MAX_OBJECT,
            spill_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub bytes: u64,
    /// Part sizes in upload order; `None` when a single PUT sufficed.
    pub parts: Option<Vec<u64>>,
}

/// Upload `stream` as the object at `key`.
///
/// # Errors
///
/// [`RemoteError::EmptyStream`] when the stream yields no bytes (no object
/// is created); [`RemoteError::ObjectTooLarge`] when the stream exceeds
/// the part or object limits. Any failure after the multipart upload was
/// opened aborts it once and surfaces the original error.
pub async fn upload_stream<R: AsyncRead + Unpin>(
    store: &Arc<dyn ObjectStore>,
    key: &str,
    mut stream: R,
    params: &UploadParams,
) -> Result<UploadSummary> {
    let location = Path::from(key);
    let mut spill = SpillFile::create(params.spill_dir.as_deref())?;
    let mut filler = Filler::default();

    let (first, eof) = filler.fill(&mut stream, &mut spill, params.part_threshold).await?;
    if first == 0 {
        return Err(RemoteError::EmptyStream);
    }
    if eof {
        store.put(&location, spill.payload(first).await?).await?;
        debug!("uploaded {key} with a single PUT ({first} bytes)");
        return Ok(UploadSummary { bytes: first, parts: None });
    }

    let mut multipart = store.put_multipart(&location).await?;
    let result = async {
        let summary = drive_multipart(
            multipart.as_mut(),
            &mut stream,
            &mut spill,
            &mut filler,
            first,
            params,
        )
        .await?;
        multipart.complete().await?;
        Ok(summary)
    }
    .await;

    match result {
        Ok(summary) => {
            debug!(
                "uploaded {key} with {} parts ({} bytes)",
                summary.parts.as_ref().map_or(0, Vec::len),
                summary.bytes
            );
            Ok(summary)
        }
        Err(e) => {
            if let Err(abort_err) = multipart.abort().await {
                warn!("could not abort multipart upload of {key}: {abort_err}");
            }
            Err(e)
        }
    }
}

async fn drive_multipart<R: AsyncRead + Unpin>(
    multipart: &mut dyn MultipartUpload,
    stream: &mut R,
    spill: &mut SpillFile,
    filler: &mut Filler,
    first: u64,
    params: &UploadParams,
) -> Result<UploadSummary> {
    let size_limit = params
        .max_object
        .min(params.max_parts.saturating_mul(params.part_threshold));

    let mut parts: Vec<u64> = Vec::new();
    let mut total: u64 = 0;
    let mut len = first;
    let mut done = false;
    while len > 0 {
        total += len;
        if parts.len() as u64 == params.max_parts || total > params.max_object {
            return Err(RemoteError::ObjectTooLarge { bytes: total, limit: size_limit });
        }
        // Part numbers start at 1 and stay monotonic: one put_part call
        // per filled spill buffer, in order.
        multipart.put_part(spill.payload(len).await?).await?;
        parts.push(len);
        if done {
            break;
        }
        spill.reset().await?;
        let (next, eof) = filler.fill(stream, spill, params.part_threshold).await?;
        len = next;
        done = eof;
    }
    Ok(UploadSummary { bytes: total, parts: Some(parts) })
}

/// An unlinked temporary file, reclaimed by the kernel on process exit.
struct SpillFile {
    file: tokio::fs::File,
}

impl SpillFile {
    fn create(dir: Option<&StdPath>) -> Result<Self> {
        let file = match dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        Ok(SpillFile { file: tokio::fs::File::from_std(file) })
    }

    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        Ok(self.file.write_all(buf).await?)
    }

    async fn reset(&mut self) -> Result<()> {
        self.file.set_len(0).await?;
        self.file.rewind().await?;
        Ok(())
    }

    /// Re-read the first `len` buffered bytes as a chunked payload.
    async fn payload(&mut self, len: u64) -> Result<PutPayload> {
        self.file.flush().await?;
        self.file.rewind().await?;
        let mut chunks = Vec::new();
        let mut remaining = usize::try_from(len).unwrap_or(usize::MAX);
        while remaining > 0 {
            let take = remaining.min(PAYLOAD_CHUNK);
            let mut buf = vec![0u8; take];
            self.file.read_exact(&mut buf).await?;
            chunks.push(Bytes::from(buf));
            remaining -= take;
        }
        Ok(PutPayload::from_iter(chunks))
    }
}

/// Copies the stream into the spill file one part at a time, carrying the
/// probe read across part boundaries.
#[derive(Default)]
struct Filler {
    carry: Vec<u8>,
}

impl Filler {
    /// Fill the spill file with up to `limit` bytes. Returns the number
    /// of bytes written and whether the stream reached EOF.
    async fn fill<R: AsyncRead + Unpin>(
        &mut self,
        stream: &mut R,
        spill: &mut SpillFile,
        limit: u64,
    ) -> Result<(u64, bool)> {
        let mut written: u64 = 0;
        if !self.carry.is_empty() {
            let take = usize::try_from(u64::min(self.carry.len() as u64, limit))
                .unwrap_or(self.carry.len());
            spill.write(&self.carry[..take]).await?;
            self.carry.drain(..take);
            written += take as u64;
        }
        let mut buf = vec![0u8; COPY_BUFFER];
        while written < limit {
            let want = COPY_BUFFER.min(usize::try_from(limit - written).unwrap_or(COPY_BUFFER));
            let n = stream.read(&mut buf[..want]).await?;
            if n == 0 {
                return Ok((written, true));
            }
            spill.write(&buf[..n]).await?;
            written += n as u64;
        }
        if self.carry.is_empty() {
            // The part is full; one probe read tells EOF apart from more
            // data, and its bytes carry into the next part.
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok((written, true));
            }
            self.carry.extend_from_slice(&buf[..n]);
        }
        Ok((written, false))
    }
}
