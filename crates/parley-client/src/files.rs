use std::collections::{BTreeMap, HashMap};

use bytes::{Bytes, BytesMut};
use tracing::debug;

use parley_types::{
    DEFAULT_CHUNK_SIZE, FileChunk, FileErrorReason, FileId, FileMeta, FileRef, Frame, FrameType,
};

use crate::error::FileAssemblyError;

// -- Placeholders and completion tracking --

#[derive(Debug, Clone)]
struct Placeholder {
    meta: FileMeta,
    complete: bool,
    loaded: bool,
    in_flight: bool,
    abandoned: bool,
}

impl Placeholder {
    fn wants_fetch(&self) -> bool {
        !self.meta.realtime && !self.loaded && !self.abandoned
    }
}

/// One UI placeholder per announced file, and the state needed to fetch
/// stored files exactly once.
#[derive(Debug, Default)]
pub struct FileTracker {
    placeholders: BTreeMap<FileId, Placeholder>,
}

impl FileTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a placeholder for `meta`. Returns false if one already
    /// exists, in which case only its completion flag is refreshed.
    pub fn placeholder(&mut self, meta: &FileMeta) -> bool {
        if let Some(existing) = self.placeholders.get_mut(&meta.file_id) {
            existing.complete |= meta.complete;
            return false;
        }
        self.placeholders.insert(
            meta.file_id.clone(),
            Placeholder {
                meta: meta.clone(),
                complete: meta.complete,
                loaded: false,
                in_flight: false,
                abandoned: false,
            },
        );
        true
    }

    pub fn contains(&self, file_id: &str) -> bool {
        self.placeholders.contains_key(file_id)
    }

    pub fn len(&self) -> usize {
        self.placeholders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placeholders.is_empty()
    }

    pub fn is_loaded(&self, file_id: &str) -> bool {
        self.placeholders.get(file_id).is_some_and(|p| p.loaded)
    }

    pub fn is_in_flight(&self, file_id: &str) -> bool {
        self.placeholders.get(file_id).is_some_and(|p| p.in_flight)
    }

    pub fn mark_complete(&mut self, file_id: &str) {
        if let Some(p) = self.placeholders.get_mut(file_id) {
            p.complete = true;
        }
    }

    pub fn mark_loaded(&mut self, file_id: &str) {
        if let Some(p) = self.placeholders.get_mut(file_id) {
            p.complete = true;
            p.loaded = true;
            p.in_flight = false;
        }
    }

    /// A live transfer could not be assembled; fetch the stored copy instead.
    pub fn fall_back_to_stored(&mut self, file_id: &str) {
        if let Some(p) = self.placeholders.get_mut(file_id) {
            p.meta.realtime = false;
            p.loaded = false;
        }
    }

    /// The relay refused a fetch. A file that is not complete yet goes back
    /// to polling; any other reason stops further attempts.
    pub fn request_failed(&mut self, file_id: &str, reason: FileErrorReason) {
        if let Some(p) = self.placeholders.get_mut(file_id) {
            p.in_flight = false;
            match reason {
                FileErrorReason::NotAvailableYet => p.complete = false,
                _ => p.abandoned = true,
            }
        }
    }

    /// Stored files still waiting for the relay to report them complete.
    pub fn awaiting_completion(&self) -> Vec<FileId> {
        self.placeholders
            .values()
            .filter(|p| p.wants_fetch() && !p.complete)
            .map(|p| p.meta.file_id.clone())
            .collect()
    }

    pub fn is_polling(&self) -> bool {
        self.placeholders
            .values()
            .any(|p| p.wants_fetch() && !p.complete)
    }

    /// Complete files that are neither loaded nor already requested. Each
    /// returned id is marked in flight so it is never requested twice.
    pub fn take_requests(&mut self) -> Vec<FileId> {
        let mut ids = Vec::new();
        for p in self.placeholders.values_mut() {
            if p.wants_fetch() && p.complete && !p.in_flight {
                p.in_flight = true;
                ids.push(p.meta.file_id.clone());
            }
        }
        ids
    }
}

// -- Reassembly --

/// A fully received file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFile {
    pub meta: FileMeta,
    pub data: Bytes,
}

#[derive(Debug)]
struct Partial {
    meta: FileMeta,
    chunks: BTreeMap<u64, Bytes>,
}

/// Buffers for files being received, keyed by file id.
#[derive(Debug, Default)]
pub struct IncomingFiles {
    files: HashMap<FileId, Partial>,
}

impl IncomingFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) buffering a file.
    pub fn begin(&mut self, meta: &FileMeta) {
        self.files.insert(
            meta.file_id.clone(),
            Partial {
                meta: meta.clone(),
                chunks: BTreeMap::new(),
            },
        );
    }

    pub fn is_receiving(&self, file_id: &str) -> bool {
        self.files.contains_key(file_id)
    }

    pub fn push_chunk(&mut self, chunk: &FileChunk) -> Result<(), FileAssemblyError> {
        let partial = self
            .files
            .get_mut(&chunk.file_id)
            .ok_or_else(|| FileAssemblyError::UnknownFile(chunk.file_id.clone()))?;
        let data = Bytes::from(chunk.bytes()?);
        let start = chunk.offset;
        let end = start
            .checked_add(data.len() as u64)
            .ok_or(FileAssemblyError::OutOfRange { offset: start })?;

        if let Some((prev_off, prev)) = partial.chunks.range(..=start).next_back() {
            let prev_end = prev_off + prev.len() as u64;
            if prev_end > start {
                return Err(FileAssemblyError::Overlap {
                    offset: start,
                    end: prev_end,
                });
            }
        }
        if let Some((&next_off, _)) = partial.chunks.range(start..).next() {
            if next_off < end {
                return Err(FileAssemblyError::Overlap {
                    offset: next_off,
                    end,
                });
            }
        }

        partial.chunks.insert(start, data);
        Ok(())
    }

    /// Stitch a file together and stop buffering it.
    pub fn finish(&mut self, file_id: &str) -> Result<CompletedFile, FileAssemblyError> {
        let partial = self
            .files
            .remove(file_id)
            .ok_or_else(|| FileAssemblyError::UnknownFile(file_id.to_string()))?;

        let buffered: usize = partial.chunks.values().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(buffered);
        for (offset, data) in &partial.chunks {
            if *offset != out.len() as u64 {
                return Err(FileAssemblyError::Gap(out.len() as u64));
            }
            out.extend_from_slice(data);
        }

        let got = out.len() as u64;
        if partial.meta.size > 0 && got != partial.meta.size {
            if got < partial.meta.size {
                return Err(FileAssemblyError::Gap(got));
            }
            return Err(FileAssemblyError::SizeMismatch {
                got,
                expected: partial.meta.size,
            });
        }
        debug!("assembled {} ({} bytes)", partial.meta.file_id, got);

        Ok(CompletedFile {
            meta: partial.meta,
            data: out.freeze(),
        })
    }
}

// -- Sending --

/// A local file prepared for the live broadcast path.
#[derive(Debug, Clone)]
pub struct FileUpload {
    meta: FileMeta,
    data: Bytes,
}

impl FileUpload {
    pub fn new(file_id: impl Into<FileId>, name: &str, mime_type: &str, data: Bytes) -> Self {
        let extension = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase())
            .unwrap_or_default();
        let meta = FileMeta {
            file_id: file_id.into(),
            name: name.to_string(),
            extension,
            size: data.len() as u64,
            mime_type: mime_type.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            realtime: true,
            complete: false,
            from: None,
        };
        Self { meta, data }
    }

    pub fn meta(&self) -> &FileMeta {
        &self.meta
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// `fileMeta`, then one `fileChunk` per slice in offset order, then
    /// `fileComplete`.
    pub fn frames(&self) -> Result<Vec<Frame>, serde_json::Error> {
        let mut frames = vec![Frame::encode(FrameType::FileMeta, &self.meta)?];
        let step = self.meta.chunk_size as usize;
        for (i, slice) in self.data.chunks(step).enumerate() {
            let offset = (i * step) as u64;
            let chunk = FileChunk::new(&self.meta.file_id, &self.meta.extension, offset, slice);
            frames.push(Frame::encode(FrameType::FileChunk, &chunk)?);
        }
        let done = FileRef {
            file_id: self.meta.file_id.clone(),
            from: None,
        };
        frames.push(Frame::encode(FrameType::FileComplete, &done)?);
        Ok(frames)
    }
}
