use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, trace, warn};

use parley_types::{FileChunk, FileErrorReason, FileMeta, FileRef, Frame, FrameType, PeerId};

use crate::registry::{Outbound, PeerSender};
use crate::relay::Relay;

/// Chunks emitted between pauses while re-streaming a stored file.
const YIELD_EVERY_CHUNKS: u32 = 4;
const STREAM_PAUSE: Duration = Duration::from_millis(1);
/// Chunks of one re-stream that may be queued but not yet written.
pub(crate) const STREAM_WINDOW: usize = 8;

/// A stored file that passed every check and is ready to stream.
pub struct Retrieval {
    pub meta: FileMeta,
    pub file: File,
    pub size: u64,
}

impl Relay {
    // -- Capture of live uploads --

    pub(crate) fn capture_meta(&self, room: &str, frame: &Frame) {
        let meta: FileMeta = match frame.decode() {
            Ok(meta) => meta,
            Err(e) => {
                warn!("fileMeta without usable fields: {}", e);
                return;
            }
        };
        match self.db.upsert_file_meta(room, &meta, chrono::Utc::now()) {
            Ok(()) => info!(
                "file {} ({}, {} bytes) announced in room {}",
                meta.file_id, meta.name, meta.size, room
            ),
            Err(e) => warn!("failed to store meta for {}: {}", meta.file_id, e),
        }
    }

    pub(crate) async fn capture_chunk(&self, frame: &Frame) {
        let chunk: FileChunk = match frame.decode() {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("fileChunk without usable fields: {}", e);
                return;
            }
        };
        let bytes = match chunk.bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("fileChunk {} @{} has bad data: {}", chunk.file_id, chunk.offset, e);
                return;
            }
        };

        let Some(end) = chunk.offset.checked_add(bytes.len() as u64) else {
            warn!("chunk for {} at {} runs past u64, not stored", chunk.file_id, chunk.offset);
            return;
        };

        let mut extension = chunk.extension.clone();
        match self.db.get_file_meta(&chunk.file_id) {
            Ok(Some(row)) => {
                let received = row.bytes_received.max(0) as u64;
                if chunk.offset < received {
                    warn!(
                        "overlapping chunk for {} at {} (already have {} bytes), not stored",
                        chunk.file_id, chunk.offset, row.bytes_received
                    );
                    return;
                }
                if chunk.offset > received {
                    warn!(
                        "chunk for {} at {} leaves a gap after {} bytes, not stored",
                        chunk.file_id, chunk.offset, received
                    );
                    return;
                }
                extension = row.extension;
            }
            Ok(None) => debug!("chunk for unannounced file {}", chunk.file_id),
            Err(e) => warn!("failed to load meta for {}: {}", chunk.file_id, e),
        }

        if let Err(e) = self
            .store
            .write_chunk(&chunk.file_id, &extension, chunk.offset, &bytes)
            .await
        {
            warn!("failed to store chunk {} @{}: {}", chunk.file_id, chunk.offset, e);
            return;
        }
        if let Err(e) = self.db.advance_received(&chunk.file_id, end) {
            warn!("failed to record progress for {}: {}", chunk.file_id, e);
        }
        trace!("stored chunk {} [{}..{})", chunk.file_id, chunk.offset, end);
    }

    pub(crate) async fn capture_complete(&self, frame: &Frame) {
        let Ok(file) = frame.decode::<FileRef>() else {
            warn!("fileComplete without fileId");
            return;
        };
        match self.db.mark_file_complete(&file.file_id) {
            Ok(true) => {}
            Ok(false) => {
                debug!("fileComplete for unknown file {}", file.file_id);
                return;
            }
            Err(e) => {
                warn!("failed to mark {} complete: {}", file.file_id, e);
                return;
            }
        }

        let Ok(Some(row)) = self.db.get_file_meta(&file.file_id) else {
            return;
        };
        match self.store.digest(&row.file_id, &row.extension).await {
            Ok(digest) => info!(
                "file {} stored: {} of {} bytes, sha256 {}",
                row.file_id, row.bytes_received, row.total_size, digest
            ),
            Err(e) => warn!("file {} marked complete but blob unreadable: {}", row.file_id, e),
        }
    }

    // -- Status and retrieval --

    /// Reply to the requester with the stored record re-typed as `fileUpdate`.
    pub(crate) fn file_update(&self, peer_id: &PeerId, frame: &Frame) {
        let Ok(file) = frame.decode::<FileRef>() else {
            return;
        };
        match self.db.get_file_meta(&file.file_id) {
            Ok(Some(row)) => {
                if let Ok(reply) = Frame::encode(FrameType::FileUpdate, &row.to_meta()) {
                    self.registry.send_to(peer_id, reply);
                }
            }
            Ok(None) => debug!("fileUpdate for unknown file {}", file.file_id),
            Err(e) => warn!("failed to load meta for {}: {}", file.file_id, e),
        }
    }

    /// Answer a `fileRequest`: an error frame, or a stream of meta, chunks
    /// and complete running outside the relay turn.
    pub(crate) async fn serve_file(&self, peer_id: &PeerId, frame: &Frame) {
        let Ok(file) = frame.decode::<FileRef>() else {
            warn!("{} sent fileRequest without fileId", peer_id);
            return;
        };
        let Some(tx) = self.registry.sender(peer_id) else {
            return;
        };

        match self.prepare_retrieval(&file.file_id).await {
            Ok(retrieval) => {
                info!(
                    "serving file {} ({} bytes) to {}",
                    file.file_id, retrieval.size, peer_id
                );
                tokio::spawn(stream_file(retrieval, tx));
            }
            Err(reason) => {
                debug!("fileRequest {} from {}: {}", file.file_id, peer_id, reason.message());
                let _ = tx.send(Frame::file_error(reason, &file.file_id).into());
            }
        }
    }

    pub async fn prepare_retrieval(&self, file_id: &str) -> Result<Retrieval, FileErrorReason> {
        let row = match self.db.get_file_meta(file_id) {
            Ok(Some(row)) => row,
            Ok(None) => return Err(FileErrorReason::MetaNotFound),
            Err(e) => {
                warn!("failed to load meta for {}: {}", file_id, e);
                return Err(FileErrorReason::MetaNotFound);
            }
        };
        if !row.complete {
            return Err(FileErrorReason::NotAvailableYet);
        }

        let mut meta = row.to_meta();
        meta.chunk_size = self.config.clamp_chunk_size(row.chunk_size);
        meta.realtime = false;

        let on_disk = match self.store.file_size(&meta.file_id, &meta.extension).await {
            Ok(Some(len)) if len > 0 => len,
            Ok(_) => return Err(FileErrorReason::FileMissingOrEmpty),
            Err(e) => {
                warn!("blob lookup for {} failed: {}", file_id, e);
                return Err(FileErrorReason::FileMissingOrEmpty);
            }
        };
        let size = if meta.size > 0 {
            meta.size.min(on_disk)
        } else {
            on_disk
        };

        let file = match self.store.open(&meta.file_id, &meta.extension).await {
            Ok(file) => file,
            Err(e) => {
                warn!("failed to open blob for {}: {}", file_id, e);
                return Err(FileErrorReason::OpenFailed);
            }
        };

        Ok(Retrieval { meta, file, size })
    }
}

/// Stream a stored file to one requester: meta, ordered chunks, complete.
///
/// Reads one chunk at a time. At most [`STREAM_WINDOW`] chunks sit in the
/// requester's queue at once; the next is read only after the connection
/// has written an earlier one. The stream also pauses every few chunks so
/// other tasks keep running while a large file is served.
pub async fn stream_file(mut retrieval: Retrieval, tx: PeerSender) {
    let meta = &retrieval.meta;
    let Ok(head) = Frame::encode(FrameType::FileMeta, meta) else {
        return;
    };
    if tx.send(head.into()).is_err() {
        return;
    }

    let window = Arc::new(Semaphore::new(STREAM_WINDOW));

    let chunk_size = meta.chunk_size as usize;
    let mut buf = vec![0u8; chunk_size];
    let mut offset: u64 = 0;
    let mut sent: u32 = 0;

    while offset < retrieval.size {
        let Ok(permit) = window.clone().acquire_owned().await else {
            return;
        };
        let want = chunk_size.min((retrieval.size - offset) as usize);
        let n = match read_up_to(&mut retrieval.file, &mut buf[..want]).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("read of {} failed at {}: {}", meta.file_id, offset, e);
                break;
            }
        };

        let mut chunk = FileChunk::new(&meta.file_id, &meta.extension, offset, &buf[..n]);
        chunk.from = meta.from.clone();
        let Ok(frame) = Frame::encode(FrameType::FileChunk, &chunk) else {
            break;
        };
        if tx.send(Outbound::paced(frame, permit)).is_err() {
            debug!("requester left while streaming {}", meta.file_id);
            return;
        }

        offset += n as u64;
        sent += 1;
        if sent % YIELD_EVERY_CHUNKS == 0 {
            tokio::time::sleep(STREAM_PAUSE).await;
        }
    }

    let done = FileRef {
        file_id: meta.file_id.clone(),
        from: meta.from.clone(),
    };
    if let Ok(frame) = Frame::encode(FrameType::FileComplete, &done) {
        let _ = tx.send(frame.into());
    }
    debug!("streamed {} in {} chunks", meta.file_id, sent);
}

/// Fill `buf` unless EOF comes first. Returns the bytes read.
async fn read_up_to(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::tests::{drain, harness, join};
    use tokio::sync::mpsc;

    fn meta_frame(file_id: &str, size: usize, chunk_size: usize) -> String {
        format!(
            r#"{{"type":"fileMeta","fileId":"{}","name":"data.bin","extension":"bin","size":{},"mimeType":"application/octet-stream","chunkSize":{},"realtime":true,"complete":false}}"#,
            file_id, size, chunk_size
        )
    }

    fn chunk_frame(file_id: &str, offset: u64, bytes: &[u8]) -> String {
        let chunk = FileChunk::new(file_id, "bin", offset, bytes);
        Frame::encode(FrameType::FileChunk, &chunk).unwrap().to_text()
    }

    async fn wait_for_complete(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap()
                .frame;
            let done = frame.is(FrameType::FileComplete) || frame.is(FrameType::Error);
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }

    #[tokio::test]
    async fn upload_is_captured_and_restreamed_byte_exact() {
        let mut h = harness().await;
        let (a, _a_rx) = join(&mut h.relay, "R");
        let content: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();

        h.relay.on_message(&a, &meta_frame("f1", content.len(), 16_384)).await;
        for (i, part) in content.chunks(16_384).enumerate() {
            let frame = chunk_frame("f1", (i * 16_384) as u64, part);
            h.relay.on_message(&a, &frame).await;
        }
        h.relay
            .on_message(&a, r#"{"type":"fileComplete","fileId":"f1"}"#)
            .await;

        let (b, mut b_rx) = join(&mut h.relay, "R");
        drain(&mut b_rx);
        h.relay
            .on_message(&b, r#"{"type":"fileRequest","fileId":"f1"}"#)
            .await;
        let frames = wait_for_complete(&mut b_rx).await;

        assert!(frames[0].is(FrameType::FileMeta));
        assert_eq!(frames[0].get::<bool>("realtime"), Some(false));
        assert_eq!(frames[0].get::<bool>("complete"), Some(true));
        assert_eq!(frames[0].from, Some(a.clone()));

        let chunks: Vec<FileChunk> = frames[1..frames.len() - 1]
            .iter()
            .map(|f| f.decode().unwrap())
            .collect();
        assert_eq!(chunks.len(), 3);
        let mut rebuilt = Vec::new();
        for chunk in &chunks {
            assert_eq!(chunk.offset as usize, rebuilt.len());
            rebuilt.extend(chunk.bytes().unwrap());
        }
        assert_eq!(rebuilt, content);
        assert!(frames.last().unwrap().is(FrameType::FileComplete));
    }

    #[tokio::test]
    async fn request_before_complete_is_not_available_yet() {
        let mut h = harness().await;
        let (a, _a_rx) = join(&mut h.relay, "R");
        h.relay.on_message(&a, &meta_frame("f2", 4, 4)).await;
        h.relay.on_message(&a, &chunk_frame("f2", 0, b"abcd")).await;

        let (b, mut b_rx) = join(&mut h.relay, "R");
        drain(&mut b_rx);
        h.relay
            .on_message(&b, r#"{"type":"fileRequest","fileId":"f2"}"#)
            .await;
        let frames = drain(&mut b_rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is(FrameType::Error));
        assert_eq!(frames[0].str_field("reason"), Some("not-available-yet"));
        assert_eq!(frames[0].str_field("fileId"), Some("f2"));
    }

    #[tokio::test]
    async fn missing_meta_and_missing_blob_are_reported() {
        let mut h = harness().await;
        let (a, mut a_rx) = join(&mut h.relay, "R");
        let (_b, mut b_rx) = join(&mut h.relay, "R");
        drain(&mut a_rx);
        drain(&mut b_rx);

        h.relay
            .on_message(&a, r#"{"type":"fileRequest","fileId":"ghost"}"#)
            .await;
        let frames = drain(&mut a_rx);
        assert_eq!(frames[0].str_field("reason"), Some("meta-not-found"));

        h.relay.on_message(&a, &meta_frame("f3", 10, 4)).await;
        h.relay
            .on_message(&a, r#"{"type":"fileComplete","fileId":"f3"}"#)
            .await;
        drain(&mut b_rx);
        h.relay
            .on_message(&a, r#"{"type":"fileRequest","fileId":"f3"}"#)
            .await;
        let frames = drain(&mut a_rx);
        assert_eq!(frames[0].str_field("reason"), Some("file-missing-or-empty"));
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn overlapping_chunks_are_not_stored() {
        let mut h = harness().await;
        let (a, _a_rx) = join(&mut h.relay, "R");
        h.relay.on_message(&a, &meta_frame("f4", 8, 4)).await;
        h.relay.on_message(&a, &chunk_frame("f4", 0, b"abcd")).await;
        h.relay.on_message(&a, &chunk_frame("f4", 4, b"efgh")).await;
        h.relay.on_message(&a, &chunk_frame("f4", 0, b"XXXX")).await;
        h.relay.on_message(&a, &chunk_frame("f4", 2, b"YYYY")).await;

        let stored = tokio::fs::read(h.dir.join("f4.bin")).await.unwrap();
        assert_eq!(stored, b"abcdefgh");
    }

    #[tokio::test]
    async fn chunks_past_the_received_bytes_are_not_stored() {
        let mut h = harness().await;
        let (a, _a_rx) = join(&mut h.relay, "R");
        h.relay.on_message(&a, &meta_frame("f8", 8, 4)).await;
        h.relay.on_message(&a, &chunk_frame("f8", 4, b"efgh")).await;
        assert!(!h.dir.join("f8.bin").exists());

        h.relay.on_message(&a, &chunk_frame("f8", u64::MAX - 1, b"zz")).await;
        h.relay.on_message(&a, &chunk_frame("f8", 0, b"abcd")).await;
        h.relay.on_message(&a, &chunk_frame("f8", 4, b"efgh")).await;
        let stored = tokio::fs::read(h.dir.join("f8.bin")).await.unwrap();
        assert_eq!(stored, b"abcdefgh");

        // Unannounced files have no watermark, but the end must still fit.
        h.relay.on_message(&a, &chunk_frame("ghost", u64::MAX - 1, b"zz")).await;
        assert!(!h.dir.join("ghost.bin").exists());
    }

    #[tokio::test]
    async fn restream_stays_one_window_ahead_of_the_socket() {
        let mut h = harness().await;
        let (a, _a_rx) = join(&mut h.relay, "R");
        let content: Vec<u8> = (0..400u32).map(|i| (i % 251) as u8).collect();
        h.relay.on_message(&a, &meta_frame("f9", content.len(), 4)).await;
        for (i, part) in content.chunks(4).enumerate() {
            h.relay.on_message(&a, &chunk_frame("f9", (i * 4) as u64, part)).await;
        }
        h.relay
            .on_message(&a, r#"{"type":"fileComplete","fileId":"f9"}"#)
            .await;

        let (b, mut b_rx) = join(&mut h.relay, "R");
        drain(&mut b_rx);
        h.relay
            .on_message(&b, r#"{"type":"fileRequest","fileId":"f9"}"#)
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Held items stand in for frames the socket has not written yet.
        let mut held = Vec::new();
        while let Ok(queued) = b_rx.try_recv() {
            held.push(queued);
        }
        assert_eq!(held.len(), 1 + STREAM_WINDOW);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b_rx.try_recv().is_err());

        let mut frames: Vec<Frame> = held.into_iter().map(|queued| queued.frame).collect();
        frames.extend(wait_for_complete(&mut b_rx).await);

        assert!(frames[0].is(FrameType::FileMeta));
        let chunks: Vec<FileChunk> = frames[1..frames.len() - 1]
            .iter()
            .map(|f| f.decode().unwrap())
            .collect();
        assert_eq!(chunks.len(), 100);
        let rebuilt: Vec<u8> = chunks.iter().flat_map(|c| c.bytes().unwrap()).collect();
        assert_eq!(rebuilt, content);
    }

    #[tokio::test]
    async fn file_update_reports_completion_to_requester_only() {
        let mut h = harness().await;
        let (a, mut a_rx) = join(&mut h.relay, "R");
        let (b, mut b_rx) = join(&mut h.relay, "R");
        h.relay.on_message(&a, &meta_frame("f5", 4, 4)).await;
        h.relay.on_message(&a, &chunk_frame("f5", 0, b"abcd")).await;
        h.relay
            .on_message(&a, r#"{"type":"fileComplete","fileId":"f5"}"#)
            .await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        h.relay
            .on_message(&b, r#"{"type":"fileUpdate","fileId":"f5"}"#)
            .await;
        let frames = drain(&mut b_rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is(FrameType::FileUpdate));
        assert_eq!(frames[0].get::<bool>("complete"), Some(true));
        assert!(drain(&mut a_rx).is_empty());

        h.relay
            .on_message(&b, r#"{"type":"fileUpdate","fileId":"nope"}"#)
            .await;
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn history_meta_reflects_stored_record() {
        let mut h = harness().await;
        let (a, _a_rx) = join(&mut h.relay, "R");
        h.relay.on_message(&a, &meta_frame("f6", 4, 4)).await;
        h.relay.on_message(&a, &chunk_frame("f6", 0, b"abcd")).await;
        h.relay
            .on_message(&a, r#"{"type":"fileComplete","fileId":"f6"}"#)
            .await;

        let history = h.relay.history_frames("R");
        assert_eq!(history.len(), 1);
        assert!(history[0].is(FrameType::FileMeta));
        assert_eq!(history[0].get::<bool>("realtime"), Some(false));
        assert_eq!(history[0].get::<bool>("complete"), Some(true));
    }

    #[tokio::test]
    async fn oversized_chunk_size_is_clamped_on_restream() {
        let mut h = harness().await;
        let (a, mut a_rx) = join(&mut h.relay, "R");
        let content = vec![7u8; 20_000];
        h.relay.on_message(&a, &meta_frame("f7", content.len(), 1 << 20)).await;
        h.relay.on_message(&a, &chunk_frame("f7", 0, &content)).await;
        h.relay
            .on_message(&a, r#"{"type":"fileComplete","fileId":"f7"}"#)
            .await;
        drain(&mut a_rx);

        h.relay
            .on_message(&a, r#"{"type":"fileRequest","fileId":"f7"}"#)
            .await;
        let frames = wait_for_complete(&mut a_rx).await;
        assert_eq!(frames[0].get::<u64>("chunkSize"), Some(16_384));
        assert_eq!(frames.len(), 4);
    }
}
