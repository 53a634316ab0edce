use bytes::BytesMut;
use futures_util::StreamExt;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use vision_common::frame::FrameSink;

use crate::ProducerError;

const BOUNDARY: &[u8] = b"--frame\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";
/// Larger parts are dropped and the parser resyncs on the next boundary.
pub const DEFAULT_MAX_PART_LEN: usize = 8 * 1024 * 1024;

/// Parse state for the MJPEG multipart stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Looking for the boundary marker `--frame\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental splitter for a `multipart/x-mixed-replace` MJPEG body.
///
/// Chunks may cut a boundary or a header block anywhere; a part is emitted
/// only once the boundary that terminates it has been seen.
pub struct MjpegParser {
    buffer: BytesMut,
    state: ParseState,
    jpeg_start: usize,
    max_part_len: usize,
}

impl Default for MjpegParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MjpegParser {
    pub fn new() -> Self {
        Self::with_max_part_len(DEFAULT_MAX_PART_LEN)
    }

    pub fn with_max_part_len(max_part_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            jpeg_start: 0,
            max_part_len,
        }
    }

    /// Feed one network chunk and return every JPEG it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, BOUNDARY) {
                        let _ = self.buffer.split_to(pos + BOUNDARY.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep the tail in case the boundary spans chunks
                        if self.buffer.len() > BOUNDARY.len() {
                            let _ = self.buffer.split_to(self.buffer.len() - BOUNDARY.len());
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.jpeg_start = 0;
                        self.state = ParseState::CollectingJpeg;
                    } else {
                        if self.buffer.len() > self.max_part_len {
                            self.resync("part headers");
                            continue;
                        }
                        break;
                    }
                }
                ParseState::CollectingJpeg => {
                    if let Some(pos) = find_subsequence(&self.buffer[self.jpeg_start..], BOUNDARY)
                    {
                        let jpeg_end = self.jpeg_start + pos;
                        // Strip trailing \r\n before boundary
                        let end = if jpeg_end >= 2
                            && self.buffer[jpeg_end - 2] == b'\r'
                            && self.buffer[jpeg_end - 1] == b'\n'
                        {
                            jpeg_end - 2
                        } else {
                            jpeg_end
                        };

                        let jpeg = self.buffer[..end].to_vec();
                        let _ = self.buffer.split_to(jpeg_end + BOUNDARY.len());
                        if !jpeg.is_empty() {
                            frames.push(jpeg);
                        }
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        if self.buffer.len() > self.max_part_len {
                            self.resync("JPEG part");
                            continue;
                        }
                        // Avoid re-scanning bytes that cannot start a boundary
                        self.jpeg_start = self.buffer.len().saturating_sub(BOUNDARY.len());
                        break;
                    }
                }
            }
        }

        frames
    }

    /// Drop the oversized part and wait for the next boundary.
    fn resync(&mut self, what: &str) {
        warn!(
            bytes = self.buffer.len(),
            limit = self.max_part_len,
            "{what} exceeds size limit, dropped"
        );
        // Keep the tail in case a boundary is split across chunks.
        let keep = BOUNDARY.len().min(self.buffer.len());
        let _ = self.buffer.split_to(self.buffer.len() - keep);
        self.jpeg_start = 0;
        self.state = ParseState::SeekingBoundary;
    }
}

/// Consume the MJPEG stream and push every frame into `sink`.
/// Reconnects with exponential backoff on failure.
pub async fn run_mjpeg_producer(stream_url: &str, sink: &dyn FrameSink) {
    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(30);

    loop {
        info!(url = stream_url, "connecting to MJPEG stream");
        match consume_stream(stream_url, sink).await {
            Ok(()) => {
                info!("stream ended cleanly, reconnecting");
                backoff = Duration::from_secs(2);
            }
            Err(e) => {
                error!(error = %e, "stream error, reconnecting in {:?}", backoff);
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}

async fn consume_stream(url: &str, sink: &dyn FrameSink) -> Result<(), ProducerError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(ProducerError::HttpConnect)?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(ProducerError::HttpConnect)?;

    if !response.status().is_success() {
        return Err(ProducerError::HttpStatus(response.status().as_u16()));
    }

    info!(status = %response.status(), "connected to MJPEG stream");

    let mut byte_stream = response.bytes_stream();
    let mut parser = MjpegParser::new();
    let mut total: u64 = 0;

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(ProducerError::HttpStream)?;
        for jpeg in parser.push(&chunk) {
            sink.push_frame(&jpeg);
            total += 1;
            if total % 100 == 0 {
                debug!(total, bytes = jpeg.len(), "frames received");
            }
        }
    }

    Ok(())
}

/// Polling-based fallback: periodically fetch single frames.
pub async fn run_polling_producer(frame_url: &str, sink: &dyn FrameSink, interval: Duration) {
    let client = reqwest::Client::new();
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;

        match fetch_frame(&client, frame_url).await {
            Ok(jpeg) => sink.push_frame(&jpeg),
            Err(ProducerError::HttpStatus(status)) => {
                warn!(status, "non-success response from camera");
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch camera frame");
            }
        }
    }
}

async fn fetch_frame(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, ProducerError> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(ProducerError::HttpConnect)?;
    if !resp.status().is_success() {
        return Err(ProducerError::HttpStatus(resp.status().as_u16()));
    }
    let body = resp.bytes().await.map_err(ProducerError::HttpStream)?;
    Ok(body.to_vec())
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
