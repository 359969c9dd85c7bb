//! Streamed-response decoding and incremental assembly.
//!
//! The AI responder streams raw text chunks with no framing; chunk boundaries
//! fall anywhere, including inside a multi-byte UTF-8 character. The reader
//! therefore decodes with carry-over state rather than per-chunk, and the
//! assembler folds the decoded fragments into the full message-so-far that
//! consumers (the session reconciler, ultimately the UI) want after every
//! fragment.

use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::error::ApiError;

/// An open response stream: raw byte chunks, in arrival order, until the
/// connection closes.
pub type ByteChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, ApiError>> + Send>>;

const REPLACEMENT: char = '\u{FFFD}';

/// Stateful UTF-8 decoder that carries an incomplete trailing sequence from
/// one chunk into the next.
#[derive(Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    /// Decode a chunk, prepending any bytes carried from the previous one.
    /// Returns the decoded text, which may be empty when the chunk only
    /// contains the start of a multi-byte sequence.
    fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut out = String::new();
        let mut input = bytes.as_slice();
        loop {
            match std::str::from_utf8(input) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(error) => {
                    let (valid, rest) = input.split_at(error.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match error.error_len() {
                        // Incomplete sequence at the end of the chunk: hold it
                        // back and finish it when the next chunk arrives.
                        None => {
                            self.pending = rest.to_vec();
                            break;
                        }
                        // Genuinely invalid bytes decode to U+FFFD, matching
                        // lossy text decoding on the wire.
                        Some(len) => {
                            out.push(REPLACEMENT);
                            input = &rest[len..];
                        }
                    }
                }
            }
        }
        out
    }

    /// End-of-stream: a sequence still pending can never complete.
    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            self.pending.clear();
            Some(REPLACEMENT.to_string())
        }
    }
}

/// Lazily decodes an open response stream into text fragments.
///
/// Finite and non-restartable: once the transport ends or fails, every later
/// call returns end-of-stream. A transport failure surfaces as an error
/// *after* all previously decoded fragments were handed out, so callers keep
/// whatever partial content they already received.
pub struct ChunkStreamReader {
    chunks: ByteChunkStream,
    carry: Utf8Carry,
    done: bool,
}

impl ChunkStreamReader {
    pub fn new(chunks: ByteChunkStream) -> Self {
        Self {
            chunks,
            carry: Utf8Carry::default(),
            done: false,
        }
    }

    /// Next decoded fragment, `Ok(None)` at end-of-stream.
    ///
    /// Chunks that decode to zero characters (a bare multi-byte prefix) are
    /// skipped rather than reported as empty fragments.
    pub async fn next_fragment(&mut self) -> Result<Option<String>, ApiError> {
        if self.done {
            return Ok(None);
        }

        while let Some(chunk) = self.chunks.next().await {
            match chunk {
                Ok(bytes) => {
                    let text = self.carry.decode(&bytes);
                    if !text.is_empty() {
                        return Ok(Some(text));
                    }
                }
                Err(error) => {
                    self.done = true;
                    return Err(error);
                }
            }
        }

        self.done = true;
        Ok(self.carry.finish())
    }
}

/// Folds decoded fragments into the full concatenation-so-far.
#[derive(Default)]
pub struct IncrementalMessageAssembler {
    total: String,
}

impl IncrementalMessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return the new total. Output only ever grows.
    pub fn apply_fragment(&mut self, fragment: &str) -> &str {
        self.total.push_str(fragment);
        &self.total
    }

    pub fn total(&self) -> &str {
        &self.total
    }

    /// Drive a reader to completion, invoking `on_update` with the running
    /// total after every fragment.
    ///
    /// A stream that ends with zero fragments still produces one terminal
    /// empty-string update so a pending placeholder resolves to an explicit
    /// empty response instead of hanging. A stream error propagates after the
    /// last good partial value was already reported.
    pub async fn consume<F>(
        reader: &mut ChunkStreamReader,
        mut on_update: F,
    ) -> Result<String, ApiError>
    where
        F: FnMut(&str),
    {
        let mut assembler = Self::new();
        let mut emitted = false;

        loop {
            match reader.next_fragment().await {
                Ok(Some(fragment)) => {
                    on_update(assembler.apply_fragment(&fragment));
                    emitted = true;
                }
                Ok(None) => break,
                Err(error) => return Err(error),
            }
        }

        if !emitted {
            on_update(assembler.total());
        }
        Ok(assembler.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_of(chunks: Vec<Result<&'static [u8], ApiError>>) -> ByteChunkStream {
        Box::pin(futures_util::stream::iter(
            chunks
                .into_iter()
                .map(|chunk| chunk.map(Bytes::from_static)),
        ))
    }

    async fn collect_fragments(reader: &mut ChunkStreamReader) -> Vec<String> {
        let mut fragments = Vec::new();
        while let Some(fragment) = reader.next_fragment().await.expect("fragment") {
            fragments.push(fragment);
        }
        fragments
    }

    #[tokio::test]
    async fn decodes_plain_ascii_chunks() {
        let mut reader = ChunkStreamReader::new(stream_of(vec![Ok(b"Hi"), Ok(b" there"), Ok(b"!")]));
        let fragments = collect_fragments(&mut reader).await;
        assert_eq!(fragments, vec!["Hi", " there", "!"]);
    }

    #[tokio::test]
    async fn reassembles_multibyte_char_split_across_chunks() {
        // "héllo" with the two-byte 'é' (0xC3 0xA9) split between chunks.
        let mut reader =
            ChunkStreamReader::new(stream_of(vec![Ok(b"h\xC3"), Ok(b"\xA9llo")]));
        let fragments = collect_fragments(&mut reader).await;
        assert_eq!(fragments, vec!["h", "éllo"]);
        assert_eq!(fragments.concat(), "héllo");
    }

    #[tokio::test]
    async fn reassembles_four_byte_char_split_three_ways() {
        // U+1F600 (😀) is 0xF0 0x9F 0x98 0x80.
        let mut reader = ChunkStreamReader::new(stream_of(vec![
            Ok(b"ok \xF0"),
            Ok(b"\x9F\x98"),
            Ok(b"\x80 done"),
        ]));
        let fragments = collect_fragments(&mut reader).await;
        assert_eq!(fragments.concat(), "ok 😀 done");
    }

    #[tokio::test]
    async fn prefix_only_chunk_yields_no_empty_fragment() {
        let mut reader = ChunkStreamReader::new(stream_of(vec![Ok(b"\xF0\x9F"), Ok(b"\x98\x80")]));
        let fragments = collect_fragments(&mut reader).await;
        assert_eq!(fragments, vec!["😀"]);
    }

    #[tokio::test]
    async fn invalid_bytes_decode_to_replacement_char() {
        let mut reader = ChunkStreamReader::new(stream_of(vec![Ok(b"a\xFFb")]));
        let fragments = collect_fragments(&mut reader).await;
        assert_eq!(fragments, vec!["a\u{FFFD}b"]);
    }

    #[tokio::test]
    async fn truncated_sequence_at_end_of_stream_becomes_replacement() {
        let mut reader = ChunkStreamReader::new(stream_of(vec![Ok(b"hi\xC3")]));
        let fragments = collect_fragments(&mut reader).await;
        assert_eq!(fragments, vec!["hi", "\u{FFFD}"]);
    }

    #[tokio::test]
    async fn transport_error_surfaces_after_good_fragments() {
        let mut reader = ChunkStreamReader::new(stream_of(vec![
            Ok(b"partial"),
            Err(ApiError::Stream("connection reset".to_string())),
        ]));

        assert_eq!(
            reader.next_fragment().await.expect("first fragment"),
            Some("partial".to_string())
        );
        assert!(matches!(
            reader.next_fragment().await,
            Err(ApiError::Stream(_))
        ));
        // Non-restartable: after the failure the reader stays finished.
        assert_eq!(reader.next_fragment().await.expect("after error"), None);
    }

    #[tokio::test]
    async fn assembler_emits_running_totals() {
        let mut reader =
            ChunkStreamReader::new(stream_of(vec![Ok(b"Hi"), Ok(b" there"), Ok(b"!")]));
        let mut updates = Vec::new();
        let total = IncrementalMessageAssembler::consume(&mut reader, |text| {
            updates.push(text.to_string());
        })
        .await
        .expect("assembled");

        assert_eq!(updates, vec!["Hi", "Hi there", "Hi there!"]);
        assert_eq!(total, "Hi there!");
    }

    #[tokio::test]
    async fn every_emission_is_a_prefix_of_the_final_text() {
        let mut reader = ChunkStreamReader::new(stream_of(vec![
            Ok(b"str\xC3"),
            Ok(b"\xB8m"),
            Ok(b" of"),
            Ok(b" text"),
        ]));
        let mut updates = Vec::new();
        let total = IncrementalMessageAssembler::consume(&mut reader, |text| {
            updates.push(text.to_string());
        })
        .await
        .expect("assembled");

        assert_eq!(total, "strøm of text");
        for update in &updates {
            assert!(total.starts_with(update.as_str()));
        }
    }

    #[tokio::test]
    async fn empty_stream_still_emits_one_empty_update() {
        let mut reader = ChunkStreamReader::new(stream_of(vec![]));
        let mut updates = Vec::new();
        let total = IncrementalMessageAssembler::consume(&mut reader, |text| {
            updates.push(text.to_string());
        })
        .await
        .expect("assembled");

        assert_eq!(updates, vec![""]);
        assert_eq!(total, "");
    }

    #[tokio::test]
    async fn assembler_propagates_stream_error_after_partial_updates() {
        let mut reader = ChunkStreamReader::new(stream_of(vec![
            Ok(b"so far"),
            Err(ApiError::Stream("reset".to_string())),
        ]));
        let mut updates = Vec::new();
        let result = IncrementalMessageAssembler::consume(&mut reader, |text| {
            updates.push(text.to_string());
        })
        .await;

        assert_eq!(updates, vec!["so far"]);
        assert!(matches!(result, Err(ApiError::Stream(_))));
    }
}
