//! Incremental decoding and content sniffing for process output.
//!
//! One [`OutputPipeline`] exists per execution. It keeps the raw bytes, decides
//! once whether the output is binary, and decodes text chunks with a decoder
//! that is chosen on the first chunk of each stream and then reused, so
//! multi-byte characters split across chunk boundaries survive.

use chardetng::EncodingDetector;
use encoding_rs::{CoderResult, Decoder, Encoding, UTF_8};

/// Only the first chunks of an execution are inspected for binary content.
pub const SNIFF_CHUNK_LIMIT: usize = 20;
/// Upper bound on bytes inspected for binary content.
pub const MAX_SNIFF_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// What one raw chunk turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Newly decoded text from this chunk.
    Text(String),
    /// This chunk flipped the execution to binary. Emitted once.
    BinaryDetected { bytes_received: u64 },
    BinaryProgress { bytes_received: u64 },
}

#[derive(Default)]
pub struct OutputPipeline {
    raw: Vec<u8>,
    sniff: Vec<u8>,
    sniffed_chunks: usize,
    binary: bool,
    stdout: Option<ChunkDecoder>,
    stderr: Option<ChunkDecoder>,
}

impl OutputPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw chunk. Returns `None` for empty chunks.
    pub fn push(&mut self, stream: OutputStream, bytes: &[u8]) -> Option<ChunkOutcome> {
        if bytes.is_empty() {
            return None;
        }
        self.raw.extend_from_slice(bytes);
        let bytes_received = self.bytes_received();

        if self.binary {
            return Some(ChunkOutcome::BinaryProgress { bytes_received });
        }

        if self.sniffed_chunks < SNIFF_CHUNK_LIMIT && self.sniff.len() < MAX_SNIFF_BYTES {
            self.sniffed_chunks += 1;
            let room = MAX_SNIFF_BYTES - self.sniff.len();
            self.sniff.extend_from_slice(&bytes[..bytes.len().min(room)]);
            if looks_binary(&self.sniff) {
                self.binary = true;
                tracing::debug!(bytes_received, "binary output detected");
                return Some(ChunkOutcome::BinaryDetected { bytes_received });
            }
        }

        let decoder = self
            .decoder_slot(stream)
            .get_or_insert_with(|| ChunkDecoder::sniff(bytes));
        Some(ChunkOutcome::Text(decoder.decode(bytes, false)))
    }

    /// Flush any partial character held by the stream's decoder.
    pub fn finish(&mut self, stream: OutputStream) -> String {
        if self.binary {
            return String::new();
        }
        match self.decoder_slot(stream) {
            Some(decoder) => decoder.decode(&[], true),
            None => String::new(),
        }
    }

    #[must_use]
    pub fn is_binary(&self) -> bool {
        self.binary
    }

    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.raw.len() as u64
    }

    #[must_use]
    pub fn into_raw_output(self) -> Vec<u8> {
        self.raw
    }

    fn decoder_slot(&mut self, stream: OutputStream) -> &mut Option<ChunkDecoder> {
        match stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        }
    }
}

/// A NUL byte in the sniffed prefix marks the output as binary.
#[must_use]
pub fn looks_binary(sample: &[u8]) -> bool {
    sample[..sample.len().min(MAX_SNIFF_BYTES)].contains(&0)
}

/// Stateful decoder for one output stream.
pub struct ChunkDecoder {
    encoding: &'static Encoding,
    decoder: Decoder,
}

impl ChunkDecoder {
    #[must_use]
    pub fn new(encoding: &'static Encoding) -> Self {
        Self {
            encoding,
            decoder: encoding.new_decoder(),
        }
    }

    /// Pick the encoding from the first chunk of a stream.
    #[must_use]
    pub fn sniff(first_chunk: &[u8]) -> Self {
        Self::new(detect_encoding(first_chunk))
    }

    #[must_use]
    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    pub fn decode(&mut self, bytes: &[u8], last: bool) -> String {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(bytes.len())
            .unwrap_or(bytes.len().saturating_mul(3));
        let mut out = String::with_capacity(capacity + 4);
        let mut input = bytes;
        loop {
            let (result, read, _) = self.decoder.decode_to_string(input, &mut out, last);
            input = &input[read..];
            match result {
                CoderResult::InputEmpty => break,
                CoderResult::OutputFull => out.reserve(input.len().saturating_mul(3) + 4),
            }
        }
        out
    }
}

/// Guess the charset of a stream from its first chunk.
///
/// Valid UTF-8 wins, including a chunk that ends mid-character. Otherwise a
/// non-UTF-8 locale charset is trusted, and failing that the bytes are
/// handed to `chardetng`.
#[must_use]
pub fn detect_encoding(bytes: &[u8]) -> &'static Encoding {
    match std::str::from_utf8(bytes) {
        Ok(_) => return UTF_8,
        Err(err) if err.error_len().is_none() => return UTF_8,
        Err(_) => {}
    }
    if let Some(encoding) = locale_encoding() {
        return encoding;
    }
    let mut detector = EncodingDetector::new();
    detector.feed(bytes, false);
    detector.guess(None, true)
}

fn locale_encoding() -> Option<&'static Encoding> {
    let locale = ["LC_ALL", "LC_CTYPE", "LANG"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|value| !value.is_empty())?;
    let charset = locale.split('.').nth(1)?.split('@').next()?;
    Encoding::for_label(charset.as_bytes()).filter(|encoding| *encoding != UTF_8)
}

/// Remove ANSI escape sequences from decoded text.
#[must_use]
pub fn strip_ansi(text: &str) -> String {
    strip_ansi_escapes::strip_str(text)
}

/// Join plain-backend stdout and stderr, inserting one newline between them
/// only when stdout does not already end with one.
#[must_use]
pub fn combine_plain_output(stdout: &str, stderr: &str) -> String {
    let mut combined = String::with_capacity(stdout.len() + stderr.len() + 1);
    combined.push_str(stdout);
    if !stdout.is_empty() && !stderr.is_empty() && !stdout.ends_with('\n') {
        combined.push('\n');
    }
    combined.push_str(stderr);
    combined
}
