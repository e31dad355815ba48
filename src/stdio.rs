//! Redirected standard streams of a sandboxed process.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Incremental UTF-8 decoder. Multi-byte sequences split across chunks
/// are carried over; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    carry: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `chunk` as forms complete characters
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(chunk);

        let mut out = String::with_capacity(buf.len());
        let mut rest = buf.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, tail) = rest.split_at(err.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match err.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[bad..];
                        }
                        None => {
                            self.carry = tail.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush at end of stream; a dangling partial sequence becomes U+FFFD
    pub fn finish(&mut self) -> String {
        if self.carry.is_empty() {
            String::new()
        } else {
            self.carry.clear();
            char::REPLACEMENT_CHARACTER.to_string()
        }
    }

    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}

/// What a chunk of output is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Human-readable log and error text
    Diagnostic,
    /// Program output meant for display (e.g. rendered markup)
    Preview,
}

/// One decoded piece of output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub channel: Channel,
    pub text: String,
}

pub type ChunkSender = mpsc::UnboundedSender<OutputChunk>;
pub type ChunkReceiver = mpsc::UnboundedReceiver<OutputChunk>;

/// Where a stdio descriptor's bytes go
#[derive(Debug, Clone, Default)]
pub enum Redirect {
    #[default]
    Discard,
    /// Keep the decoded text for the run report
    Capture,
    /// Deliver decoded chunks live, tagged with `channel`
    Forward { channel: Channel, tx: ChunkSender },
}

impl Redirect {
    pub fn forward(channel: Channel, tx: &ChunkSender) -> Self {
        Redirect::Forward {
            channel,
            tx: tx.clone(),
        }
    }
}

/// Write end of a redirected descriptor, one decoder per channel lifetime
#[derive(Debug)]
pub struct OutputSink {
    redirect: Redirect,
    decoder: Utf8StreamDecoder,
    captured: String,
    bytes_written: u64,
}

impl OutputSink {
    pub fn new(redirect: Redirect) -> Self {
        Self {
            redirect,
            decoder: Utf8StreamDecoder::new(),
            captured: String::new(),
            bytes_written: 0,
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.bytes_written += bytes.len() as u64;
        if matches!(self.redirect, Redirect::Discard) {
            return;
        }
        let text = self.decoder.decode(bytes);
        self.emit(text);
    }

    fn emit(&mut self, text: String) {
        if text.is_empty() {
            return;
        }
        match &self.redirect {
            Redirect::Discard => {}
            Redirect::Capture => self.captured.push_str(&text),
            Redirect::Forward { channel, tx } => {
                // receiver gone means nobody is listening any more
                let _ = tx.send(OutputChunk {
                    channel: *channel,
                    text,
                });
            }
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flush the decoder and return captured text
    pub fn finish(mut self) -> String {
        let tail = self.decoder.finish();
        self.emit(tail);
        self.captured
    }
}
