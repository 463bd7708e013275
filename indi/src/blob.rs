//! Incremental base64 decoding for BLOB payloads.
//!
//! The text of a `oneBLOB` arrives in whatever pieces the socket hands us. The
//! decoder keeps a partial quantum between pieces and stops producing output
//! once the announced byte count has been reached.

use crate::error::DecodeError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// Upper bound on the buffer reserved up front from an announced size
const MAX_PREALLOC: usize = 64 * 1024 * 1024;

/// Undecoded characters kept before a forced flush
const FLUSH_THRESHOLD: usize = 16 * 1024;

#[derive(Debug)]
pub struct Base64Stream {
    expected: Option<usize>,
    out: Vec<u8>,
    carry: Vec<u8>,
    /// Padding seen; the current quantum is the last one
    padded: bool,
    terminated: bool,
}

impl Base64Stream {
    /// `expected` is the decoded size announced by the element, if any.
    pub fn new(expected: Option<usize>) -> Self {
        let capacity = expected.unwrap_or(0).min(MAX_PREALLOC);
        Self {
            expected,
            out: Vec::with_capacity(capacity),
            carry: Vec::with_capacity(FLUSH_THRESHOLD),
            padded: false,
            terminated: false,
        }
    }

    pub fn expected(&self) -> Option<usize> {
        self.expected
    }

    pub fn decoded_len(&self) -> usize {
        self.out.len()
    }

    /// No further input will change the output.
    pub fn is_complete(&self) -> bool {
        if self.terminated {
            return true;
        }
        match self.expected {
            Some(n) => self.out.len() + self.carry.len() / 4 * 3 >= n,
            None => false,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), DecodeError> {
        for &byte in chunk {
            if self.is_complete() {
                break;
            }
            if byte.is_ascii_whitespace() {
                continue;
            }
            self.carry.push(byte);
            if byte == b'=' {
                self.padded = true;
            }
            if self.padded && self.carry.len() % 4 == 0 {
                self.terminated = true;
            }
            if self.carry.len() >= FLUSH_THRESHOLD {
                self.flush()?;
            }
        }
        self.flush()
    }

    fn flush(&mut self) -> Result<(), DecodeError> {
        let whole = self.carry.len() / 4 * 4;
        if whole == 0 {
            return Ok(());
        }
        BASE64
            .decode_vec(&self.carry[..whole], &mut self.out)
            .map_err(|e| DecodeError::InvalidBase64(e.to_string()))?;
        self.carry.drain(..whole);
        if let Some(n) = self.expected {
            self.out.truncate(n);
        }
        Ok(())
    }

    /// Decode what is left and check the size.
    pub fn finish(mut self, element: &str) -> Result<Vec<u8>, DecodeError> {
        if !self.carry.is_empty() && !self.is_complete() {
            while self.carry.len() % 4 != 0 {
                self.carry.push(b'=');
            }
            self.flush()?;
        }

        match self.expected {
            Some(expected) if self.out.len() < expected => Err(DecodeError::BlobSizeMismatch {
                element: element.to_string(),
                expected,
                actual: self.out.len(),
            }),
            _ => Ok(self.out),
        }
    }
}

/// Encode a payload for a `oneBLOB` element.
pub fn encode(data: &[u8]) -> String {
    BASE64.encode(data)
}
