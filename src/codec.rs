//! Raw DEFLATE streams for permessage-deflate payloads (RFC 7692 §7.2)
//!
//! Thin wrapper over `flate2` that strips the `00 00 ff ff` sync-flush
//! trailer after compression and re-appends it before decompression.

use bytes::Bytes;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};

/// Trailer bytes that must be removed after compression and added before decompression
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// zlib cannot produce raw streams with an 8-bit window and silently uses 9
const MIN_ZLIB_WINDOW_BITS: u8 = 9;

/// Largest LZ77 window, also used for every decoder
const MAX_WINDOW_BITS: u8 = 15;

/// Outgoing message compressor
pub struct DeflateEncoder {
    compress: Compress,
    no_context_takeover: bool,
}

impl DeflateEncoder {
    /// Create an encoder for the negotiated window size
    pub fn new(window_bits: u8, no_context_takeover: bool, level: u32) -> Self {
        let window_bits = window_bits.clamp(MIN_ZLIB_WINDOW_BITS, MAX_WINDOW_BITS);
        Self {
            compress: Compress::new_with_window_bits(Compression::new(level), false, window_bits),
            no_context_takeover,
        }
    }

    /// Compress one message payload
    pub fn compress(&mut self, data: &[u8]) -> Result<Bytes> {
        let start_in = self.compress.total_in();
        let mut output = Vec::with_capacity(data.len() / 2 + 64);

        loop {
            if output.len() == output.capacity() {
                output.reserve(output.capacity().max(1024));
            }

            let consumed = (self.compress.total_in() - start_in) as usize;
            self.compress
                .compress_vec(&data[consumed..], &mut output, FlushCompress::Sync)
                .map_err(|e| Error::Compression(format!("deflate error: {e}")))?;

            let consumed = (self.compress.total_in() - start_in) as usize;
            // a sync flush is complete once it stops filling the buffer
            if consumed >= data.len() && output.len() < output.capacity() {
                break;
            }
        }

        if output.ends_with(&DEFLATE_TRAILER) {
            output.truncate(output.len() - DEFLATE_TRAILER.len());
        }

        if self.no_context_takeover {
            self.compress.reset();
        }

        Ok(Bytes::from(output))
    }
}

/// Incoming message decompressor
pub struct DeflateDecoder {
    decompress: Decompress,
    no_context_takeover: bool,
}

impl DeflateDecoder {
    /// Create a decoder
    ///
    /// The decoder always uses the largest window, which can inflate
    /// anything produced with a smaller one.
    pub fn new(no_context_takeover: bool) -> Self {
        Self {
            decompress: Decompress::new(false),
            no_context_takeover,
        }
    }

    /// Decompress one message payload, failing once output exceeds `max_size`
    pub fn decompress(&mut self, data: &[u8], max_size: usize) -> Result<Bytes> {
        let mut input = Vec::with_capacity(data.len() + DEFLATE_TRAILER.len());
        input.extend_from_slice(data);
        input.extend_from_slice(&DEFLATE_TRAILER);

        let start_in = self.decompress.total_in();
        let mut output =
            Vec::with_capacity(std::cmp::max(1024, data.len() * 4).min(max_size.saturating_add(1)));

        loop {
            if output.len() > max_size {
                return Err(Error::MessageTooLarge);
            }
            if output.len() == output.capacity() {
                // never grow past one byte over the limit
                let room = max_size.saturating_add(1) - output.len();
                output.reserve_exact(output.capacity().max(4096).min(room));
            }

            let consumed = (self.decompress.total_in() - start_in) as usize;
            let status = self
                .decompress
                .decompress_vec(&input[consumed..], &mut output, FlushDecompress::Sync)
                .map_err(|e| Error::Compression(format!("inflate error: {e}")))?;

            let consumed = (self.decompress.total_in() - start_in) as usize;
            match status {
                Status::StreamEnd => {
                    // a final block ends the stream; the next message starts a fresh one
                    self.decompress.reset(false);
                    break;
                }
                Status::Ok | Status::BufError => {
                    if consumed >= input.len() && output.len() < output.capacity() {
                        break;
                    }
                }
            }
        }

        if output.len() > max_size {
            return Err(Error::MessageTooLarge);
        }

        if self.no_context_takeover {
            self.decompress.reset(false);
        }

        Ok(Bytes::from(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &[u8] = b"Hello, World! This is a test message that should be compressed. \
        Hello, World! This is a test message that should be compressed.";

    #[test]
    fn test_compress_decompress() {
        let mut encoder = DeflateEncoder::new(15, false, 6);
        let mut decoder = DeflateDecoder::new(false);

        let compressed = encoder.compress(TEXT).unwrap();
        assert!(compressed.len() < TEXT.len());
        assert!(!compressed.ends_with(&DEFLATE_TRAILER));

        let inflated = decoder.decompress(&compressed, 1024).unwrap();
        assert_eq!(&inflated[..], TEXT);
    }

    #[test]
    fn test_context_takeover_shrinks_repeat() {
        let mut encoder = DeflateEncoder::new(15, false, 6);
        let first = encoder.compress(TEXT).unwrap();
        let second = encoder.compress(TEXT).unwrap();
        assert!(second.len() < first.len());
    }

    #[test]
    fn test_no_context_takeover_is_stable() {
        let mut encoder = DeflateEncoder::new(15, true, 6);
        let first = encoder.compress(TEXT).unwrap();
        let second = encoder.compress(TEXT).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_small_window_round_trip() {
        let mut encoder = DeflateEncoder::new(8, true, 9);
        let mut decoder = DeflateDecoder::new(true);
        let payload = TEXT.repeat(20);

        let compressed = encoder.compress(&payload).unwrap();
        let inflated = decoder.decompress(&compressed, payload.len()).unwrap();
        assert_eq!(&inflated[..], &payload[..]);
    }

    #[test]
    fn test_decompress_enforces_max_size() {
        let mut encoder = DeflateEncoder::new(15, false, 6);
        let mut decoder = DeflateDecoder::new(false);
        let payload = vec![b'a'; 64 * 1024];

        let compressed = encoder.compress(&payload).unwrap();
        let err = decoder.decompress(&compressed, 1024).unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge));
    }

    #[test]
    fn test_final_block_then_next_message() {
        let mut peer = Compress::new(Compression::default(), false);
        let mut decoder = DeflateDecoder::new(false);

        for text in [&b"hello one"[..], &b"hello two"[..]] {
            let mut message = Vec::with_capacity(128);
            peer.compress_vec(text, &mut message, FlushCompress::Finish)
                .unwrap();
            peer.reset();

            let inflated = decoder.decompress(&message, 1024).unwrap();
            assert_eq!(&inflated[..], text);
        }
    }

    #[test]
    fn test_decompress_limit_on_large_output() {
        let mut encoder = DeflateEncoder::new(15, false, 9);
        let mut decoder = DeflateDecoder::new(false);
        let payload = vec![b'z'; 1024 * 1024];
        let compressed = encoder.compress(&payload).unwrap();

        for max_size in [0, 1, 5000, 100_000] {
            let err = decoder.decompress(&compressed, max_size).unwrap_err();
            assert!(matches!(err, Error::MessageTooLarge));
            decoder = DeflateDecoder::new(false);
        }

        let inflated = decoder.decompress(&compressed, payload.len()).unwrap();
        assert_eq!(inflated.len(), payload.len());
    }

    #[test]
    fn test_decompress_garbage() {
        let mut decoder = DeflateDecoder::new(false);
        assert!(decoder.decompress(&[0xff, 0xff, 0xff, 0xff], 1024).is_err());
    }
}
