//! Content-Encoding decode/re-encode around the injector
//!
//! All codecs are driven through their `Write` adapters so input can be fed
//! in arbitrary chunks; produced bytes land in a shared buffer that is
//! drained after every call.

use bytes::Bytes;
use flate2::Compression;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crate::InjectError;

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_LG_WINDOW: u32 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
}

impl ContentEncoding {
    /// Parse a `Content-Encoding` value. `None` for encodings we cannot rewrite.
    pub fn from_header(value: Option<&str>) -> Option<Self> {
        let value = value.map(str::trim).unwrap_or("");
        if value.is_empty() || value.eq_ignore_ascii_case("identity") {
            return Some(ContentEncoding::Identity);
        }
        if value.eq_ignore_ascii_case("gzip") || value.eq_ignore_ascii_case("x-gzip") {
            return Some(ContentEncoding::Gzip);
        }
        if value.eq_ignore_ascii_case("deflate") {
            return Some(ContentEncoding::Deflate);
        }
        if value.eq_ignore_ascii_case("br") {
            return Some(ContentEncoding::Brotli);
        }
        None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentEncoding::Identity => "identity",
            ContentEncoding::Gzip => "gzip",
            ContentEncoding::Deflate => "deflate",
            ContentEncoding::Brotli => "br",
        }
    }
}

/// Output sink shared between a codec and its owner
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn take(&self) -> Bytes {
        let mut inner = self.0.lock().unwrap_or_else(|p| p.into_inner());
        Bytes::from(std::mem::take(&mut *inner))
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Decoder {
    Identity,
    Gzip(flate2::write::GzDecoder<SharedBuf>),
    Deflate(flate2::write::ZlibDecoder<SharedBuf>),
    Brotli(Box<brotli::DecompressorWriter<SharedBuf>>),
}

enum Encoder {
    Identity,
    Gzip(flate2::write::GzEncoder<SharedBuf>),
    Deflate(flate2::write::ZlibEncoder<SharedBuf>),
    Brotli(Box<brotli::CompressorWriter<SharedBuf>>),
}

/// Streaming decoder + encoder pair for one encoding
pub struct Transcoder {
    encoding: ContentEncoding,
    decoder: Option<Decoder>,
    decoded: SharedBuf,
    encoder: Option<Encoder>,
    encoded: SharedBuf,
}

impl Transcoder {
    pub fn new(encoding: ContentEncoding) -> Self {
        let decoded = SharedBuf::default();
        let encoded = SharedBuf::default();

        let (decoder, encoder) = match encoding {
            ContentEncoding::Identity => (Decoder::Identity, Encoder::Identity),
            ContentEncoding::Gzip => (
                Decoder::Gzip(flate2::write::GzDecoder::new(decoded.clone())),
                Encoder::Gzip(flate2::write::GzEncoder::new(
                    encoded.clone(),
                    Compression::default(),
                )),
            ),
            ContentEncoding::Deflate => (
                Decoder::Deflate(flate2::write::ZlibDecoder::new(decoded.clone())),
                Encoder::Deflate(flate2::write::ZlibEncoder::new(
                    encoded.clone(),
                    Compression::default(),
                )),
            ),
            ContentEncoding::Brotli => (
                Decoder::Brotli(Box::new(brotli::DecompressorWriter::new(
                    decoded.clone(),
                    BROTLI_BUFFER_SIZE,
                ))),
                Encoder::Brotli(Box::new(brotli::CompressorWriter::new(
                    encoded.clone(),
                    BROTLI_BUFFER_SIZE,
                    BROTLI_QUALITY,
                    BROTLI_LG_WINDOW,
                ))),
            ),
        };

        Self {
            encoding,
            decoder: Some(decoder),
            decoded,
            encoder: Some(encoder),
            encoded,
        }
    }

    pub fn encoding(&self) -> ContentEncoding {
        self.encoding
    }

    fn decode_error(&self, source: io::Error) -> InjectError {
        InjectError::Decode {
            encoding: self.encoding.as_str(),
            source,
        }
    }

    fn encode_error(&self, source: io::Error) -> InjectError {
        InjectError::Encode {
            encoding: self.encoding.as_str(),
            source,
        }
    }

    pub fn decode(&mut self, input: &[u8]) -> Result<Bytes, InjectError> {
        let result = match self.decoder.as_mut() {
            None | Some(Decoder::Identity) => return Ok(Bytes::copy_from_slice(input)),
            Some(Decoder::Gzip(d)) => d.write_all(input).and_then(|_| d.flush()),
            Some(Decoder::Deflate(d)) => d.write_all(input).and_then(|_| d.flush()),
            Some(Decoder::Brotli(d)) => d.write_all(input).and_then(|_| d.flush()),
        };
        result.map_err(|e| self.decode_error(e))?;
        Ok(self.decoded.take())
    }

    /// Flush whatever the decoder still holds at end of input
    pub fn finish_decode(&mut self) -> Result<Bytes, InjectError> {
        let result = match self.decoder.take() {
            None | Some(Decoder::Identity) => Ok(()),
            Some(Decoder::Gzip(d)) => d.finish().map(drop),
            Some(Decoder::Deflate(d)) => d.finish().map(drop),
            Some(Decoder::Brotli(mut d)) => d.flush(),
        };
        result.map_err(|e| self.decode_error(e))?;
        Ok(self.decoded.take())
    }

    pub fn encode(&mut self, input: &[u8]) -> Result<Bytes, InjectError> {
        if input.is_empty() {
            return Ok(Bytes::new());
        }
        let result = match self.encoder.as_mut() {
            None | Some(Encoder::Identity) => return Ok(Bytes::copy_from_slice(input)),
            // Flushed per chunk so the rewritten body keeps streaming
            Some(Encoder::Gzip(e)) => e.write_all(input).and_then(|_| e.flush()),
            Some(Encoder::Deflate(e)) => e.write_all(input).and_then(|_| e.flush()),
            Some(Encoder::Brotli(e)) => e.write_all(input).and_then(|_| e.flush()),
        };
        result.map_err(|e| self.encode_error(e))?;
        Ok(self.encoded.take())
    }

    /// Write the encoder trailer
    pub fn finish_encode(&mut self) -> Result<Bytes, InjectError> {
        let result = match self.encoder.take() {
            None | Some(Encoder::Identity) => Ok(()),
            Some(Encoder::Gzip(e)) => e.finish().map(drop),
            Some(Encoder::Deflate(e)) => e.finish().map(drop),
            Some(Encoder::Brotli(e)) => {
                // Finalizes the stream
                drop((*e).into_inner());
                Ok(())
            }
        };
        result.map_err(|e| self.encode_error(e))?;
        Ok(self.encoded.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_encoded_chunks_are_usable_before_finish() {
        for encoding in [
            ContentEncoding::Gzip,
            ContentEncoding::Deflate,
            ContentEncoding::Brotli,
        ] {
            let mut encoder = Transcoder::new(encoding);
            let mut decoder = Transcoder::new(encoding);

            let first = encoder.encode(b"<html><head>").unwrap();
            assert!(!first.is_empty(), "{:?} held back the first chunk", encoding);
            assert_eq!(&decoder.decode(&first).unwrap()[..], b"<html><head>");

            let second = encoder.encode(b"<title>t</title>").unwrap();
            assert_eq!(&decoder.decode(&second).unwrap()[..], b"<title>t</title>");
        }
    }

    #[test]
    fn test_from_header() {
        assert_eq!(ContentEncoding::from_header(None), Some(ContentEncoding::Identity));
        assert_eq!(ContentEncoding::from_header(Some("GZIP")), Some(ContentEncoding::Gzip));
        assert_eq!(ContentEncoding::from_header(Some("br")), Some(ContentEncoding::Brotli));
        assert_eq!(ContentEncoding::from_header(Some("zstd")), None);
        assert_eq!(ContentEncoding::from_header(Some("gzip, br")), None);
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut e = flate2::write::GzEncoder::new(Vec::new(), Compression::default());
        e.write_all(data).unwrap();
        e.finish().unwrap()
    }

    #[test]
    fn test_gzip_transcode_in_small_chunks() {
        let compressed = gzip(b"hello world, hello world");
        let mut t = Transcoder::new(ContentEncoding::Gzip);

        let mut decoded = Vec::new();
        for chunk in compressed.chunks(3) {
            decoded.extend_from_slice(&t.decode(chunk).unwrap());
        }
        decoded.extend_from_slice(&t.finish_decode().unwrap());
        assert_eq!(decoded, b"hello world, hello world");

        let mut encoded = t.encode(&decoded).unwrap().to_vec();
        encoded.extend_from_slice(&t.finish_encode().unwrap());

        let mut roundtrip = String::new();
        flate2::read::GzDecoder::new(&encoded[..])
            .read_to_string(&mut roundtrip)
            .unwrap();
        assert_eq!(roundtrip, "hello world, hello world");
    }

    #[test]
    fn test_brotli_reencode_is_readable() {
        let mut t = Transcoder::new(ContentEncoding::Brotli);
        let mut encoded = t.encode(b"<head></head>").unwrap().to_vec();
        encoded.extend_from_slice(&t.finish_encode().unwrap());

        let mut out = Vec::new();
        brotli::Decompressor::new(&encoded[..], 4096)
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"<head></head>");
    }

    #[test]
    fn test_corrupt_gzip_is_decode_error() {
        let mut t = Transcoder::new(ContentEncoding::Gzip);
        let result = t
            .decode(b"definitely not gzip data at all")
            .and_then(|_| t.finish_decode());
        assert!(matches!(result, Err(InjectError::Decode { .. })));
    }
}
