//! Content-Encoding (Cenc) decoding of completed objects.

use crate::common::lct::Cenc;
use crate::tools::error::{FluteError, Result};
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use std::io::Read;

/// Decode a fully reconstructed object according to its content encoding.
/// `Cenc::Null` returns the input unchanged.
pub fn decompress(cenc: Cenc, data: Vec<u8>) -> Result<Vec<u8>> {
    match cenc {
        Cenc::Null => Ok(data),
        Cenc::Zlib => read_all(ZlibDecoder::new(data.as_slice())),
        Cenc::Deflate => read_all(DeflateDecoder::new(data.as_slice())),
        Cenc::Gzip => read_all(GzDecoder::new(data.as_slice())),
    }
}

fn read_all<R: Read>(mut reader: R) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    reader
        .read_to_end(&mut out)
        .map_err(|e| FluteError::new(format!("content decoding failed: {}", e)))?;
    Ok(out)
}
