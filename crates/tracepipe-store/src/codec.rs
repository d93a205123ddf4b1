use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{Read, Write};

use tracepipe_types::IngressEvent;

use crate::{Error, Result};

/// Codec byte for zlib-compressed JSON arrays. Recorded per batch so readers
/// dispatch on the stored byte, not on an assumption.
pub const CODEC_ZLIB: u8 = 1;

/// Compress a batch of events into `(codec_version, blob)`
pub fn compress_events(events: &[IngressEvent]) -> Result<(u8, Vec<u8>)> {
    let json = serde_json::to_vec(events)?;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let blob = encoder.finish()?;

    Ok((CODEC_ZLIB, blob))
}

/// Decompress a stored blob back into its events, dispatching on the codec byte
pub fn decompress_events(codec_version: u8, blob: &[u8]) -> Result<Vec<IngressEvent>> {
    match codec_version {
        CODEC_ZLIB => {
            let mut decoder = ZlibDecoder::new(blob);
            let mut json = Vec::new();
            decoder.read_to_end(&mut json)?;
            Ok(serde_json::from_slice(&json)?)
        }
        other => Err(Error::Corrupt(format!("unknown codec version {}", other))),
    }
}
