//! Reading profiles back, compressed or not.

use std::fs;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use pprof::protos::{Message, Profile};

use crate::domain::WriteError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Decode pprof protobuf bytes, gunzipping them first when they carry the
/// gzip magic.
///
/// # Errors
/// Returns [`WriteError::DecodeFailed`] for corrupt gzip or protobuf data.
pub fn decode_profile(bytes: &[u8]) -> Result<Profile, WriteError> {
    if bytes.starts_with(&GZIP_MAGIC) {
        let mut raw = Vec::new();
        GzDecoder::new(bytes)
            .read_to_end(&mut raw)
            .map_err(|e| WriteError::DecodeFailed(format!("gzip: {e}")))?;
        return Profile::decode(raw.as_slice()).map_err(|e| WriteError::DecodeFailed(e.to_string()));
    }
    Profile::decode(bytes).map_err(|e| WriteError::DecodeFailed(e.to_string()))
}

/// Read and decode a profile file.
///
/// # Errors
/// Returns [`WriteError::Io`] when the file cannot be read, otherwise see
/// [`decode_profile`].
pub fn load_profile(path: &Path) -> Result<Profile, WriteError> {
    decode_profile(&fs::read(path)?)
}
