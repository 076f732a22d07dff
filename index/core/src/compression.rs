//! Snappy helpers for compressed value storage.

use bytes::Bytes;

/// Compress `src` with snappy.
///
/// Returns `None` if compression fails (snappy's raw format can refuse
/// oversized inputs).
pub fn deflate(src: &[u8]) -> Option<Bytes> {
    snap::raw::Encoder::new()
        .compress_vec(src)
        .ok()
        .map(Bytes::from)
}

/// Decompress a snappy buffer into its original bytes.
///
/// Returns `None` if `src` is not valid snappy data.
pub fn inflate(src: &[u8]) -> Option<Bytes> {
    snap::raw::Decoder::new()
        .decompress_vec(src)
        .ok()
        .map(Bytes::from)
}

/// Read the uncompressed length from a snappy buffer's header without
/// decompressing it.
pub fn uncompressed_length(src: &[u8]) -> Option<usize> {
    snap::raw::decompress_len(src).ok()
}
