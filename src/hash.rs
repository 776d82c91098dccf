//! SHA1 helpers for corpus deduplication and crash file naming.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use libafl_bolts::Error;
use sha1::{Digest, Sha1};

/// Uppercase hex SHA1 digest of `buf`.
pub fn sha1_hex(buf: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(buf);
    hex::encode_upper(hasher.finalize())
}

/// Uppercase hex SHA1 digest of the first `len` bytes of the file at `path`.
pub fn sha1_file(path: &Path, len: usize) -> Result<String, Error> {
    let mut buf = Vec::with_capacity(len);
    File::open(path)?.take(len as u64).read_to_end(&mut buf)?;
    Ok(sha1_hex(&buf))
}
