//! Gzip handling for downloaded dumps

use crate::error::Result;
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::debug;

/// Decompress `src` into `dest`, returning the decompressed size
///
/// Concatenated gzip members (as produced by parallel compressors) are read
/// through to the end. Blocking; run it on a blocking task.
pub fn gunzip_file(src: &Path, dest: &Path) -> Result<u64> {
    let mut decoder = MultiGzDecoder::new(BufReader::new(File::open(src)?));
    let mut writer = BufWriter::new(File::create(dest)?);
    let bytes = std::io::copy(&mut decoder, &mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    debug!(src = %src.display(), dest = %dest.display(), bytes, "Decompressed dump");
    Ok(bytes)
}

pub fn is_gzip_url(url: &str) -> bool {
    url.split(['?', '#'])
        .next()
        .is_some_and(|path| path.ends_with(".gz"))
}
