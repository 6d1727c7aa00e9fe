//! Streaming transformers: a single tar.gz pass (two for prompt packs)
//! turns the upstream archive into the requested artifact with O(1)
//! steady-state memory and strict output-size guards.

pub mod promptpack;
pub mod txt;
pub mod zip;

use std::io::{self, Read};

use thiserror::Error;

pub use promptpack::{scan_tar_gz, PromptPackOptions, PromptPackScan, PromptPackStats};
pub use txt::{build_txt_from_targz, TxtOptions, TxtOutcome};
pub use zip::{build_zip_from_targz, ZipOptions};

/// Bytes sampled from each entry for the binary heuristic.
pub(crate) const ZIP_SAMPLE_BYTES: usize = 8192;
pub(crate) const TEXT_SAMPLE_BYTES: usize = 4096;

/// Transformer failures. `TooLarge` is terminal for the job; bad names are
/// dropped silently inside the archive paths.
#[derive(Debug, Error)]
pub enum ExporterError {
    #[error("export too large")]
    TooLarge,
    #[error("bad filename")]
    BadName,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("zip write failed: {0}")]
    Zip(#[from] ::zip::result::ZipError),
}

impl ExporterError {
    /// Whether this error should fail the job terminally (vs. retry).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::TooLarge | Self::BadName)
    }
}

/// Drop the leading path segment GitHub tarballs carry (`repo-<sha>/...`).
/// `None` when there is no separator at all.
pub(crate) fn strip_first_dir(name: &str) -> Option<&str> {
    name.split_once('/').map(|(_, rest)| rest)
}

/// Read up to `n` bytes. A short result means the stream ended early.
pub(crate) fn read_sample(r: &mut impl Read, n: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        let read = r.read(&mut buf[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Read the remainder of a stream into a lossily-decoded string, capped at
/// `cap` bytes.
pub(crate) fn read_capped(r: &mut impl Read, cap: usize) -> String {
    let mut buf = Vec::with_capacity(cap.min(64 * 1024));
    let mut limited = r.take(cap as u64);
    let _ = limited.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_first_dir_requires_separator() {
        assert_eq!(strip_first_dir("repo-sha/src/a.rs"), Some("src/a.rs"));
        assert_eq!(strip_first_dir("repo-sha/a"), Some("a"));
        assert_eq!(strip_first_dir("loose-file"), None);
    }

    #[test]
    fn read_sample_short_stream() {
        let mut src: &[u8] = b"abc";
        let sample = read_sample(&mut src, 10).unwrap();
        assert_eq!(sample, b"abc");
    }
}
