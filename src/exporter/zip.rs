//! tar.gz to filtered ZIP: regular files only, include/exclude globs,
//! binary dropping for oversized entries, cumulative size guard.

use std::io::{self, Read, Seek, Write};

use flate2::read::GzDecoder;
use tar::Archive;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::{read_sample, strip_first_dir, ExporterError, ZIP_SAMPLE_BYTES};
use crate::matcher::{is_binary_sample, is_too_large, normalize_rel, PathFilter};

#[derive(Debug, Clone)]
pub struct ZipOptions {
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
    /// Entries larger than this are sample-tested and dropped when they
    /// look binary. Zero disables the check.
    pub max_binary_size_mb: u32,
    /// Cumulative cap over the declared sizes of admitted entries. Zero
    /// disables the cap.
    pub max_export_mb: u32,
    /// Entries with longer normalized paths are dropped silently.
    pub max_filename_len: usize,
    /// Drop the `repo-<sha>/` prefix GitHub tarballs carry.
    pub strip_first_dir: bool,
}

impl Default for ZipOptions {
    fn default() -> Self {
        Self {
            include_globs: Vec::new(),
            exclude_globs: Vec::new(),
            max_binary_size_mb: 0,
            max_export_mb: 200,
            max_filename_len: 255,
            strip_first_dir: true,
        }
    }
}

/// Convert a tar.gz stream into a ZIP, applying the filters. Memory stays
/// O(1): each file streams from tar straight into the deflate entry.
pub fn build_zip_from_targz<R: Read, W: Write + Seek>(
    src: R,
    dst: W,
    opts: &ZipOptions,
) -> Result<(), ExporterError> {
    let filter = PathFilter::new(&opts.include_globs, &opts.exclude_globs);
    let mut archive = Archive::new(GzDecoder::new(src));
    let mut zip = ZipWriter::new(dst);
    let entry_options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut total: u64 = 0;
    let limit = u64::from(opts.max_export_mb) * 1024 * 1024;

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let name = if opts.strip_first_dir {
            match strip_first_dir(&raw) {
                Some(rest) => rest.to_string(),
                // A bare top-level name is unexpected in a forge tarball.
                None => continue,
            }
        } else {
            raw
        };

        let Ok(rel) = normalize_rel(&name) else {
            continue;
        };
        if opts.max_filename_len > 0 && rel.len() > opts.max_filename_len {
            continue;
        }
        if !filter.matches_normalized(&rel) {
            continue;
        }

        let size = entry.size();
        if limit > 0 && total + size > limit {
            return Err(ExporterError::TooLarge);
        }

        // Only entries above the binary threshold pay for a sample test.
        let mut sample = Vec::new();
        if opts.max_binary_size_mb > 0 && is_too_large(size, opts.max_binary_size_mb) {
            let want = ZIP_SAMPLE_BYTES.min(size as usize);
            sample = read_sample(&mut entry, want)?;
            if sample.len() < want {
                continue;
            }
            if is_binary_sample(&sample) {
                continue;
            }
        }

        zip.start_file(rel, entry_options)?;
        if !sample.is_empty() {
            zip.write_all(&sample)?;
        }
        io::copy(&mut entry, &mut zip)?;
        total += size;
    }

    zip.finish()?;
    Ok(())
}
