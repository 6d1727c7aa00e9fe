//! tar.gz to a single concatenated text file with per-file headers,
//! optional line numbers, truncation markers and secret masking.

use std::io::{BufRead, BufReader, Cursor, Read, Write};

use flate2::read::GzDecoder;
use tar::Archive;

use super::{read_sample, strip_first_dir, ExporterError, TEXT_SAMPLE_BYTES};
use crate::matcher::{is_binary_sample, normalize_rel, PathFilter};
use crate::secrets::{Scanner, SecretReport};
use crate::types::SecretStrategy;

#[derive(Debug, Clone)]
pub struct TxtOptions {
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub strip_first_dir: bool,
    /// Prefix each data line with `"<n>\t"`.
    pub line_numbers: bool,
    /// Header before each file; `{path}` and `{n}` are substituted.
    pub header_template: String,
    /// Per-file line cap; zero disables truncation.
    pub max_lines_per_file: usize,
    /// Cap on the output size in megabytes; zero disables it.
    pub max_export_mb: u32,
    /// Binary-looking files are always skipped on this path.
    pub skip_binaries: bool,
    pub secret_scan: bool,
    pub secret_strategy: SecretStrategy,
}

impl Default for TxtOptions {
    fn default() -> Self {
        Self {
            include_globs: Vec::new(),
            exclude_globs: Vec::new(),
            strip_first_dir: true,
            line_numbers: false,
            header_template: "=== FILE: {path} (first {n} lines) ===".to_string(),
            max_lines_per_file: 0,
            max_export_mb: 0,
            skip_binaries: true,
            secret_scan: false,
            secret_strategy: SecretStrategy::Redacted,
        }
    }
}

/// What the transformation produced.
#[derive(Debug)]
pub struct TxtOutcome {
    pub files_written: usize,
    pub masked_lines: usize,
    pub secrets: Option<SecretReport>,
}

struct LimitedOut<'a, W: Write> {
    dst: &'a mut W,
    written: u64,
    limit: u64,
}

impl<W: Write> LimitedOut<'_, W> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ExporterError> {
        if bytes.is_empty() {
            return Ok(());
        }
        if self.limit > 0 && self.written + bytes.len() as u64 > self.limit {
            return Err(ExporterError::TooLarge);
        }
        self.dst.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }
}

/// Convert a tar.gz stream into the concatenated text artifact.
///
/// For each admitted file the first `max_lines_per_file` lines are buffered
/// so the header can state the actual line count before the content.
pub fn build_txt_from_targz<R: Read, W: Write>(
    src: R,
    dst: &mut W,
    opts: &TxtOptions,
) -> Result<TxtOutcome, ExporterError> {
    let filter = PathFilter::new(&opts.include_globs, &opts.exclude_globs);
    let mut scanner = opts.secret_scan.then(|| Scanner::new(opts.secret_strategy));

    let mut archive = Archive::new(GzDecoder::new(src));
    let mut out = LimitedOut {
        dst,
        written: 0,
        limit: u64::from(opts.max_export_mb) * 1024 * 1024,
    };

    let mut files_written = 0usize;
    let mut masked_lines = 0usize;

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let name = if opts.strip_first_dir {
            match strip_first_dir(&raw) {
                Some(rest) => rest.to_string(),
                None => continue,
            }
        } else {
            raw
        };
        let Ok(rel) = normalize_rel(&name) else {
            continue;
        };
        if !filter.matches_normalized(&rel) {
            continue;
        }

        let size = entry.size();
        let want = TEXT_SAMPLE_BYTES.min(size as usize);
        let sample = read_sample(&mut entry, want)?;
        if sample.len() < want {
            continue;
        }
        if opts.skip_binaries && is_binary_sample(&sample) {
            continue;
        }

        // Replay the sample ahead of the unread tail of the entry.
        let mut reader = BufReader::with_capacity(64 * 1024, Cursor::new(sample).chain(&mut entry));
        let mut buf = String::new();
        let mut lines = 0usize;
        let mut truncated = false;
        let mut read_failed = false;
        let mut raw_line = Vec::new();

        loop {
            raw_line.clear();
            match reader.read_until(b'\n', &mut raw_line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(_) => {
                    read_failed = true;
                    break;
                }
            }
            let mut text = String::from_utf8_lossy(&raw_line).into_owned();
            if text.ends_with('\n') {
                text.pop();
                if text.ends_with('\r') {
                    text.pop();
                }
            }

            let out_line = match scanner.as_mut() {
                Some(scanner) => {
                    let (masked, changed) = scanner.mask_line(&rel, &text, lines + 1);
                    if changed {
                        masked_lines += 1;
                    }
                    masked
                }
                None => text,
            };

            lines += 1;
            if opts.line_numbers {
                buf.push_str(&format!("{lines}\t{out_line}\n"));
            } else {
                buf.push_str(&out_line);
                buf.push('\n');
            }

            if opts.max_lines_per_file > 0 && lines >= opts.max_lines_per_file {
                truncated = true;
                break;
            }
        }
        // The entries iterator drains whatever the reader left unread.
        drop(reader);
        if read_failed {
            continue;
        }

        let header = opts
            .header_template
            .replace("{path}", &rel)
            .replace("{n}", &lines.to_string());
        out.write_all(header.as_bytes())?;
        out.write_all(b"\n")?;
        out.write_all(buf.as_bytes())?;
        if truncated {
            out.write_all("… (truncated)\n".as_bytes())?;
        }
        out.write_all(b"\n")?;
        files_written += 1;
    }

    Ok(TxtOutcome {
        files_written,
        masked_lines,
        secrets: scanner.map(|s| s.report()),
    })
}
