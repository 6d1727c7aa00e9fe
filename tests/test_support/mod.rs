//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::io::{Cursor, Read, Write};

use flate2::write::GzEncoder;
use flate2::Compression;

/// Build a gzip-compressed tar archive the way forge tarballs look:
/// every path sits under a `repo-<sha>/` first segment.
pub fn make_tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("repo-sha/{path}"), *content)
            .expect("append tar entry");
    }
    let encoder = builder.into_inner().expect("finish tar");
    encoder.finish().expect("finish gzip")
}

/// Like `make_tar_gz`, but writes names straight into the 100-byte header
/// field, bypassing the builder's path validation. Lets tests smuggle in
/// traversal paths a hostile archive could carry.
pub fn make_tar_gz_raw_names(files: &[(&[u8], &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (raw_name, content) in files {
        assert!(raw_name.len() < 100, "raw names must fit the header field");
        let mut header = tar::Header::new_gnu();
        {
            let name = &mut header.as_old_mut().name;
            name[..raw_name.len()].copy_from_slice(raw_name);
        }
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, *content).expect("append raw entry");
    }
    let encoder = builder.into_inner().expect("finish tar");
    encoder.finish().expect("finish gzip")
}

/// Entry names of a zip archive, sorted.
pub fn zip_entry_names(bytes: &[u8]) -> Vec<String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes.to_vec())).expect("open zip");
    let mut names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).expect("zip entry").name().to_string())
        .collect();
    names.sort();
    names
}

/// Contents of one zip entry as a string.
pub fn zip_entry_content(bytes: &[u8], name: &str) -> String {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes.to_vec())).expect("open zip");
    let mut entry = archive.by_name(name).expect("zip entry by name");
    let mut out = String::new();
    entry.read_to_string(&mut out).expect("read zip entry");
    out
}

/// A file of `lines` numbered source-looking lines.
pub fn synthetic_source(lines: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for i in 0..lines {
        writeln!(out, "let value_{i:04} = compute_something({i}); // filler line").unwrap();
    }
    out
}
