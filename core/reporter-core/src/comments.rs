//! Appending user comments to an artifact before upload.
//!
//! The comment becomes a rich-core section encoded as one self-contained gzip
//! member and is byte-appended to the artifact. Nothing before the old end of
//! file is touched, and the appended member can be located and decoded on its
//! own, which is what the collection server does.

use crate::error::{ReporterError, Result};
use flate2::write::GzEncoder;
use flate2::{Compression, GzBuilder};
use std::io::{Read, Write};
use std::path::Path;

pub const COMMENT_SECTION_NAME: &str = "user-comments.txt";
const GZIP_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];

fn section_header() -> String {
    format!("[---rich-core: {}---]\n", COMMENT_SECTION_NAME)
}

/// Encodes `text` as a comment member. Deterministic for a given input.
pub fn encode_comment_section(text: &str) -> Result<Vec<u8>> {
    let mut encoder: GzEncoder<Vec<u8>> = GzBuilder::new()
        .filename(COMMENT_SECTION_NAME)
        .mtime(0)
        .write(Vec::new(), Compression::default());
    let mut payload = section_header();
    payload.push_str(text);
    if !text.ends_with('\n') {
        payload.push('\n');
    }
    encoder
        .write_all(payload.as_bytes())
        .map_err(|err| ReporterError::io("encoding comment section", err))?;
    encoder
        .finish()
        .map_err(|err| ReporterError::io("finishing comment section", err))
}

/// Appends `text` to the artifact at `path`. Returns the number of bytes
/// written; blank comments append nothing.
pub fn append_comment(path: &Path, text: &str) -> Result<u64> {
    if text.trim().is_empty() {
        return Ok(0);
    }
    if !path.is_file() {
        return Err(ReporterError::ArtifactNotFound(path.to_path_buf()));
    }

    let section = encode_comment_section(text.trim_end())?;
    let mut file = fs_err::OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|err| ReporterError::io("opening artifact for comment", err))?;
    file.write_all(&section)
        .map_err(|err| ReporterError::io("appending comment", err))?;
    file.sync_all()
        .map_err(|err| ReporterError::io("syncing artifact", err))?;

    tracing::debug!(path = %path.display(), bytes = section.len(), "Comment appended");
    Ok(section.len() as u64)
}

/// Finds the trailing comment member in `bytes` and returns its offset and
/// text. The member must decode cleanly and end exactly at the end of input.
pub fn find_comment_trailer(bytes: &[u8]) -> Option<(usize, String)> {
    let header = section_header();
    let candidates = bytes
        .windows(GZIP_MAGIC.len())
        .enumerate()
        .filter(|(_, window)| *window == GZIP_MAGIC)
        .map(|(offset, _)| offset)
        .collect::<Vec<_>>();

    candidates.into_iter().rev().find_map(|offset| {
        let text = decode_member_to_end(&bytes[offset..])?;
        let body = text.strip_prefix(header.as_str())?;
        Some((offset, body.trim_end_matches('\n').to_string()))
    })
}

/// Reads the comment appended to the artifact at `path`, if any.
pub fn read_comment(path: &Path) -> Result<Option<String>> {
    let bytes = fs_err::read(path).map_err(|err| ReporterError::io("reading artifact", err))?;
    Ok(find_comment_trailer(&bytes).map(|(_, text)| text))
}

fn decode_member_to_end(member: &[u8]) -> Option<String> {
    let mut decoder = flate2::bufread::GzDecoder::new(member);
    let mut text = String::new();
    decoder.read_to_string(&mut text).ok()?;
    let remaining = decoder.into_inner();
    remaining.is_empty().then_some(text)
}
