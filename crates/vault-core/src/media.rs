//! Media type sniffing and declared-type validation.
//!
//! Sniffing looks only at the head of the stream kept by the hasher. The
//! declared type passes when its base type (`image`, `text`, ...) matches
//! the sniffed one; subtypes are not compared.

use crate::error::{Result, VaultError};

pub const OCTET_STREAM: &str = "application/octet-stream";
pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Office Open XML documents are zip archives on disk.
const ZIP_CONTAINERS: &[&str] = &[
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "application/epub+zip",
    "application/java-archive",
];

/// Exact prefix signatures, checked in order
const SIGNATURES: &[(&[u8], &str)] = &[
    (b"%PDF-", "application/pdf"),
    (b"%!PS-Adobe-", "application/postscript"),
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xFF\xD8\xFF", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"BM", "image/bmp"),
    (b"\x00\x00\x01\x00", "image/x-icon"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x1F\x8B\x08", "application/x-gzip"),
    (b"Rar!\x1A\x07", "application/x-rar-compressed"),
    (b"7z\xBC\xAF\x27\x1C", "application/x-7z-compressed"),
    (b"OggS\x00", "application/ogg"),
    (b"ID3", "audio/mpeg"),
    (b"fLaC", "audio/flac"),
    (b"\x1A\x45\xDF\xA3", "video/webm"),
    (b"wOFF", "font/woff"),
    (b"wOF2", "font/woff2"),
    (b"\x00asm", "application/wasm"),
];

/// Tags that mark a document as HTML when they open it
const HTML_TAGS: &[&[u8]] = &[
    b"<!DOCTYPE HTML",
    b"<HTML",
    b"<HEAD",
    b"<SCRIPT",
    b"<IFRAME",
    b"<H1",
    b"<DIV",
    b"<FONT",
    b"<TABLE",
    b"<A",
    b"<STYLE",
    b"<TITLE",
    b"<B",
    b"<BODY",
    b"<BR",
    b"<P",
    b"<!--",
];

/// Best guess at the media type of a stream from its first bytes.
///
/// Falls back to `text/plain` for byte sequences without control
/// characters, and `application/octet-stream` for everything else.
pub fn sniff(head: &[u8]) -> &'static str {
    for &(magic, media_type) in SIGNATURES {
        if head.starts_with(magic) {
            return media_type;
        }
    }

    if head.len() >= 12 && &head[..4] == b"RIFF" {
        match &head[8..12] {
            b"WEBP" => return "image/webp",
            b"WAVE" => return "audio/wave",
            b"AVI " => return "video/avi",
            _ => {}
        }
    }
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        return "video/mp4";
    }

    if head.starts_with(b"\xFE\xFF") {
        return "text/plain; charset=utf-16be";
    }
    if head.starts_with(b"\xFF\xFE") {
        return "text/plain; charset=utf-16le";
    }
    let head = head.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(head);

    let text = trim_leading_whitespace(head);
    if HTML_TAGS.iter().any(|tag| opens_with_tag(text, tag)) {
        return "text/html; charset=utf-8";
    }
    if text.starts_with(b"<?xml") {
        return "text/xml; charset=utf-8";
    }

    if head.iter().any(|&b| is_binary_byte(b)) {
        return OCTET_STREAM;
    }
    if matches!(text.first(), Some(b'{') | Some(b'[')) {
        return "application/json";
    }
    TEXT_PLAIN
}

fn trim_leading_whitespace(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !matches!(b, b'\t' | b'\n' | b'\x0C' | b'\r' | b' '))
        .unwrap_or(data.len());
    &data[start..]
}

/// Case-insensitive tag match followed by a space or `>`.
fn opens_with_tag(data: &[u8], tag: &[u8]) -> bool {
    if data.len() <= tag.len() || !data[..tag.len()].eq_ignore_ascii_case(tag) {
        return false;
    }
    matches!(data[tag.len()], b' ' | b'>')
}

fn is_binary_byte(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F)
}

/// `type/subtype` in lowercase, parameters dropped.
pub fn essence(media_type: &str) -> String {
    media_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Top-level type (`image` for `image/png`).
pub fn base_type(media_type: &str) -> String {
    let essence = essence(media_type);
    match essence.split_once('/') {
        Some((base, _)) => base.to_string(),
        None => essence,
    }
}

/// Whether content sniffed as `sniffed` may be stored as `declared`.
pub fn is_compatible(declared: &str, sniffed: &str) -> bool {
    if base_type(declared) == base_type(sniffed) {
        return true;
    }
    let declared = essence(declared);
    let sniffed = essence(sniffed);
    if sniffed == "application/zip" && ZIP_CONTAINERS.contains(&declared.as_str()) {
        return true;
    }
    // JSON is text to anyone who declares it so
    sniffed == "application/json" && base_type(&declared) == "text"
}

/// Decide the media type to record for an upload.
///
/// A missing, blank, or `application/octet-stream` declaration takes the
/// sniffed type. Otherwise the declaration is kept if `verify` is off or
/// it is compatible with the sniffed type.
pub fn resolve(declared: Option<&str>, head: &[u8], verify: bool) -> Result<String> {
    let sniffed = sniff(head);
    let declared = declared.map(str::trim).filter(|d| !d.is_empty());

    let Some(declared) = declared else {
        return Ok(sniffed.to_string());
    };
    if essence(declared) == OCTET_STREAM {
        return Ok(sniffed.to_string());
    }
    if !essence(declared).contains('/') {
        return Err(VaultError::ValidationFailed(format!(
            "malformed media type {declared:?}"
        )));
    }

    if verify && !is_compatible(declared, sniffed) {
        return Err(VaultError::ValidationFailed(format!(
            "file content mismatch: declared as {declared}, but detected as {sniffed}"
        )));
    }
    Ok(declared.to_string())
}
