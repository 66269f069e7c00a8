//! S3 multipart-upload XML documents.
//!
//! The documents are small and flat, so values are pulled out by tag
//! rather than through a full XML parser.

use crate::ProtocolError;
use crate::types::{ManifestEntry, PartInfo, PartsPage};

/// Error codes the completion logic distinguishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S3ErrorCode {
    /// A part was smaller than the minimum part size.
    EntityTooSmall,
    /// The multipart upload does not exist (finished or aborted).
    NoSuchUpload,
    Other(String),
}

impl S3ErrorCode {
    fn from_code(code: &str) -> Self {
        match code {
            "EntityTooSmall" => Self::EntityTooSmall,
            "NoSuchUpload" => Self::NoSuchUpload,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Returns the text between the first `<tag>` and the following `</tag>`.
pub fn extract<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].trim())
}

fn require<'a>(xml: &'a str, tag: &'static str) -> Result<&'a str, ProtocolError> {
    extract(xml, tag).ok_or(ProtocolError::MissingElement(tag))
}

fn parse_number<T: std::str::FromStr>(xml: &str, tag: &'static str) -> Result<T, ProtocolError> {
    let raw = require(xml, tag)?;
    raw.parse().map_err(|_| ProtocolError::InvalidValue {
        tag,
        value: raw.to_string(),
    })
}

fn as_str(body: &[u8]) -> Result<&str, ProtocolError> {
    std::str::from_utf8(body).map_err(|_| ProtocolError::NotUtf8)
}

/// Replaces the five predefined XML entities.
pub fn unescape(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Reads the upload id from an `InitiateMultipartUploadResult`.
pub fn parse_upload_id(body: &[u8]) -> Result<String, ProtocolError> {
    let xml = as_str(body)?;
    let id = require(xml, "UploadId")?;
    if id.is_empty() {
        return Err(ProtocolError::InvalidValue {
            tag: "UploadId",
            value: String::new(),
        });
    }
    Ok(unescape(id))
}

/// Parses one page of a `ListPartsResult`.
pub fn parse_parts_page(body: &[u8]) -> Result<PartsPage, ProtocolError> {
    let xml = as_str(body)?;

    let mut parts = Vec::new();
    for segment in xml.split("<Part>").skip(1) {
        let Some(end) = segment.find("</Part>") else {
            continue;
        };
        let part_xml = &segment[..end];
        parts.push(PartInfo {
            part_number: parse_number(part_xml, "PartNumber")?,
            etag: unescape(require(part_xml, "ETag")?),
            size: parse_number(part_xml, "Size")?,
        });
    }

    let is_truncated = extract(xml, "IsTruncated").is_some_and(|v| v.eq_ignore_ascii_case("true"));
    let next_marker = extract(xml, "NextPartNumberMarker")
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    Ok(PartsPage {
        parts,
        is_truncated,
        next_marker,
    })
}

/// Builds a `CompleteMultipartUpload` body, ordered by ascending part number.
pub fn complete_manifest(entries: &[ManifestEntry]) -> String {
    let mut sorted: Vec<&ManifestEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| e.part_number);

    let mut body = String::from("<CompleteMultipartUpload>");
    for entry in sorted {
        body.push_str("<Part><PartNumber>");
        body.push_str(&entry.part_number.to_string());
        body.push_str("</PartNumber><ETag>");
        body.push_str(&escape(&entry.etag));
        body.push_str("</ETag></Part>");
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

/// Returns the error code of an `<Error>` document, or `None` if the body is
/// not one.
pub fn parse_error(body: &[u8]) -> Option<S3ErrorCode> {
    let xml = std::str::from_utf8(body).ok()?;
    let error = extract(xml, "Error")?;
    let code = extract(error, "Code").unwrap_or_default();
    Some(S3ErrorCode::from_code(code))
}
