//! `multipart/form-data` bodies with a length known before the first byte.
//!
//! # Design
//! A streamed upload must announce `Content-Length` up front, so the byte
//! layout is computed from part metadata alone by `content_length`, and
//! `MultipartStream` produces exactly that layout on demand:
//!
//! ```text
//! --B\r\n
//! Content-Disposition: form-data; name="n"; filename="f"\r\n
//! Content-Type: m\r\n
//! \r\n
//! <payload>\r\n
//! ... (per part)
//! --B--\r\n
//! ```
//!
//! File-backed parts carry their declared length and are opened only when the
//! stream reaches them. A file that turns out shorter than declared is a read
//! error, never truncated output.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use crate::error::SerializationError;
use crate::serializer::MIME_JSON;

const CRLF: &[u8] = b"\r\n";

/// Where a part's payload comes from.
#[derive(Debug, Clone)]
pub enum PartSource {
    Data(Bytes),
    File(PathBuf),
}

/// One part of a multipart body.
#[derive(Debug, Clone)]
pub struct MultipartPart {
    name: String,
    file_name: Option<String>,
    mime_type: Option<String>,
    source: PartSource,
    length: u64,
}

impl MultipartPart {
    /// In-memory part.
    pub fn data(
        data: impl Into<Bytes>,
        name: &str,
        file_name: Option<&str>,
        mime_type: Option<&str>,
    ) -> Self {
        let data = data.into();
        Self {
            name: name.to_string(),
            file_name: file_name.map(str::to_string),
            mime_type: mime_type.map(str::to_string),
            length: data.len() as u64,
            source: PartSource::Data(data),
        }
    }

    /// In-memory part holding the JSON encoding of `value`.
    pub fn json(value: &serde_json::Value, name: &str) -> Result<Self, SerializationError> {
        let data = serde_json::to_vec(value)?;
        Ok(Self::data(data, name, None, Some(MIME_JSON)))
    }

    /// File-backed part. The length is taken from the file's metadata now,
    /// the file itself is only opened while streaming.
    pub fn file(path: impl AsRef<Path>, name: &str) -> io::Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        let mime_type = mime_guess::from_path(path).first_or_octet_stream();
        Ok(Self::file_with_length(
            path,
            metadata.len(),
            name,
            file_name.as_deref(),
            mime_type.essence_str(),
        ))
    }

    /// File-backed part with a caller-supplied length.
    pub fn file_with_length(
        path: impl Into<PathBuf>,
        length: u64,
        name: &str,
        file_name: Option<&str>,
        mime_type: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            file_name: file_name.map(str::to_string),
            mime_type: Some(mime_type.to_string()),
            source: PartSource::File(path.into()),
            length,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    pub fn source(&self) -> &PartSource {
        &self.source
    }

    /// Declared payload length in bytes.
    pub fn content_size(&self) -> u64 {
        self.length
    }

    /// Per-part header lines, each terminated by CRLF.
    pub fn headers(&self) -> String {
        let mut headers = format!(
            "Content-Disposition: form-data; name=\"{}\"",
            quote(&self.name)
        );
        if let Some(file_name) = &self.file_name {
            let _ = write!(headers, "; filename=\"{}\"", quote(file_name));
        }
        headers.push_str("\r\n");
        if let Some(mime_type) = &self.mime_type {
            let _ = write!(headers, "Content-Type: {mime_type}\r\n");
        }
        headers
    }

    /// Everything that precedes the payload: delimiter, headers, blank line.
    fn preamble(&self, boundary: &str) -> String {
        format!("--{boundary}\r\n{}\r\n", self.headers())
    }
}

fn quote(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

fn trailer(boundary: &str) -> String {
    format!("--{boundary}--\r\n")
}

/// Fresh random boundary.
pub fn generate_boundary() -> String {
    format!("Boundary+{}", Uuid::new_v4().simple())
}

/// Exact number of bytes `MultipartStream` produces for `parts`.
pub fn content_length(parts: &[MultipartPart], boundary: &str) -> u64 {
    let parts_len: u64 = parts
        .iter()
        .map(|part| part.preamble(boundary).len() as u64 + part.length + CRLF.len() as u64)
        .sum();
    parts_len + trailer(boundary).len() as u64
}

/// A multipart body ready for transmission: parts, boundary and precomputed
/// length. Each call to `stream` starts a new, independent stream.
#[derive(Debug, Clone)]
pub struct MultipartBody {
    boundary: String,
    parts: Arc<[MultipartPart]>,
    content_length: u64,
}

impl MultipartBody {
    pub fn new(parts: Vec<MultipartPart>, boundary: impl Into<String>) -> Self {
        let boundary = boundary.into();
        let content_length = content_length(&parts, &boundary);
        Self {
            boundary,
            parts: parts.into(),
            content_length,
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn parts(&self) -> &[MultipartPart] {
        &self.parts
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub fn stream(&self) -> MultipartStream {
        MultipartStream::new(&self.parts, &self.boundary)
    }
}

#[derive(Debug)]
enum Segment {
    Bytes(Bytes),
    File { path: PathBuf, length: u64 },
}

/// Lazy, forward-only reader over a multipart body.
#[derive(Debug)]
pub struct MultipartStream {
    segments: Vec<Segment>,
    index: usize,
    offset: u64,
    position: u64,
    file: Option<File>,
}

impl MultipartStream {
    pub fn new(parts: &[MultipartPart], boundary: &str) -> Self {
        let mut segments = Vec::with_capacity(parts.len() * 3 + 1);
        for part in parts {
            segments.push(Segment::Bytes(Bytes::from(part.preamble(boundary))));
            segments.push(match &part.source {
                PartSource::Data(data) => Segment::Bytes(data.clone()),
                PartSource::File(path) => Segment::File {
                    path: path.clone(),
                    length: part.length,
                },
            });
            segments.push(Segment::Bytes(Bytes::from_static(CRLF)));
        }
        segments.push(Segment::Bytes(Bytes::from(trailer(boundary))));
        Self {
            segments,
            index: 0,
            offset: 0,
            position: 0,
            file: None,
        }
    }

    /// Bytes produced so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_finished(&self) -> bool {
        self.index >= self.segments.len()
    }

    fn advance(&mut self) {
        self.index += 1;
        self.offset = 0;
        self.file = None;
    }

    /// Reads from the current segment. `Ok(0)` means the segment is exhausted.
    fn read_segment(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.segments[self.index] {
            Segment::Bytes(bytes) => {
                let start = self.offset as usize;
                let n = buf.len().min(bytes.len() - start);
                buf[..n].copy_from_slice(&bytes[start..start + n]);
                self.offset += n as u64;
                Ok(n)
            }
            Segment::File { path, length } => {
                let remaining = length - self.offset;
                if remaining == 0 {
                    return Ok(0);
                }
                if self.file.is_none() {
                    let file = File::open(path).map_err(|e| {
                        io::Error::new(e.kind(), format!("cannot open {}: {e}", path.display()))
                    })?;
                    self.file = Some(file);
                }
                let limit = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                let n = match self.file.as_mut() {
                    Some(file) => file.read(&mut buf[..limit])?,
                    None => 0,
                };
                if n == 0 {
                    self.file = None;
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "{} ended {remaining} bytes before its declared length",
                            path.display()
                        ),
                    ));
                }
                self.offset += n as u64;
                if self.offset == *length {
                    self.file = None;
                }
                Ok(n)
            }
        }
    }
}

impl Read for MultipartStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() && !self.is_finished() {
            match self.read_segment(&mut buf[written..]) {
                Ok(0) => self.advance(),
                Ok(n) => written += n,
                // Hand back what was produced; the error recurs on the next read.
                Err(_) if written > 0 => break,
                Err(e) => return Err(e),
            }
        }
        self.position += written as u64;
        Ok(written)
    }
}
