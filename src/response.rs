// src/response.rs
use std::time::SystemTime;

use crate::error::{VersoError, VersoResult};
use crate::format;
use crate::headers;
use crate::http::{self, Method, Request};
use crate::stream::Stream;

/// Capacity of the header assembly buffer. Overflowing it fails the
/// response; the cap is part of the external contract.
pub const HEADERS_LENGTH_MAX: usize = 1024;

/// Framing declared when committing the headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// Identity framing with a known Content-Length.
    Known(u64),
    /// Chunked transfer encoding.
    Chunked,
}

/// A single-use response: headers are assembled into a bounded buffer,
/// committed exactly once, and the body follows through `entity_send`.
pub struct Response {
    pub code: u16,
    headers: [u8; HEADERS_LENGTH_MAX],
    headers_length: usize,
    committed: bool,
    body_required: bool,
    length: BodyLength,
    ranges: Option<Vec<[u64; 2]>>,
    // Total identity bytes offered so far; used to slice range responses.
    cursor: u64,
}

impl Response {
    pub fn new() -> Response {
        Response {
            code: http::INTERNAL_SERVER_ERROR,
            headers: [0; HEADERS_LENGTH_MAX],
            headers_length: 0,
            committed: false,
            body_required: false,
            length: BodyLength::Known(0),
            ranges: None,
            cursor: 0,
        }
    }

    /// Whether the status line and headers have been transmitted.
    pub fn committed(&self) -> bool {
        self.committed
    }

    /// Appends `name: value` to the header buffer. Fails when the assembled
    /// headers would exceed the buffer capacity.
    pub fn header_add(&mut self, name: &str, value: &str) -> VersoResult<()> {
        let required = name.len() + 2 + value.len() + 2;
        if HEADERS_LENGTH_MAX - self.headers_length < required {
            return Err(VersoError::Memory);
        }
        let mut end = self.headers_length;
        for part in [name.as_bytes(), ": ".as_bytes(), value.as_bytes(), "\r\n".as_bytes()] {
            self.headers[end..end + part.len()].copy_from_slice(part);
            end += part.len();
        }
        self.headers_length = end;
        Ok(())
    }

    /// Commits the status line and headers, choosing the framing mode.
    ///
    /// HEAD requests, 1xx, 204 and 304 get no body framing at all. A valid
    /// `Range` request against a 200 response narrows it to 206 with
    /// `Content-Range`; multi-interval ranges are declined (there is no
    /// multipart/byteranges support).
    pub fn headers_send(
        &mut self,
        stream: &mut Stream,
        request: &Request,
        body_length: BodyLength,
    ) -> VersoResult<()> {
        let mut length = body_length;

        self.body_required = !(request.method == Some(Method::Head)
            || self.code < 200
            || self.code == http::NO_CONTENT
            || self.code == http::NOT_MODIFIED);

        if self.body_required {
            self.cursor = 0;

            match length {
                BodyLength::Chunked => {
                    self.header_add("Transfer-Encoding", "chunked")?;
                }
                BodyLength::Known(total) => {
                    let mut declared = total;
                    if self.code == http::OK {
                        if let Some(range) = request.header("range") {
                            if let Some(intervals) = headers::parse_range(range, total)? {
                                if intervals.len() > 1 {
                                    return Err(VersoError::Status(
                                        http::RANGE_NOT_SATISFIABLE,
                                    ));
                                }

                                // Content-Range: bytes <low>-<high>/<total>
                                let mut value = b"bytes ".to_vec();
                                format::push_uint(&mut value, intervals[0][0], 10);
                                value.push(b'-');
                                format::push_uint(&mut value, intervals[0][1], 10);
                                value.push(b'/');
                                format::push_uint(&mut value, total, 10);
                                let value = String::from_utf8(value)
                                    .map_err(|_| VersoError::Unknown)?;
                                self.header_add("Content-Range", &value)?;
                                self.header_add("Accept-Ranges", "bytes")?;

                                declared = intervals[0][1] - intervals[0][0] + 1;
                                length = BodyLength::Known(declared);
                                self.code = http::PARTIAL_CONTENT;
                                self.ranges = Some(intervals);
                            }
                        }
                    }

                    let mut value = Vec::new();
                    format::push_uint(&mut value, declared, 10);
                    let value = String::from_utf8(value).map_err(|_| VersoError::Unknown)?;
                    self.header_add("Content-Length", &value)?;
                }
            }
        }

        // Date: current time on the server in UTC.
        let date = httpdate::fmt_http_date(SystemTime::now());
        self.header_add("Date", &date)?;

        // A handler-chosen code outside the table degrades to 500.
        let phrase = match http::reason_phrase(self.code) {
            Some(phrase) => phrase,
            None => {
                self.code = http::INTERNAL_SERVER_ERROR;
                http::reason_phrase(self.code).unwrap_or("Internal Server Error")
            }
        };

        // HTTP/1.1 code phrase\r\n
        let mut line = Vec::with_capacity(64);
        line.extend_from_slice(b"HTTP/1.1 ");
        format::push_uint_pad(&mut line, self.code as u64, 10, 3, b'0');
        line.push(b' ');
        line.extend_from_slice(phrase.as_bytes());
        line.extend_from_slice(b"\r\n");

        stream.write(&line)?;
        stream.write(&self.headers[..self.headers_length])?;
        stream.write(b"\r\n")?;
        stream.write_flush()?;

        self.length = length;
        self.committed = true;
        Ok(())
    }

    /// Transmits one piece of the body. In chunked mode the data becomes one
    /// chunk; in identity mode with a range selection only the intersection
    /// with the selected interval is sent.
    pub fn entity_send(&mut self, stream: &mut Stream, data: &[u8]) -> VersoResult<()> {
        if !self.body_required {
            return Ok(());
        }

        match self.length {
            BodyLength::Chunked => {
                let mut size = Vec::with_capacity(18);
                format::push_uint(&mut size, data.len() as u64, 16);
                size.extend_from_slice(b"\r\n");
                stream.write(&size)?;
                stream.write(data)?;
                stream.write(b"\r\n")?;
            }
            BodyLength::Known(_) => {
                let mut piece = data;
                if let Some(ranges) = &self.ranges {
                    // Advance the cursor and intersect this piece with the
                    // selected interval.
                    let offset = self.cursor as i64;
                    self.cursor += data.len() as u64;
                    let start = ranges[0][0] as i64 - offset;
                    if start >= data.len() as i64 {
                        return Ok(());
                    }
                    let mut size = ranges[0][1] as i64 + 1 - ranges[0][0] as i64;
                    let mut begin = 0usize;
                    if start > 0 {
                        begin = start as usize;
                    } else {
                        size += start;
                        if size <= 0 {
                            return Ok(());
                        }
                    }
                    let end = (begin + size as usize).min(data.len());
                    piece = &data[begin..end];
                }
                stream.write(piece)?;
            }
        }

        stream.write_flush()
    }

    /// Terminates a chunked body with the empty final chunk.
    pub fn chunk_last(&mut self, stream: &mut Stream) -> VersoResult<()> {
        self.entity_send(stream, b"")
    }
}

impl Default for Response {
    fn default() -> Self {
        Response::new()
    }
}
