use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;


/// The maximum number of header lines accepted in a CGI response.
pub const MAX_HEADERS: usize = 64;


/// Error types that may occur while parsing a CGI/1.1 response.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The output ended before the blank line terminating the header block.
    #[error("CGI response header block is incomplete")]
    Incomplete,
    /// A header line is not a well-formed `Name: value` pair.
    #[error("malformed CGI response header: {0}")]
    Malformed(httparse::Error),
    /// The response contains more than [`MAX_HEADERS`] header lines.
    #[error("CGI response contains more than {MAX_HEADERS} headers")]
    TooManyHeaders,
    /// The `Status` header does not start with a valid status code.
    #[error("invalid CGI Status header")]
    InvalidStatus,
    /// A header name or value cannot be represented in HTTP.
    #[error("invalid CGI response header")]
    InvalidHeader,
}

impl From<httparse::Error> for Error {
    #[inline]
    fn from(e: httparse::Error) -> Self {
        match e {
            httparse::Error::TooManyHeaders => Self::TooManyHeaders,
            e => Self::Malformed(e),
        }
    }
}


/// A CGI/1.1 document response, parsed from a responder's Stdout stream.
///
/// The header block is a series of MIME-style `Name: value` lines, each
/// terminated by either `\n` or `\r\n`, and closed by a blank line. The
/// optional `Status` header carries the HTTP status as `<code> <reason>`.
/// Everything after the blank line is the response body, which is borrowed
/// from the input verbatim.
#[derive(Debug, Clone)]
pub struct Response<'a> {
    /// The HTTP status from the `Status` header, or `200 OK` if absent.
    pub status: StatusCode,
    /// All headers except `Status`. Repeated headers keep their order.
    pub headers: HeaderMap,
    /// The unmodified response body.
    pub body: &'a [u8],
}

impl<'a> Response<'a> {
    /// Parses the complete Stdout output of a request.
    ///
    /// # Errors
    /// Returns an error if the header block is incomplete or malformed, or if
    /// the `Status` header is invalid.
    pub fn parse(output: &'a [u8]) -> Result<Self, Error> {
        let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let (body_start, parsed) = match httparse::parse_headers(output, &mut raw)? {
            httparse::Status::Complete(c) => c,
            httparse::Status::Partial => return Err(Error::Incomplete),
        };

        let mut status = StatusCode::OK;
        let mut headers = HeaderMap::with_capacity(parsed.len());
        for h in parsed {
            if h.name.eq_ignore_ascii_case("status") {
                status = parse_status(h.value)?;
                continue;
            }
            let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|_| Error::InvalidHeader)?;
            let value = HeaderValue::from_bytes(h.value).map_err(|_| Error::InvalidHeader)?;
            headers.append(name, value);
        }

        Ok(Self { status, headers, body: &output[body_start..] })
    }

    /// Converts the parsed response into an owned [`http::Response`].
    #[must_use]
    pub fn into_http(self) -> http::Response<Vec<u8>> {
        let mut resp = http::Response::new(self.body.to_vec());
        *resp.status_mut() = self.status;
        *resp.headers_mut() = self.headers;
        resp
    }
}

/// Parses the value of a `Status` header. Only the leading code is used,
/// the reason phrase is free-form.
fn parse_status(value: &[u8]) -> Result<StatusCode, Error> {
    let code = value.split(|&b| b == b' ').find(|s| !s.is_empty()).ok_or(Error::InvalidStatus)?;
    StatusCode::from_bytes(code).map_err(|_| Error::InvalidStatus)
}
