use std::io;

use futures_util::io::{AsyncRead, AsyncReadExt};

use super::{RecordHeader, RecordType, Error as ProtocolError, MAX_CONTENT_LEN};


/// Encodes `content` as one or more records of type `rtype` into `out`.
///
/// Content larger than [`MAX_CONTENT_LEN`] is split into consecutive records
/// with the same type and request ID. Each record is padded to an 8-byte
/// boundary. Empty `content` produces exactly one empty record, which marks
/// the end of a stream.
///
/// Returns the number of bytes appended to `out`.
pub fn encode(out: &mut Vec<u8>, rtype: RecordType, request_id: u16, content: &[u8]) -> usize {
    let start = out.len();
    let mut head = RecordHeader::new(rtype, request_id);
    let mut rest = content;
    loop {
        let len = u16::try_from(rest.len()).unwrap_or(u16::MAX);
        let chunk;
        (chunk, rest) = rest.split_at(len.into());

        head.set_lengths(len);
        out.reserve(RecordHeader::LEN + head.body_len());
        out.extend_from_slice(&head.to_bytes());
        out.extend_from_slice(chunk);
        out.resize(out.len() + usize::from(head.padding_length), 0);
        if rest.is_empty() {
            break;
        }
    }
    out.len() - start
}

/// Encodes a complete stream: the records carrying `content` (if any),
/// followed by the empty end-of-stream record.
pub fn encode_stream(out: &mut Vec<u8>, rtype: RecordType, request_id: u16, content: &[u8]) -> usize {
    debug_assert!(rtype.is_stream());
    let mut written = 0;
    if !content.is_empty() {
        written += encode(out, rtype, request_id, content);
    }
    written + encode(out, rtype, request_id, &[])
}


/// Reads FastCGI records one at a time from an [`AsyncRead`] source.
///
/// Each call to `RecordReader::read` consumes exactly one record header plus
/// its declared content and padding. Records with an unknown type are
/// consumed and skipped, since their length is still well-defined. Records
/// with an unknown protocol version cannot be skipped and fail the read.
///
/// The reader keeps no input across calls. Only the content of the most
/// recently read record is retained, accessible via `RecordReader::content`.
#[derive(Debug)]
pub struct RecordReader<R> {
    inner: R,
    body: Vec<u8>,
    content_len: usize,
}

impl<R> RecordReader<R> {
    /// Wraps an [`AsyncRead`] source in a [`RecordReader`].
    #[inline]
    pub fn new(inner: R) -> Self {
        Self { inner, body: Vec::new(), content_len: 0 }
    }

    /// Returns the content of the record returned by the previous call to
    /// `RecordReader::read`, without padding.
    #[inline]
    #[must_use]
    pub fn content(&self) -> &[u8] {
        &self.body[..self.content_len]
    }

    /// Extracts the wrapped source.
    #[inline]
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    /// Reads the next record, returning its header.
    ///
    /// Returns [`None`] if the source reached its end cleanly on a record
    /// boundary.
    ///
    /// # Errors
    /// Any [`io::Error`] from `R` is forwarded to the caller. A source ending
    /// in the middle of a record yields [`io::ErrorKind::UnexpectedEof`]. An
    /// unknown protocol version yields [`io::ErrorKind::InvalidData`] wrapping
    /// a [`ProtocolError`].
    pub async fn read(&mut self) -> io::Result<Option<RecordHeader>> {
        loop {
            let mut raw = [0; RecordHeader::LEN];
            let first = self.inner.read(&mut raw).await?;
            if first == 0 {
                return Ok(None);
            }
            self.inner.read_exact(&mut raw[first..]).await?;

            let head = match RecordHeader::from_bytes(raw) {
                Ok(h) => Ok(h),
                Err(ProtocolError::UnknownRecordType(rtype)) => Err(rtype),
                Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            };

            let content_len = u16::from_be_bytes([raw[4], raw[5]]);
            let body_len = usize::from(content_len) + usize::from(raw[6]);
            self.body.resize(body_len, 0);
            self.inner.read_exact(&mut self.body).await?;
            self.content_len = content_len.into();

            match head {
                Ok(h) => {
                    crate::macros::trace!(header = ?h, "record received");
                    return Ok(Some(h));
                },
                Err(rtype) => {
                    let request_id = u16::from_be_bytes([raw[2], raw[3]]);
                    tracing::info!(request_id, rtype, content_len, "unknown record type ignored");
                },
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::iter::repeat_with;
    use super::*;
    use crate::protocol::Version;

    fn random_bytes(len: usize) -> Vec<u8> {
        repeat_with(|| fastrand::u8(..)).take(len).collect()
    }

    /// Reads every record from `wire`, concatenating the content of those
    /// matching `rtype` and `request_id`.
    async fn collect(wire: &[u8], rtype: RecordType, request_id: u16) -> io::Result<(Vec<u8>, usize)> {
        let mut reader = RecordReader::new(wire);
        let mut content = Vec::new();
        let mut records = 0;
        while let Some(head) = reader.read().await? {
            assert_eq!(head.version, Version::V1);
            assert_eq!((head.rtype, head.request_id), (rtype, request_id));
            assert!(usize::from(head.content_length) <= MAX_CONTENT_LEN);
            content.extend_from_slice(reader.content());
            records += 1;
        }
        Ok((content, records))
    }

    #[tokio::test]
    async fn chunk_boundaries() -> io::Result<()> {
        let cases = [
            (0, 1),
            (1, 1),
            (MAX_CONTENT_LEN, 1),
            (MAX_CONTENT_LEN + 1, 2),
            (2 * MAX_CONTENT_LEN, 2),
            (3 * MAX_CONTENT_LEN, 3),
        ];
        for (len, expected_records) in cases {
            let content = random_bytes(len);
            let mut wire = Vec::new();
            let written = encode(&mut wire, RecordType::Stdin, 0x1d2f, &content);
            assert_eq!(written, wire.len());
            assert_eq!(wire.len() % 8, 0, "records are not 8-byte aligned");

            let (decoded, records) = collect(&wire, RecordType::Stdin, 0x1d2f).await?;
            assert_eq!(records, expected_records, "content length {len}");
            assert!(decoded == content, "content of length {len} was corrupted");
        }
        Ok(())
    }

    #[tokio::test]
    async fn stream_terminator() -> io::Result<()> {
        let content = random_bytes(MAX_CONTENT_LEN + 1);
        let mut wire = Vec::new();
        encode_stream(&mut wire, RecordType::Params, 7, &content);
        assert_eq!(&wire[wire.len() - 8..], b"\x01\x04\x00\x07\x00\x00\x00\x00");

        let (decoded, records) = collect(&wire, RecordType::Params, 7).await?;
        assert_eq!(records, 3);
        assert!(decoded == content);

        wire.clear();
        assert_eq!(encode_stream(&mut wire, RecordType::Stdin, 7, &[]), RecordHeader::LEN);
        Ok(())
    }

    #[tokio::test]
    async fn arbitrary_padding() -> io::Result<()> {
        let mut wire = Vec::new();
        let mut expected = Vec::new();
        for padding_length in [0, 1, 7, 8, 200, u8::MAX] {
            let content = random_bytes(fastrand::usize(0..300));
            let head = RecordHeader {
                version: Version::V1, rtype: RecordType::Stdout, request_id: 3,
                content_length: content.len().try_into().expect("short content"), padding_length,
            };
            wire.extend(head.to_bytes());
            wire.extend(&content);
            wire.extend(random_bytes(padding_length.into()));
            expected.extend(content);
        }

        let (decoded, records) = collect(&wire, RecordType::Stdout, 3).await?;
        assert_eq!(records, 6);
        assert_eq!(decoded, expected);
        Ok(())
    }

    #[tokio::test]
    async fn skip_unknown_type() -> io::Result<()> {
        let mut wire = vec![0x01, 0x7a, 0x00, 0x05, 0x00, 0x03, 0x02, 0x00, 1, 2, 3, 0, 0];
        encode(&mut wire, RecordType::Stderr, 5, b"oops");

        let mut reader = RecordReader::new(&wire[..]);
        let head = reader.read().await?.expect("record after unknown type");
        assert_eq!(head.rtype, RecordType::Stderr);
        assert_eq!(reader.content(), b"oops");
        assert!(reader.read().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn framing_errors() {
        let mut wire = Vec::new();
        encode(&mut wire, RecordType::Stdout, 9, &random_bytes(100));
        for cut in [3, RecordHeader::LEN, RecordHeader::LEN + 50] {
            let mut reader = RecordReader::new(&wire[..cut]);
            let err = reader.read().await.expect_err("truncated record should fail");
            assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof, "cut at {cut}");
        }

        const BAD_VERSION: [u8; 8] = [0xe5, 0x06, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00];
        let mut reader = RecordReader::new(&BAD_VERSION[..]);
        let err = reader.read().await.expect_err("unknown version should fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
