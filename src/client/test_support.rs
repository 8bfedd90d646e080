use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use super::Connection;
use crate::protocol::{self as fcgi, body, nv, record};
use crate::Config;


pub(crate) const HELLO: &[u8] = b"Content-Type: text/plain; charset=utf-8\r\n\r\nHello FCGI\n";
pub(crate) const OH_NO: &[u8] = b"Status: 500 Internal Server Error\r\n\
    Content-Type: text/plain; charset=utf-8\r\nX-Content-Type-Options: nosniff\r\n\r\nOh No!\n";

pub(crate) fn params() -> crate::cgi::Params {
    let mut params = crate::cgi::Params::new();
    params.append(crate::cgi::REQUEST_METHOD, "GET");
    params.append(crate::cgi::SERVER_PROTOCOL, "HTTP/1.1");
    params.append_header("X-Test", "yes");
    params
}


/// A request as received by [`MockResponder`].
#[derive(Debug, Default)]
pub(crate) struct Incoming {
    pub(crate) id: u16,
    pub(crate) begin: Option<body::BeginRequest>,
    pub(crate) params: Vec<(Vec<u8>, Vec<u8>)>,
    nvp: Vec<u8>,
    pub(crate) stdin: Vec<u8>,
    /// The number of non-empty Stdin records.
    pub(crate) stdin_records: usize,
}

impl Incoming {
    pub(crate) fn param(&self, name: &[u8]) -> Option<&[u8]> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, v)| &v[..])
    }
}

#[derive(Debug)]
pub(crate) enum Event {
    /// All input streams of a request were received.
    Request(Incoming),
    Abort(u16),
}


/// A scripted FastCGI responder for the other end of a [`Connection`].
///
/// Management queries are answered automatically. Everything else is driven
/// by the test through `MockResponder::next_event` and the write methods.
pub(crate) struct MockResponder<S> {
    reader: record::RecordReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    pending: HashMap<u16, Incoming>,
    /// Answer management queries with an UnknownType record.
    pub(crate) reject_management: bool,
}

impl<S: AsyncRead + AsyncWrite> MockResponder<S> {
    pub(crate) fn new(stream: S) -> Self {
        let (r, w) = stream.split();
        Self { reader: record::RecordReader::new(r), writer: w, pending: HashMap::new(), reject_management: false }
    }

    /// Reads records until a request is complete or an abort arrives.
    ///
    /// Returns [`None`] once the client closed the connection.
    pub(crate) async fn next_event(&mut self) -> io::Result<Option<Event>> {
        use fcgi::RecordType::*;
        while let Some(head) = self.reader.read().await? {
            let id = head.request_id;
            let content = self.reader.content();
            match head.rtype {
                BeginRequest => {
                    let raw = content.try_into().expect("BeginRequest body has 8 bytes");
                    let begin = body::BeginRequest::from_bytes(raw).expect("valid BeginRequest body");
                    let prev = self.pending.insert(id, Incoming { id, begin: Some(begin), ..Incoming::default() });
                    assert!(prev.is_none(), "request ID {id} reused while in flight");
                },
                Params => {
                    let req = self.pending.get_mut(&id).expect("Params for unknown request");
                    if content.is_empty() {
                        req.params = nv::NVIter::new(&req.nvp).map(|(n, v)| (n.to_vec(), v.to_vec())).collect();
                    } else {
                        req.nvp.extend_from_slice(content);
                    }
                },
                Stdin => {
                    if content.is_empty() {
                        let req = self.pending.remove(&id).expect("Stdin for unknown request");
                        return Ok(Some(Event::Request(req)));
                    }
                    let req = self.pending.get_mut(&id).expect("Stdin for unknown request");
                    req.stdin.extend_from_slice(content);
                    req.stdin_records += 1;
                },
                AbortRequest => {
                    // An aborted request may never complete its input
                    self.pending.remove(&id);
                    return Ok(Some(Event::Abort(id)));
                },
                GetValues => {
                    let reply = management_reply(self.reject_management, content);
                    self.raw(&reply).await?;
                },
                other => panic!("client sent unexpected {other:?} record"),
            }
        }
        Ok(None)
    }

    pub(crate) async fn stdout(&mut self, id: u16, data: &[u8]) -> io::Result<()> {
        self.stream(fcgi::RecordType::Stdout, id, data).await
    }

    pub(crate) async fn stderr(&mut self, id: u16, data: &[u8]) -> io::Result<()> {
        self.stream(fcgi::RecordType::Stderr, id, data).await
    }

    async fn stream(&mut self, rtype: fcgi::RecordType, id: u16, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        record::encode(&mut buf, rtype, id, data);
        self.raw(&buf).await
    }

    /// Terminates both output streams and ends the request.
    pub(crate) async fn end(&mut self, id: u16, app_status: u32, protocol_status: fcgi::ProtocolStatus) -> io::Result<()> {
        let mut buf = Vec::new();
        record::encode(&mut buf, fcgi::RecordType::Stdout, id, &[]);
        record::encode(&mut buf, fcgi::RecordType::Stderr, id, &[]);
        buf.extend(body::EndRequest { app_status, protocol_status }.to_record(id));
        self.raw(&buf).await
    }

    /// Writes `stdout` and completes the request with status 0.
    pub(crate) async fn respond(&mut self, id: u16, stdout: &[u8]) -> io::Result<()> {
        self.stdout(id, stdout).await?;
        self.end(id, 0, fcgi::ProtocolStatus::RequestComplete).await
    }

    pub(crate) async fn raw(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await
    }
}

fn management_reply(reject: bool, query: &[u8]) -> Vec<u8> {
    if reject {
        return body::UnknownType { rtype: fcgi::RecordType::GetValues.into() }
            .to_record(fcgi::FCGI_NULL_REQUEST_ID).to_vec();
    }

    let mut content = Vec::new();
    for (name, _) in nv::NVIter::new(query) {
        let value: &[u8] = match name {
            b"FCGI_MAX_CONNS" => b"1",
            b"FCGI_MAX_REQS" => b"16",
            b"FCGI_MPXS_CONNS" => b"1",
            _ => continue,
        };
        nv::write((name, value), &mut content).expect("short management values");
    }
    let mut buf = Vec::new();
    record::encode(&mut buf, fcgi::RecordType::GetValuesResult, fcgi::FCGI_NULL_REQUEST_ID, &content);
    buf
}


/// Spawns a task answering every request with the output of `handler`.
pub(crate) fn serve<S, F>(mut mock: MockResponder<S>, handler: F) -> JoinHandle<io::Result<()>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    F: Fn(&Incoming) -> Vec<u8> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = mock.next_event().await? {
            if let Event::Request(req) = event {
                let out = handler(&req);
                mock.respond(req.id, &out).await?;
            }
        }
        Ok(())
    })
}

/// Creates a [`Connection`] connected to a [`MockResponder`] in memory.
pub(crate) fn pair(config: Config) -> (Connection, MockResponder<Compat<DuplexStream>>) {
    let (client, server) = tokio::io::duplex(16 * 1024);
    (Connection::from_stream(client.compat(), config), MockResponder::new(server.compat()))
}


/// An output sink that fails every write.
#[derive(Debug, Default)]
pub(crate) struct FailingSink;

impl AsyncWrite for FailingSink {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context, _: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _: &mut Context) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}


/// A request body that never becomes readable.
#[derive(Debug, Default)]
pub(crate) struct Stalled;

impl AsyncRead for Stalled {
    fn poll_read(self: Pin<&mut Self>, _: &mut Context, _: &mut [u8]) -> Poll<io::Result<usize>> {
        Poll::Pending
    }
}
