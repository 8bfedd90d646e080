use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_lock::Mutex;
use compact_str::CompactString;
use futures_util::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

use crate::protocol::{self as fcgi, body::BeginRequest, nv, record};
use crate::Config;

mod demux;
mod request;
mod util;
#[cfg(test)]
pub(crate) mod test_support;

pub use request::Request;
use demux::Registry;
use request::{Exchange, Route};


/// Error types that may occur on a FastCGI client connection.
///
/// Errors are cheap to clone, so that every waiter of a request observes
/// the same error.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The network passed to `Connection::dial` is not supported.
    #[error("unsupported network type {0:?}")]
    UnsupportedNetwork(CompactString),
    /// Reading from or writing to the connection failed.
    #[error("FastCGI connection I/O failed: {0}")]
    Io(Arc<io::Error>),
    /// The connection was closed, either locally or by the responder.
    #[error("FastCGI connection is closed")]
    ConnectionClosed,
    /// All request IDs allowed by the connection's [`Config`] are in use.
    #[error("no free FastCGI request ID")]
    IdsExhausted,
    /// The responder ended the request without completing it.
    #[error("FastCGI request rejected: {0}")]
    Rejected(fcgi::ProtocolStatus),
    /// Writing the request's output to a caller-provided sink failed.
    #[error("writing FastCGI request output failed: {0}")]
    Sink(Arc<io::Error>),
    /// A protocol element could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] fcgi::Error),
    /// The responder does not understand the management record type.
    #[error("FastCGI responder does not understand record type {0}")]
    UnknownType(u8),
}

impl From<io::Error> for Error {
    #[inline]
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}


type BoxWriter = Pin<Box<dyn AsyncWrite + Send>>;
/// [`None`] once the connection was closed.
type SharedWriter = Arc<Mutex<Option<BoxWriter>>>;

/// A client connection to a FastCGI responder, multiplexing any number of
/// concurrent requests.
///
/// Each connection runs one background task on the Tokio runtime, which is
/// the sole reader of the connection. It routes the responder's output to
/// the sinks of the matching [`Request`] and ends requests on EndRequest
/// records. Writes from concurrent callers are serialized, such that records
/// of different requests never interleave below record granularity.
///
/// All methods take `&self`, so a connection can be shared between tasks,
/// e.g. through an [`Arc`]. Dropping the connection fails all pending
/// requests with [`Error::ConnectionClosed`], as does `Connection::close`.
pub struct Connection {
    config: Config,
    writer: SharedWriter,
    registry: Arc<Registry>,
    /// Serializes management queries, as their replies carry no request ID.
    query_lock: Mutex<()>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Connects to a FastCGI responder with the default [`Config`].
    ///
    /// See `Connection::dial_with` for details.
    ///
    /// # Errors
    /// Returns an error if the network is not supported or if the
    /// connection could not be established.
    #[inline]
    pub async fn dial(network: &str, address: &str) -> Result<Self, Error> {
        Self::dial_with(network, address, Config::default()).await
    }

    /// Connects to a FastCGI responder.
    ///
    /// `network` selects the socket type:
    /// - `tcp` connects to `host:port`, trying each resolved address in turn.
    /// - `tcp4` and `tcp6` do the same, but only use IPv4 or IPv6 addresses.
    /// - `unix` connects to the Unix domain socket at path `address` (only
    ///   on Unix platforms).
    ///
    /// # Errors
    /// Returns [`Error::UnsupportedNetwork`] for any other `network`, or
    /// [`Error::Io`] if the connection could not be established.
    pub async fn dial_with(network: &str, address: &str, config: Config) -> Result<Self, Error> {
        use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};

        let ip_filter: fn(&std::net::SocketAddr) -> bool = match network {
            "tcp" => |_| true,
            "tcp4" => std::net::SocketAddr::is_ipv4,
            "tcp6" => std::net::SocketAddr::is_ipv6,
            #[cfg(unix)]
            "unix" => {
                let stream = tokio::net::UnixStream::connect(address).await?;
                tracing::debug!(address, "connected to FastCGI responder");
                let (r, w) = stream.into_split();
                return Ok(Self::from_split(r.compat(), w.compat_write(), config));
            },
            _ => return Err(Error::UnsupportedNetwork(network.into())),
        };

        let mut last_err = None;
        for addr in tokio::net::lookup_host(address).await?.filter(ip_filter) {
            match tokio::net::TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    tracing::debug!(%addr, "connected to FastCGI responder");
                    let (r, w) = stream.into_split();
                    return Ok(Self::from_split(r.compat(), w.compat_write(), config));
                },
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "connection attempt failed");
                    last_err = Some(e);
                },
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no address of the requested family")
        }).into())
    }

    /// Creates a [`Connection`] over an established, bidirectional stream.
    ///
    /// # Panics
    /// Panics if called outside of a Tokio runtime.
    pub fn from_stream<S>(stream: S, config: Config) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = stream.split();
        Self::from_split(reader, writer, config)
    }

    /// Creates a [`Connection`] over the two halves of an established stream.
    ///
    /// # Panics
    /// Panics if called outside of a Tokio runtime.
    pub fn from_split<R, W>(reader: R, writer: W, config: Config) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let writer: BoxWriter = Box::pin(writer);
        let registry = Arc::new(Registry::default());
        let task = tokio::spawn(demux::run(record::RecordReader::new(reader), registry.clone()));
        Self {
            config,
            writer: Arc::new(Mutex::new(Some(writer))),
            registry,
            query_lock: Mutex::new(()),
            reader: StdMutex::new(Some(task)),
        }
    }

    /// Returns the [`Config`] of this connection.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts a new request in the [`Responder`](fcgi::Role::Responder) role.
    ///
    /// The request is assigned the smallest free request ID. `params` are sent
    /// in iteration order without any normalization, see [`cgi::Params`] for a
    /// convenient container. `stdin` is then read to its end and streamed to
    /// the responder, at most `Config::max_write` bytes at a time. Pass
    /// [`futures_util::io::empty()`] if the request has no body.
    ///
    /// The returned future resolves once all input was written. The
    /// responder's Stdout and Stderr output is written to `stdout` and
    /// `stderr` in arrival order while the request is in flight. Use
    /// `Request::wait` to wait for the end of the request.
    ///
    /// If the returned future is dropped before it resolves, the request is
    /// given up. An ID the responder never heard of is released right away.
    /// Otherwise an AbortRequest record is sent in the background and the ID
    /// stays taken until the responder ends the request. Dropping the future
    /// in the middle of a write may still leave a partial record on the
    /// connection.
    ///
    /// Parameters kept in a map of names to value lists can be converted with
    /// `Params::from`, which keeps the values of each name in order.
    ///
    /// # Errors
    /// - [`Error::IdsExhausted`] if `Config::max_requests` requests are in flight.
    /// - [`Error::ConnectionClosed`] if the connection was closed.
    /// - [`Error::Protocol`] if a parameter is too long to be encoded.
    /// - [`Error::Io`] if writing to the connection or reading from `stdin`
    ///   failed. The request is given up in this case, as if the returned
    ///   future had been dropped.
    ///
    /// [`cgi::Params`]: crate::cgi::Params
    pub async fn begin_request<I, N, V, S, O, E>(
        &self,
        params: I,
        mut stdin: S,
        stdout: O,
        stderr: E,
    ) -> Result<Request<O, E>, Error>
    where
        I: IntoIterator<Item = (N, V)>,
        N: AsRef<[u8]>,
        V: AsRef<[u8]>,
        S: AsyncRead + Unpin,
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        // Oversized parameters are rejected before taking an ID
        let mut nvp = Vec::new();
        nv::write_all(params, &mut nvp)?;

        let exchange = self.registry.register(self.config.max_requests, |id| {
            Exchange::new(id, stdout, stderr)
        })?;
        let id = exchange.id();
        tracing::debug!(id, "request started");

        let mut reservation = Reservation {
            conn: self,
            id,
            route: exchange.clone(),
            begun: false,
            sent: false,
        };
        match self.send_input(&mut reservation, &nvp, &mut stdin).await {
            Ok(()) => {
                reservation.sent();
                Ok(Request::new(exchange))
            },
            Err(e) => {
                tracing::warn!(id, error = %e, "sending request input failed");
                Err(e)
            },
        }
    }

    /// Writes the BeginRequest record, the Params stream, and the Stdin
    /// stream of the reserved request.
    async fn send_input<S>(&self, reservation: &mut Reservation<'_>, nvp: &[u8], stdin: &mut S) -> Result<(), Error>
    where
        S: AsyncRead + Unpin,
    {
        let id = reservation.id;
        let mut buf = Vec::with_capacity(2 * fcgi::RecordHeader::LEN + BeginRequest::LEN + nvp.len() + 8);
        buf.extend_from_slice(&BeginRequest::SHARED_RESPONDER.to_record(id));
        record::encode_stream(&mut buf, fcgi::RecordType::Params, id, nvp);
        {
            let mut writer = self.writer.lock().await;
            let Some(w) = &mut *writer else {
                return Err(Error::ConnectionClosed);
            };
            reservation.begun = true;
            w.write_all(&buf).await?;
        }

        let mut chunk = vec![0; self.config.max_write.get().into()];
        loop {
            let n = stdin.read(&mut chunk).await?;
            buf.clear();
            // A zero-length read produces the end-of-stream record
            record::encode(&mut buf, fcgi::RecordType::Stdin, id, &chunk[..n]);
            self.write(&buf).await?;
            if n == 0 {
                break;
            }
        }
        self.flush().await
    }

    /// Requests that the responder abort `request`.
    ///
    /// The request still ends regularly once the responder sends its
    /// EndRequest record. Nothing is sent if `request` already ended, even
    /// if its ID was given to a newer request since. `request` must belong
    /// to this connection.
    ///
    /// # Errors
    /// Returns an error if writing to the connection failed or if the
    /// connection was closed.
    pub async fn abort<O, E>(&self, request: &Request<O, E>) -> Result<(), Error>
    where
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        let route: Arc<dyn Route> = request.exchange().clone();
        if send_abort(&self.writer, &self.registry, request.id(), &route).await? {
            tracing::debug!(id = request.id(), "aborting request");
        }
        Ok(())
    }

    /// Gives up request `id` after its BeginRequest record may have reached
    /// the responder.
    ///
    /// The ID stays taken until the responder ends the request, which an
    /// AbortRequest record sent in the background asks it to do.
    fn abandon(&self, id: u16, route: Arc<dyn Route>) {
        self.registry.sent(id);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(id, "request abandoned outside of a runtime, releasing its ID");
            self.registry.deregister(id);
            return;
        };

        tracing::debug!(id, "aborting abandoned request");
        let (writer, registry) = (self.writer.clone(), self.registry.clone());
        runtime.spawn(async move {
            if let Err(e) = send_abort(&writer, &registry, id, &route).await {
                tracing::debug!(id, error = %e, "aborting abandoned request failed");
            }
        });
    }

    /// Queries the responder for the values of protocol variables.
    ///
    /// Concurrent queries on one connection are answered one after another.
    ///
    /// # Errors
    /// Returns [`Error::UnknownType`] if the responder does not support
    /// management records, [`Error::ConnectionClosed`] if the connection is
    /// closed before the answer arrives, or [`Error::Io`] if writing the query
    /// failed.
    ///
    /// Dropping the returned future withdraws the query. A reply that is
    /// still due for it is discarded, so it never answers a later query.
    pub async fn get_values(&self, vars: fcgi::ProtocolVariables) -> Result<fcgi::ProtocolValues, Error> {
        let _serial = self.query_lock.lock().await;
        let mut pending = self.registry.begin_query()?;

        let mut body = Vec::new();
        vars.write_query(&mut body);
        let mut buf = Vec::new();
        record::encode(&mut buf, fcgi::RecordType::GetValues, fcgi::FCGI_NULL_REQUEST_ID, &body);

        {
            let mut writer = self.writer.lock().await;
            let Some(w) = &mut *writer else {
                return Err(Error::ConnectionClosed);
            };
            pending.mark_sent();
            w.write_all(&buf).await?;
            w.flush().await?;
        }
        pending.wait().await
    }

    /// Closes the connection.
    ///
    /// The write half is closed first, then the background reader is
    /// stopped. All requests still in flight fail with
    /// [`Error::ConnectionClosed`]. Closing an already closed connection
    /// does nothing.
    ///
    /// # Errors
    /// Returns the error from closing the writer, if any.
    pub async fn close(&self) -> Result<(), Error> {
        let writer = self.writer.lock().await.take();
        let Some(mut writer) = writer else {
            return Ok(());
        };
        let res = writer.close().await;
        drop(writer);

        let task = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.abort();
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!("connection reader task panicked");
                }
            }
        }

        let failed = self.registry.shutdown();
        tracing::debug!(failed, "connection closed");
        res.map_err(Error::from)
    }

    async fn write(&self, data: &[u8]) -> Result<(), Error> {
        let mut writer = self.writer.lock().await;
        let Some(w) = &mut *writer else {
            return Err(Error::ConnectionClosed);
        };
        w.write_all(data).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), Error> {
        let mut writer = self.writer.lock().await;
        let Some(w) = &mut *writer else {
            return Err(Error::ConnectionClosed);
        };
        w.flush().await?;
        Ok(())
    }
}

/// Writes an AbortRequest record for `id`, unless `id` is no longer assigned
/// to `route`.
///
/// The check happens under the writer lock. A newer request can only take
/// over `id` before its own first write, so a positive check cannot go stale
/// before the record is written. Returns whether the record was written.
async fn send_abort(
    writer: &Mutex<Option<BoxWriter>>,
    registry: &Registry,
    id: u16,
    route: &Arc<dyn Route>,
) -> Result<bool, Error> {
    let mut writer = writer.lock().await;
    if !registry.routes_to(id, route) {
        return Ok(false);
    }
    let Some(w) = &mut *writer else {
        return Err(Error::ConnectionClosed);
    };
    w.write_all(&fcgi::RecordHeader::new(fcgi::RecordType::AbortRequest, id).to_bytes()).await?;
    w.flush().await?;
    Ok(true)
}


/// Holds a freshly registered request ID while the request's input is
/// written.
///
/// If dropped before `Reservation::sent`, the ID is released, or the request
/// is abandoned if its records may already have reached the responder.
struct Reservation<'a> {
    conn: &'a Connection,
    id: u16,
    route: Arc<dyn Route>,
    /// Set once writing the BeginRequest record may have started.
    begun: bool,
    sent: bool,
}

impl Reservation<'_> {
    fn sent(mut self) {
        self.conn.registry.sent(self.id);
        self.sent = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.sent {
            return;
        }
        if self.begun {
            self.conn.abandon(self.id, self.route.clone());
        } else {
            tracing::debug!(id = self.id, "request given up before it was sent");
            self.conn.registry.deregister(self.id);
        }
    }
}


impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.reader.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        self.registry.shutdown();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
