use std::fmt;
use std::num::NonZeroU16;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::io::{AsyncWrite, AsyncWriteExt};

use super::util::Completion;
use super::Error;
use crate::protocol::{self as fcgi, body::EndRequest};


/// The terminal result of a request: the application's exit status, or
/// the reason the request failed.
pub(crate) type Outcome = Result<u32, Error>;

/// The demultiplexer's view of an in-flight request.
pub(crate) trait Route: Send + Sync {
    /// Appends `data` to the sink for `stream`.
    ///
    /// Sink errors are recorded and reported once the request ends.
    fn deliver<'a>(&'a self, stream: fcgi::RecordType, data: &'a [u8]) -> BoxFuture<'a, ()>;

    /// Flushes the sinks and derives the request's [`Outcome`] from `end`.
    fn finish(&self, end: EndRequest) -> BoxFuture<'_, Outcome>;

    /// The completion signal observed by `Request::wait`.
    fn done(&self) -> &Arc<Completion<Outcome>>;
}


struct Sinks<O, E> {
    stdout: O,
    stderr: E,
    /// The first sink error. Output arriving afterwards is discarded.
    failed: Option<Error>,
}

pub(crate) struct Exchange<O, E> {
    id: NonZeroU16,
    sinks: async_lock::Mutex<Sinks<O, E>>,
    done: Arc<Completion<Outcome>>,
}

impl<O, E> Exchange<O, E> {
    pub(crate) fn new(id: NonZeroU16, stdout: O, stderr: E) -> Self {
        Self {
            id,
            sinks: async_lock::Mutex::new(Sinks { stdout, stderr, failed: None }),
            done: Arc::new(Completion::new()),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> u16 {
        self.id.get()
    }
}

impl<O, E> Route for Exchange<O, E>
where
    O: AsyncWrite + Unpin + Send,
    E: AsyncWrite + Unpin + Send,
{
    fn deliver<'a>(&'a self, stream: fcgi::RecordType, data: &'a [u8]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut sinks = self.sinks.lock().await;
            if sinks.failed.is_some() || self.done.is_set() {
                return;
            }
            let res = match stream {
                fcgi::RecordType::Stderr => sinks.stderr.write_all(data).await,
                _ => sinks.stdout.write_all(data).await,
            };
            if let Err(e) = res {
                tracing::warn!(id = self.id(), ?stream, error = %e, "request output sink failed");
                sinks.failed = Some(Error::Sink(Arc::new(e)));
            }
        })
    }

    fn finish(&self, end: EndRequest) -> BoxFuture<'_, Outcome> {
        Box::pin(async move {
            let mut sinks = self.sinks.lock().await;
            if let Some(e) = sinks.failed.take() {
                return Err(e);
            }

            let mut flushed = sinks.stdout.flush().await;
            if flushed.is_ok() {
                flushed = sinks.stderr.flush().await;
            }
            if let Err(e) = flushed {
                tracing::warn!(id = self.id(), error = %e, "flushing request output failed");
                return Err(Error::Sink(Arc::new(e)));
            }

            if end.protocol_status.is_complete() {
                Ok(end.app_status)
            } else {
                Err(Error::Rejected(end.protocol_status))
            }
        })
    }

    #[inline]
    fn done(&self) -> &Arc<Completion<Outcome>> {
        &self.done
    }
}


/// A handle to a request started with `Connection::begin_request`.
///
/// The request's output is written to the sinks given at its start while it
/// is in flight. Use `Request::wait` to find out when the responder ended the
/// request, and `Request::into_output` to get the sinks back afterwards.
///
/// Handles are cheap to clone. All clones refer to the same request.
pub struct Request<O, E> {
    exchange: Arc<Exchange<O, E>>,
}

impl<O, E> Request<O, E> {
    #[inline]
    pub(crate) fn new(exchange: Arc<Exchange<O, E>>) -> Self {
        Self { exchange }
    }

    #[inline]
    pub(crate) fn exchange(&self) -> &Arc<Exchange<O, E>> {
        &self.exchange
    }

    /// Returns the FastCGI request ID of this request.
    ///
    /// IDs are unique among the in-flight requests of a connection. A
    /// finished request's ID may be reused by a later request.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u16 {
        self.exchange.id()
    }

    /// Waits for the request to end, returning the application's exit status.
    ///
    /// This may be called any number of times, from any number of tasks.
    /// Every call returns the same result.
    ///
    /// # Errors
    /// - [`Error::Rejected`] if the responder ended the request with a
    ///   protocol status other than [`RequestComplete`][complete].
    /// - [`Error::Sink`] if writing to one of the output sinks failed.
    /// - [`Error::ConnectionClosed`] if the connection was closed before the
    ///   request ended.
    /// - [`Error::Protocol`] if the responder's EndRequest record is invalid.
    ///
    /// [complete]: fcgi::ProtocolStatus::RequestComplete
    pub async fn wait(&self) -> Result<u32, Error> {
        self.exchange.done.wait().await
    }

    /// Tests whether the request has ended, successfully or not.
    #[inline]
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.exchange.done.is_set()
    }

    /// Returns the application's exit status if the request completed
    /// successfully.
    #[inline]
    #[must_use]
    pub fn app_status(&self) -> Option<u32> {
        self.exchange.done.get().and_then(Result::ok)
    }

    /// Returns the Stdout and Stderr sinks of a finished request.
    ///
    /// # Errors
    /// Returns `self` unchanged if the request is still in flight or if other
    /// clones of this handle exist.
    pub fn into_output(self) -> Result<(O, E), Self> {
        if !self.is_finished() {
            return Err(self);
        }
        match Arc::try_unwrap(self.exchange) {
            Ok(ex) => {
                let sinks = ex.sinks.into_inner();
                Ok((sinks.stdout, sinks.stderr))
            },
            Err(exchange) => Err(Self { exchange }),
        }
    }
}

impl<O, E> Clone for Request<O, E> {
    #[inline]
    fn clone(&self) -> Self {
        Self { exchange: self.exchange.clone() }
    }
}

impl<O, E> fmt::Debug for Request<O, E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id())
            .field("result", &self.exchange.done.get())
            .finish()
    }
}
