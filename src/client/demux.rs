use std::collections::{HashMap, HashSet};
use std::io;
use std::num::NonZeroU16;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::io::AsyncRead;

use super::request::{Outcome, Route};
use super::util::Completion;
use super::Error;
use crate::macros::trace;
use crate::protocol::body::{EndRequest, UnknownType};
use crate::protocol::record::RecordReader;
use crate::protocol::{ProtocolValues, RecordType};


pub(crate) type Query = Completion<Result<ProtocolValues, Error>>;

#[derive(Default)]
struct State {
    routes: HashMap<u16, Arc<dyn Route>>,
    /// IDs whose input streams are still being written.
    sending: HashSet<u16>,
    /// The pending management query, tagged with its sequence number.
    query: Option<(u64, Arc<Query>)>,
    queries: u64,
    /// Replies still due for queries withdrawn after they were sent.
    stale: usize,
    closed: bool,
}

impl State {
    #[inline]
    fn is_free(&self, id: u16) -> bool {
        !self.routes.contains_key(&id) && !self.sending.contains(&id)
    }
}


/// The table of in-flight requests of one connection.
///
/// An ID stays taken until its request ended AND its input was fully
/// written, so late records can never reach a newer request.
#[derive(Default)]
pub(crate) struct Registry(Mutex<State>);

impl Registry {
    #[inline]
    fn lock(&self) -> MutexGuard<'_, State> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates the smallest free ID up to `max` and registers the route
    /// built by `make` under it.
    pub(crate) fn register<T, F>(&self, max: NonZeroU16, make: F) -> Result<Arc<T>, Error>
    where
        T: Route + 'static,
        F: FnOnce(NonZeroU16) -> T,
    {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::ConnectionClosed);
        }
        let id = (1..=max.get())
            .find(|&id| state.is_free(id))
            .and_then(NonZeroU16::new)
            .ok_or(Error::IdsExhausted)?;

        let route = Arc::new(make(id));
        let dyn_route: Arc<dyn Route> = route.clone();
        state.routes.insert(id.get(), dyn_route);
        state.sending.insert(id.get());
        Ok(route)
    }

    /// Marks the input streams of `id` as completely written.
    pub(crate) fn sent(&self, id: u16) {
        self.lock().sending.remove(&id);
    }

    /// Removes `id` entirely, e.g. after its input could not be written.
    pub(crate) fn deregister(&self, id: u16) {
        let mut state = self.lock();
        state.routes.remove(&id);
        state.sending.remove(&id);
    }

    fn route(&self, id: u16) -> Option<Arc<dyn Route>> {
        self.lock().routes.get(&id).cloned()
    }

    /// Tests whether `id` is currently assigned to `route`.
    pub(crate) fn routes_to(&self, id: u16, route: &Arc<dyn Route>) -> bool {
        self.lock().routes.get(&id).is_some_and(|r| Arc::ptr_eq(r, route))
    }

    fn remove(&self, id: u16) {
        self.lock().routes.remove(&id);
    }

    /// Installs a new pending management query.
    ///
    /// Queries must not overlap, the caller serializes them.
    pub(crate) fn begin_query(&self) -> Result<PendingQuery<'_>, Error> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::ConnectionClosed);
        }
        state.queries += 1;
        let query = Arc::new(Query::new());
        state.query = Some((state.queries, query.clone()));
        Ok(PendingQuery { registry: self, seq: state.queries, query, sent: false, done: false })
    }

    fn withdraw_query(&self, seq: u64, sent: bool) {
        let mut state = self.lock();
        if state.query.as_ref().is_some_and(|(s, _)| *s == seq) {
            state.query = None;
            if sent {
                state.stale += 1;
            }
        }
    }

    fn answer_query(&self, answer: Result<ProtocolValues, Error>) {
        let query = {
            let mut state = self.lock();
            if state.stale > 0 {
                // Replies arrive in query order
                state.stale -= 1;
                tracing::debug!("dropping reply to withdrawn management query");
                return;
            }
            state.query.take()
        };
        match query {
            Some((_, q)) => {
                q.complete(answer);
            },
            None => tracing::warn!("dropping unsolicited management record"),
        }
    }

    /// Closes the registry and fails every pending request and query with
    /// [`Error::ConnectionClosed`].
    ///
    /// Returns the number of failed requests.
    pub(crate) fn shutdown(&self) -> usize {
        let (routes, query) = {
            let mut state = self.lock();
            state.closed = true;
            state.sending.clear();
            (std::mem::take(&mut state.routes), state.query.take())
        };

        let failed = routes.len();
        for (id, route) in routes {
            let done = route.done().clone();
            drop(route);
            if done.complete(Err(Error::ConnectionClosed)) {
                tracing::debug!(id, "request failed by closed connection");
            }
        }
        if let Some((_, q)) = query {
            q.complete(Err(Error::ConnectionClosed));
        }
        failed
    }
}


/// A management query awaiting the responder's reply.
///
/// Dropping it before the reply arrived withdraws the query. If the query was
/// already sent, its late reply is discarded instead of answering the next
/// query.
pub(crate) struct PendingQuery<'a> {
    registry: &'a Registry,
    seq: u64,
    query: Arc<Query>,
    sent: bool,
    done: bool,
}

impl PendingQuery<'_> {
    /// Records that the query may have reached the responder.
    #[inline]
    pub(crate) fn mark_sent(&mut self) {
        self.sent = true;
    }

    pub(crate) async fn wait(mut self) -> Result<ProtocolValues, Error> {
        let answer = self.query.wait().await;
        self.done = true;
        answer
    }
}

impl Drop for PendingQuery<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.registry.withdraw_query(self.seq, self.sent);
        }
    }
}


/// Reads records until the connection ends, routing each to its request.
///
/// This is the only reader of the connection. Once it returns, all pending
/// requests have been failed and no new requests can be registered.
pub(crate) async fn run<R: AsyncRead + Unpin>(mut reader: RecordReader<R>, registry: Arc<Registry>) {
    match demux(&mut reader, &registry).await {
        Ok(()) => tracing::debug!("responder closed the connection"),
        Err(e) => tracing::error!(error = %e, "reading from the responder failed"),
    }
    let failed = registry.shutdown();
    if failed > 0 {
        tracing::debug!(failed, "pending requests failed after connection loss");
    }
}

async fn demux<R: AsyncRead + Unpin>(reader: &mut RecordReader<R>, registry: &Registry) -> io::Result<()> {
    while let Some(head) = reader.read().await? {
        let id = head.request_id;
        match head.rtype {
            RecordType::Stdout | RecordType::Stderr => {
                let Some(route) = registry.route(id) else {
                    tracing::warn!(id, rtype = ?head.rtype, "dropping output for unknown request");
                    continue;
                };
                route.deliver(head.rtype, reader.content()).await;
            },
            RecordType::EndRequest => {
                let body = <[u8; EndRequest::LEN]>::try_from(reader.content()).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "EndRequest record has invalid length")
                })?;
                let Some(route) = registry.route(id) else {
                    tracing::warn!(id, "dropping end of unknown request");
                    continue;
                };

                let outcome: Outcome = match EndRequest::from_bytes(body) {
                    Ok(end) => route.finish(end).await,
                    Err(e) => {
                        tracing::warn!(id, error = %e, "malformed EndRequest record");
                        Err(e.into())
                    },
                };
                // Release every reference before waking waiters, so that
                // `Request::into_output` succeeds right away
                let done = route.done().clone();
                drop(route);
                registry.remove(id);
                if done.complete(outcome) {
                    tracing::debug!(id, "request ended");
                }
            },
            RecordType::GetValuesResult if head.is_management() => {
                registry.answer_query(Ok(ProtocolValues::parse(reader.content())));
            },
            RecordType::Unknown if head.is_management() => {
                let body = <[u8; UnknownType::LEN]>::try_from(reader.content()).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "UnknownType record has invalid length")
                })?;
                let UnknownType { rtype } = UnknownType::from_bytes(body);
                registry.answer_query(Err(Error::UnknownType(rtype)));
            },
            _ => {
                trace!(id, rtype = ?head.rtype, "ignoring record");
            },
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    fn reply(max_reqs: u32) -> Result<ProtocolValues, Error> {
        Ok(ProtocolValues { max_reqs: Some(max_reqs), ..ProtocolValues::default() })
    }

    #[test]
    fn withdrawn_query_reply_dropped() {
        let registry = Registry::default();
        let mut first = registry.begin_query().expect("open registry");
        first.mark_sent();
        drop(first);

        let second = registry.begin_query().expect("open registry");
        registry.answer_query(reply(1));
        assert!(!second.query.is_set(), "reply to the withdrawn query was delivered");
        registry.answer_query(reply(2));
        assert!(matches!(second.query.get(), Some(Ok(v)) if v.max_reqs == Some(2)));
    }

    #[test]
    fn unsent_query_withdrawn() {
        let registry = Registry::default();
        drop(registry.begin_query().expect("open registry"));

        let next = registry.begin_query().expect("open registry");
        registry.answer_query(reply(3));
        assert!(matches!(next.query.get(), Some(Ok(v)) if v.max_reqs == Some(3)));
    }

    #[test]
    fn shutdown_fails_query() {
        let registry = Registry::default();
        let pending = registry.begin_query().expect("open registry");
        assert_eq!(registry.shutdown(), 0);
        assert!(matches!(pending.query.get(), Some(Err(Error::ConnectionClosed))));
        assert!(matches!(registry.begin_query(), Err(Error::ConnectionClosed)));
    }
}
