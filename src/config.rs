use std::num::NonZeroU16;


/// Tunables for a client [`Connection`](crate::client::Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Config {
    /// The maximum number of Stdin bytes read from the input source and
    /// written to the connection at once.
    ///
    /// A single record never carries more than 65535 bytes, so this is also
    /// the effective upper bound.
    pub max_write: NonZeroU16,
    /// The maximum number of requests in flight on one connection.
    ///
    /// Request IDs are allocated from `1..=max_requests`.
    pub max_requests: NonZeroU16,
}

impl Config {
    /// Returns a [`Config`] with all settings at their defaults.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self { max_write: NonZeroU16::MAX, max_requests: NonZeroU16::MAX }
    }

    /// Sets `max_write`, returning the updated [`Config`].
    #[inline]
    #[must_use]
    pub const fn with_max_write(mut self, max_write: NonZeroU16) -> Self {
        self.max_write = max_write;
        self
    }

    /// Sets `max_requests`, returning the updated [`Config`].
    #[inline]
    #[must_use]
    pub const fn with_max_requests(mut self, max_requests: NonZeroU16) -> Self {
        self.max_requests = max_requests;
        self
    }
}

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}
