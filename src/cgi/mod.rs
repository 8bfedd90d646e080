use std::collections::HashMap;
use std::fmt;
use std::hash::BuildHasher;

use compact_str::CompactString;
use smallvec::SmallVec;

/// Parser for the CGI/1.1 response a responder writes to its Stdout stream.
pub mod response;

pub use response::{Error, Response};


/// Values up to this many bytes are stored inline.
const INLINE_VALUE: usize = 32;

type Value = SmallVec<[u8; INLINE_VALUE]>;


macro_rules! var_names {
    ($($(#[$attr:meta])* $name:ident,)+) => {
        $(
            $(#[$attr])*
            pub const $name: &str = stringify!($name);
        )+
    };
}

// From RFC 3875, Section 4.1 (CGI/1.1)
var_names! {
    AUTH_TYPE,
    CONTENT_LENGTH,
    CONTENT_TYPE,
    GATEWAY_INTERFACE,
    PATH_INFO,
    PATH_TRANSLATED,
    QUERY_STRING,
    REMOTE_ADDR,
    REMOTE_HOST,
    REMOTE_IDENT,
    REMOTE_USER,
    REQUEST_METHOD,
    SCRIPT_NAME,
    SERVER_NAME,
    SERVER_PORT,
    SERVER_PROTOCOL,
    SERVER_SOFTWARE,
}

// Common webserver extensions
var_names! {
    /// The absolute path of the script on the responder's host. PHP-FPM
    /// refuses requests without it.
    SCRIPT_FILENAME,
    DOCUMENT_ROOT,
    REQUEST_URI,
    REQUEST_SCHEME,
    REMOTE_PORT,
    SERVER_ADDR,
    HTTPS,
}


/// An ordered set of CGI/1.1 parameters for a FastCGI request.
///
/// Parameters are kept in insertion order and are sent to the responder in
/// exactly that order. A name may occur multiple times. Names and values are
/// never normalized by `Params::append`, so HTTP header names must either
/// be transliterated by the caller or added through `Params::append_header`.
///
/// CGI/1.1 specifies variable names as case-insensitive (RFC 3875, Section
/// 4.1). Lookups and `Params::insert` therefore compare names ignoring ASCII
/// case, while the stored name keeps its original spelling.
///
/// Note that responders commonly store their environment as a map. Repeated
/// names may then collapse to the last value on the responder side.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Params {
    vars: Vec<(CompactString, Value)>,
}

impl Params {
    /// Creates an empty [`Params`].
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty [`Params`] with space for at least `cap` parameters.
    #[inline]
    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self { vars: Vec::with_capacity(cap) }
    }

    /// Appends a parameter, keeping any previous values for `name`.
    pub fn append(&mut self, name: impl Into<CompactString>, value: impl AsRef<[u8]>) {
        self.vars.push((name.into(), Value::from_slice(value.as_ref())));
    }

    /// Sets `name` to a single `value`.
    ///
    /// The first existing occurrence of `name` is overwritten in place and all
    /// later occurrences are removed. If `name` is not present yet, the
    /// parameter is appended.
    pub fn insert(&mut self, name: impl Into<CompactString>, value: impl AsRef<[u8]>) {
        let name = name.into();
        let value = Value::from_slice(value.as_ref());
        match self.position(&name) {
            Some(idx) => {
                self.vars[idx].1 = value;
                let tail: Vec<_> = self.vars.drain(idx + 1..)
                    .filter(|(n, _)| !n.eq_ignore_ascii_case(&name))
                    .collect();
                self.vars.extend(tail);
            },
            None => self.vars.push((name, value)),
        }
    }

    /// Appends an HTTP request header as a CGI/1.1 `HTTP_*` variable.
    ///
    /// The header name is converted to upper case and `-` is replaced by `_`,
    /// as described in RFC 3875, Section 4.1.18. For example, `Accept-Language`
    /// becomes `HTTP_ACCEPT_LANGUAGE`.
    pub fn append_header(&mut self, name: &str, value: impl AsRef<[u8]>) {
        let mut var = CompactString::with_capacity(5 + name.len());
        var.push_str("HTTP_");
        var.extend(name.chars().map(|c| match c {
            '-' => '_',
            c => c.to_ascii_uppercase(),
        }));
        self.append(var, value);
    }

    /// Appends all headers from an [`http::HeaderMap`].
    ///
    /// `Content-Type` and `Content-Length` are mapped to their dedicated CGI
    /// variables `CONTENT_TYPE` and `CONTENT_LENGTH`. All other headers are
    /// added via `Params::append_header`, with repeated headers kept in order.
    pub fn extend_headers(&mut self, headers: &http::HeaderMap) {
        self.vars.reserve(headers.len());
        for (name, value) in headers {
            if *name == http::header::CONTENT_TYPE {
                self.append(CONTENT_TYPE, value);
            } else if *name == http::header::CONTENT_LENGTH {
                self.append(CONTENT_LENGTH, value);
            } else {
                self.append_header(name.as_str(), value);
            }
        }
    }

    /// Returns the first value of `name`, if present.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.position(name).map(|idx| &*self.vars[idx].1)
    }

    /// Returns an iterator over all values of `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.vars.iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| &**v)
    }

    /// Returns an iterator over all parameters, in insertion order.
    pub fn iter(&self) -> Iter<'_> {
        Iter(self.vars.iter())
    }

    /// Returns the number of parameters, counting repeated names separately.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Tests whether there are no parameters.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.vars.iter().position(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map()
            .entries(self.vars.iter().map(|(n, v)| (n, String::from_utf8_lossy(v))))
            .finish()
    }
}

impl<N: Into<CompactString>, V: AsRef<[u8]>> Extend<(N, V)> for Params {
    fn extend<T: IntoIterator<Item = (N, V)>>(&mut self, iter: T) {
        for (name, value) in iter {
            self.append(name, value);
        }
    }
}

impl<N: Into<CompactString>, V: AsRef<[u8]>> FromIterator<(N, V)> for Params {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut params = Self::new();
        params.extend(iter);
        params
    }
}

/// Flattens a multi-valued map, as produced by many HTTP frameworks, into
/// [`Params`].
///
/// All values of one name stay adjacent and keep their list order. Names follow
/// the map's iteration order, which is unspecified. Names with an empty list
/// are skipped.
impl<K, V, S> From<HashMap<K, Vec<V>, S>> for Params
where
    K: Into<CompactString>,
    V: AsRef<[u8]>,
    S: BuildHasher,
{
    fn from(map: HashMap<K, Vec<V>, S>) -> Self {
        let mut params = Self::with_capacity(map.values().map(Vec::len).sum());
        for (name, values) in map {
            let name = name.into();
            for value in values {
                params.append(name.clone(), value);
            }
        }
        params
    }
}

impl<'a> IntoIterator for &'a Params {
    type Item = (&'a [u8], &'a [u8]);
    type IntoIter = Iter<'a>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}


/// An iterator over the name-value pairs of [`Params`] as raw bytes.
#[derive(Debug, Clone)]
pub struct Iter<'a>(std::slice::Iter<'a, (CompactString, Value)>);

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|(n, v)| (n.as_bytes(), &**v))
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}

impl ExactSizeIterator for Iter<'_> {}
impl std::iter::FusedIterator for Iter<'_> {}
