use super::varint::VarInt;
use super::Error as ProtocolError;


/// An iterator decoding complete name-value pairs from its input.
///
/// Iteration stops at the first incomplete pair. The undecoded remainder is
/// available through `NVIter::into_inner`.
#[derive(Debug, Clone)]
pub struct NVIter<'a> {
    data: &'a [u8],
}

impl<'a> NVIter<'a> {
    /// Creates a new [`NVIter`] over the referenced input bytes.
    #[inline]
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Extracts the remaining input bytes from the iterator.
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> &'a [u8] {
        self.data
    }
}

impl<'a> Iterator for NVIter<'a> {
    /// The name-value pair returned by the iterator.
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let mut cur = self.data;
        let name_len = VarInt::take(&mut cur)?.to_usize();
        let val_len = VarInt::take(&mut cur)?.to_usize();
        let total_len = name_len.checked_add(val_len)?;

        if cur.len() >= total_len {
            self.data = &cur[total_len..];
            Some((&cur[..name_len], &cur[name_len..total_len]))
        } else {
            None
        }
    }
}

impl std::iter::FusedIterator for NVIter<'_> {}


/// Encodes a name-value pair into `out`.
///
/// # Errors
/// Returns [`ProtocolError::InvalidVarInt`] if either length exceeds
/// [`VarInt::MAX`]. `out` is left unmodified in this case.
pub fn write((name, value): (&[u8], &[u8]), out: &mut Vec<u8>) -> Result<usize, ProtocolError> {
    let name_len = VarInt::try_from(name.len())?;
    let val_len = VarInt::try_from(value.len())?;

    out.reserve(name_len.encoded_len() + val_len.encoded_len() + name.len() + value.len());
    let written = name_len.push(out) + val_len.push(out);
    out.extend_from_slice(name);
    out.extend_from_slice(value);
    Ok(written + name.len() + value.len())
}

/// Encodes a sequence of name-value pairs back to back into `out`, in the
/// order given by `pairs`.
///
/// Names and values are copied verbatim. On error, `out` is restored to its
/// original length.
///
/// # Errors
/// Returns [`ProtocolError::InvalidVarInt`] if a name or value is too long
/// to be length-prefixed.
pub fn write_all<I, N, V>(pairs: I, out: &mut Vec<u8>) -> Result<usize, ProtocolError>
where
    I: IntoIterator<Item = (N, V)>,
    N: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    let start = out.len();
    for (name, value) in pairs {
        if let Err(e) = write((name.as_ref(), value.as_ref()), out) {
            out.truncate(start);
            return Err(e);
        }
    }
    Ok(out.len() - start)
}
