use super::Error as ProtocolError;


/// A [`u32`] which can be variably encoded in either 1 or 4 bytes.
///
/// Name-value pairs in Params and GetValues records prefix both name and
/// value with their length in this format.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VarInt(u32);

impl VarInt {
    /// The bit indicating whether the 4-byte encoding is used.
    const LONG_BIT: u8 = 1 << 7;
    /// The maximum value a [`VarInt`] can encode.
    pub const MAX: Self = VarInt((1 << 31) - 1);

    /// Decodes a [`VarInt`] from the front of `data` and advances `data`
    /// past it.
    ///
    /// Returns [`None`] and leaves `data` untouched if the encoding is
    /// truncated.
    pub fn take(data: &mut &[u8]) -> Option<Self> {
        let (&first, rest) = data.split_first()?;
        if first & Self::LONG_BIT == 0 {
            *data = rest;
            return Some(Self(first.into()));
        }

        let long = data.get(..4)?;
        let v = u32::from_be_bytes([first & !Self::LONG_BIT, long[1], long[2], long[3]]);
        *data = &data[4..];
        Some(Self(v))
    }

    /// The number of bytes in the wire format of this [`VarInt`].
    #[inline]
    #[must_use]
    pub fn encoded_len(self) -> usize {
        if self.0 < u32::from(Self::LONG_BIT) { 1 } else { 4 }
    }

    /// Appends the wire format of this [`VarInt`] to `out`.
    ///
    /// Returns the number of bytes appended.
    pub fn push(self, out: &mut Vec<u8>) -> usize {
        if self.0 < u32::from(Self::LONG_BIT) {
            #[allow(clippy::cast_possible_truncation)]
            out.push(self.0 as u8);
            1
        } else {
            let mut e = u32::to_be_bytes(self.0);
            e[0] |= Self::LONG_BIT;
            out.extend_from_slice(&e);
            e.len()
        }
    }

    /// Converts the [`VarInt`] into a [`usize`], saturating at [`usize::MAX`].
    #[inline]
    #[must_use]
    pub fn to_usize(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

impl From<VarInt> for u32 {
    #[inline]
    fn from(v: VarInt) -> Self {
        v.0
    }
}

impl TryFrom<usize> for VarInt {
    type Error = ProtocolError;

    /// Converts a length into a [`VarInt`], unless it is too large.
    ///
    /// # Errors
    /// Returns an error if the length exceeds [`VarInt::MAX`].
    #[inline]
    fn try_from(v: usize) -> Result<Self, Self::Error> {
        match u32::try_from(v) {
            Ok(v) if v <= Self::MAX.0 => Ok(Self(v)),
            _ => Err(ProtocolError::InvalidVarInt),
        }
    }
}


#[cfg(test)]
mod tests {
    use std::iter::repeat_with;
    use super::*;

    #[test]
    fn convert() {
        assert!(matches!(VarInt::try_from(45828usize), Ok(VarInt(45828))));
        assert!(matches!(VarInt::try_from(VarInt::MAX.to_usize()), Ok(VarInt::MAX)));
        if let Ok(too_large) = usize::try_from(u32::from(VarInt::MAX) + 1) {
            assert!(matches!(VarInt::try_from(too_large), Err(ProtocolError::InvalidVarInt)));
        }
    }

    #[test]
    fn length_boundary() {
        // Lengths below 128 use a single byte, all others use four
        for (v, len) in [(0, 1), (127, 1), (128, 4), (65535, 4), (VarInt::MAX.0, 4)] {
            let mut buf = Vec::new();
            assert_eq!(VarInt(v).push(&mut buf), len);
            assert_eq!(VarInt(v).encoded_len(), len);
            assert_eq!(buf.len(), len);
            assert_eq!(buf[0] & VarInt::LONG_BIT != 0, len == 4);
        }
    }

    #[test]
    fn decode_advances() {
        let rand_v = repeat_with(|| fastrand::u32(..=VarInt::MAX.0)).take(50);
        let values: Vec<_> = rand_v.chain([0, 1, 127, 128, 6819, VarInt::MAX.0]).collect();
        let mut buf = Vec::new();
        for &v in &values {
            VarInt(v).push(&mut buf);
        }

        let mut cur = &buf[..];
        for &v in &values {
            assert_eq!(VarInt::take(&mut cur), Some(VarInt(v)));
        }
        assert!(cur.is_empty());
    }

    #[test]
    fn decode_wire() {
        let mut short: &[u8] = &[96, 0xff];
        assert_eq!(VarInt::take(&mut short), Some(VarInt(96)));
        assert_eq!(short, [0xff]);

        let mut long: &[u8] = &[0x80 | 0x11, 0xda, 0xef, 0x31];
        assert_eq!(VarInt::take(&mut long), Some(VarInt(0x11da_ef31)));
        assert!(long.is_empty());
    }

    #[test]
    fn decode_truncated() {
        const LONG: &[u8] = &[0x80 | 0x11, 0xda, 0xef, 0x31];
        for len in 0..4 {
            let mut cut = &LONG[..len];
            assert_eq!(VarInt::take(&mut cut), None, "decoded {len} bytes");
            assert_eq!(cut.len(), len);
        }
    }
}
