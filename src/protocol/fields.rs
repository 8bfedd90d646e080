use std::fmt;

use super::Error as ProtocolError;


/// Implements the conversions between a field-less wire enum and its
/// integer representation. Unknown values map to the given error variant.
macro_rules! wire_repr {
    ($ty:ident: $repr:ty => $err:ident) => {
        impl TryFrom<$repr> for $ty {
            type Error = ProtocolError;

            #[doc = concat!("Parses a [`", stringify!($repr), "`] as a FastCGI [`", stringify!($ty), "`].")]
            ///
            /// # Errors
            /// Returns an error if the value is not defined by the protocol.
            #[inline]
            fn try_from(v: $repr) -> Result<Self, Self::Error> {
                Self::from_repr(v).ok_or(ProtocolError::$err(v))
            }
        }

        impl From<$ty> for $repr {
            #[inline]
            fn from(v: $ty) -> Self {
                v as Self
            }
        }
    };
}


/// A validated FastCGI version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::FromRepr)]
#[repr(u8)]
pub enum Version {
    /// FastCGI Version 1
    V1 = 1,
}

wire_repr!(Version: u8 => UnknownVersion);


/// A validated FastCGI role identifier.
///
/// This client only ever requests the [`Role::Responder`] role. The other
/// roles are kept so that [`BeginRequest`](super::body::BeginRequest) bodies
/// can be decoded faithfully.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::FromRepr)]
#[cfg_attr(test, derive(strum::EnumIter))]
#[repr(u16)]
pub enum Role {
    Responder = 1,
    Authorizer = 2,
    Filter = 3,
}

wire_repr!(Role: u16 => UnknownRole);


bitflags::bitflags! {
    /// A validated set of FastCGI request flags.
    #[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RequestFlags: u8 {
        /// Keep the connection open after processing this request. Set on
        /// every request of a multiplexed client connection.
        const KeepConn = 1;
    }
}

impl TryFrom<u8> for RequestFlags {
    type Error = ProtocolError;

    /// Parses a [`u8`] as a FastCGI [`RequestFlags`] set.
    ///
    /// # Errors
    /// Returns an error naming the unknown bits, if any.
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v & !Self::all().bits() {
            0 => Ok(Self::from_bits_retain(v)),
            unknown => Err(ProtocolError::UnknownFlags(unknown)),
        }
    }
}

impl From<RequestFlags> for u8 {
    #[inline]
    fn from(v: RequestFlags) -> Self {
        v.bits()
    }
}

impl fmt::Debug for RequestFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("RequestFlags(")?;
        bitflags::parser::to_writer(self, &mut *f)?;
        f.write_str(")")
    }
}


/// A validated FastCGI response protocol status, as carried by the
/// EndRequest record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::FromRepr)]
#[cfg_attr(test, derive(strum::EnumIter))]
#[repr(u8)]
pub enum ProtocolStatus {
    /// The request completed normally.
    RequestComplete = 0,
    /// The responder cannot multiplex and already serves a request on this
    /// connection.
    CantMpxConn = 1,
    /// The responder ran out of some resource.
    Overloaded = 2,
    /// The responder does not implement the requested role.
    UnknownRole = 3,
}

wire_repr!(ProtocolStatus: u8 => UnknownStatus);

impl ProtocolStatus {
    /// Tests whether this status reports a normally completed request.
    #[inline]
    #[must_use]
    pub fn is_complete(self) -> bool {
        self == Self::RequestComplete
    }
}

impl fmt::Display for ProtocolStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::RequestComplete => "request complete",
            Self::CantMpxConn => "cannot multiplex connection",
            Self::Overloaded => "responder overloaded",
            Self::UnknownRole => "unknown role",
        })
    }
}


/// A validated FastCGI record type.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::FromRepr)]
#[cfg_attr(test, derive(strum::EnumIter))]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    Unknown = 11,
}

wire_repr!(RecordType: u8 => UnknownRecordType);

impl RecordType {
    /// Tests whether this [`RecordType`] represents a management record.
    #[inline]
    #[must_use]
    pub fn is_management(self) -> bool {
        use RecordType::*;
        matches!(self, GetValues | GetValuesResult | Unknown)
    }

    /// Tests whether this [`RecordType`] represents a stream record, which
    /// is terminated by an empty record of the same type.
    #[inline]
    #[must_use]
    pub fn is_stream(self) -> bool {
        use RecordType::*;
        matches!(self, Params | Stdin | Stdout | Stderr | Data)
    }
}
