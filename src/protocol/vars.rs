use super::nv::NVIter;
use super::Error as ProtocolError;


bitflags::bitflags! {
    /// A set of queryable FastCGI protocol variable names.
    ///
    /// The FastCGI client (HTTP server) can send a query for any combination
    /// of these names to the FastCGI server in a [`GetValues`][GetValues]
    /// record. The server responds with the names and values in a
    /// [`GetValuesResult`][GetValuesResult] record, which is decoded into
    /// [`ProtocolValues`].
    ///
    /// [GetValues]: super::RecordType::GetValues
    /// [GetValuesResult]: super::RecordType::GetValuesResult
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProtocolVariables: u8 {
        /// The maximum number of concurrent connections accepted by the application.
        const FCGI_MAX_CONNS = 0x01;
        /// The maximum number of concurrent requests accepted by the application.
        const FCGI_MAX_REQS = 0x02;
        /// Whether the application accepts multiplexed requests ("1") or not ("0").
        const FCGI_MPXS_CONNS = 0x04;
    }
}

impl ProtocolVariables {
    /// Parses the input bytes into a well-known FastCGI
    /// [`ProtocolVariables`] item.
    ///
    /// # Errors
    /// Returns an error if the variable name is unknown, which may also
    /// stem from an improper encoding.
    pub fn parse_name(name: &[u8]) -> Result<Self, ProtocolError> {
        // All well-known variable names are ASCII-only
        match std::str::from_utf8(name) {
            Ok(s) => Self::from_name(s).ok_or(ProtocolError::UnknownVariable),
            Err(_) => Err(ProtocolError::UnknownVariable),
        }
    }

    /// Encodes the body of a GetValues record querying these variables.
    ///
    /// Every name is sent with an empty value, as the protocol requires.
    pub fn write_query(self, out: &mut Vec<u8>) -> usize {
        let start = out.len();
        for (name, _) in self.iter_names() {
            // Names are short constants, so both lengths fit into one byte
            debug_assert!(name.len() < 0x80);
            #[allow(clippy::cast_possible_truncation)]
            let name_len = name.len() as u8;
            out.extend([name_len, 0]);
            out.extend_from_slice(name.as_bytes());
        }
        out.len() - start
    }
}


/// The decoded body of a GetValuesResult record.
///
/// Each field is [`None`] if the application did not report the variable, or
/// reported a value that is not a valid number.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolValues {
    /// The value of `FCGI_MAX_CONNS`.
    pub max_conns: Option<u32>,
    /// The value of `FCGI_MAX_REQS`.
    pub max_reqs: Option<u32>,
    /// The value of `FCGI_MPXS_CONNS`.
    pub mpxs_conns: Option<bool>,
}

impl ProtocolValues {
    /// Decodes the name-value pairs of a GetValuesResult record body.
    ///
    /// Unknown variable names are skipped, as are malformed values.
    #[must_use]
    pub fn parse(content: &[u8]) -> Self {
        let mut values = Self::default();
        for (name, value) in NVIter::new(content) {
            let Ok(var) = ProtocolVariables::parse_name(name) else { continue };
            let num = std::str::from_utf8(value).ok().and_then(|v| v.trim().parse::<u32>().ok());
            if var == ProtocolVariables::FCGI_MAX_CONNS {
                values.max_conns = num;
            } else if var == ProtocolVariables::FCGI_MAX_REQS {
                values.max_reqs = num;
            } else if var == ProtocolVariables::FCGI_MPXS_CONNS {
                values.mpxs_conns = num.map(|n| n != 0);
            }
        }
        values
    }
}
