//! Process identity: `@public:internal:port` naming and priority ordering.
//!
//! A process name is the key used to order competing service offers and to
//! elect the clock reference; it is never used to route a message (addresses
//! are service-relative, not process-relative).

use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// A process's public identity within an ensemble.
///
/// Formatted on the wire and in logs as `@public_ip:internal_ip:port`, all
/// three fields rendered as fixed-width uppercase hex, matching the layout
/// the reference election and service-conflict tie-break compare
/// lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessName {
    pub public_ip: u32,
    pub internal_ip: u32,
    pub port: u16,
}

impl ProcessName {
    pub fn new(public_ip: u32, internal_ip: u32, port: u16) -> Self {
        ProcessName {
            public_ip,
            internal_ip,
            port,
        }
    }

    /// Tuple used for total ordering: public ip first, then internal ip,
    /// then port, all compared as unsigned integers.
    fn sort_key(&self) -> (u32, u32, u16) {
        (self.public_ip, self.internal_ip, self.port)
    }

    /// True if `self` has priority over `other` in a service conflict or
    /// clock reference election (greater sort key wins).
    pub fn outranks(&self, other: &ProcessName) -> bool {
        self.sort_key() > other.sort_key()
    }
}

impl fmt::Display for ProcessName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "@{:08x}:{:08x}:{:04x}",
            self.public_ip, self.internal_ip, self.port
        )
    }
}

impl FromStr for ProcessName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('@')
            .ok_or_else(|| CoreError::BadProcessName(s.to_string()))?;
        let mut parts = rest.split(':');
        let (pub_s, int_s, port_s) = (
            parts.next(),
            parts.next(),
            parts.next(),
        );
        if parts.next().is_some() {
            return Err(CoreError::BadProcessName(s.to_string()));
        }
        let parse_hex_u32 = |v: Option<&str>| -> Option<u32> {
            v.and_then(|v| u32::from_str_radix(v, 16).ok())
        };
        let parse_hex_u16 = |v: Option<&str>| -> Option<u16> {
            v.and_then(|v| u16::from_str_radix(v, 16).ok())
        };
        let public_ip = parse_hex_u32(pub_s).ok_or_else(|| CoreError::BadProcessName(s.to_string()))?;
        let internal_ip = parse_hex_u32(int_s).ok_or_else(|| CoreError::BadProcessName(s.to_string()))?;
        let port = parse_hex_u16(port_s).ok_or_else(|| CoreError::BadProcessName(s.to_string()))?;
        Ok(ProcessName {
            public_ip,
            internal_ip,
            port,
        })
    }
}
