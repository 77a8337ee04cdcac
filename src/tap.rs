//! Tap-based publish/subscribe fan-out.

/// Loop-guard ceiling on chained taps: a message that has already been
/// forwarded through this many taps is delivered without further fan-out.
pub const MAX_TAP_TTL: u8 = 3;

/// Which transport a tapped copy travels over when its tapper turns out to
/// be on a remote process (irrelevant when the tapper is local, since
/// dispatch never leaves the current poll loop in that case).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapMode {
    /// Forward over whichever transport carried the original message.
    Keep,
    /// Always forward over TCP, regardless of how the original arrived.
    Reliable,
    /// Always forward over UDP, regardless of how the original arrived.
    BestEffort,
}

/// A standing subscription: messages addressed to `tappee` are also
/// delivered to `tapper`, with the tappee's service segment rewritten to
/// `tapper`'s in the forwarded copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tap {
    pub tappee: String,
    pub tapper: String,
    pub mode: TapMode,
}

impl Tap {
    pub fn new(tappee: impl Into<String>, tapper: impl Into<String>, mode: TapMode) -> Self {
        Tap {
            tappee: tappee.into(),
            tapper: tapper.into(),
            mode,
        }
    }

    /// Rewrite `address`'s leading service segment from the tappee's name
    /// to the tapper's, leaving the remainder of the path untouched.
    pub fn rewrite_address(&self, address: &str) -> String {
        match address.split_once('/').and_then(|_| address[1..].find('/')) {
            Some(i) => format!("/{}{}", self.tapper, &address[1 + i..]),
            None => format!("/{}", self.tapper),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_substitutes_service_segment_only() {
        let tap = Tap::new("synth", "logger", TapMode::Keep);
        assert_eq!(tap.rewrite_address("/synth/1/freq"), "/logger/1/freq");
    }

    #[test]
    fn rewrite_handles_bare_service_address() {
        let tap = Tap::new("synth", "logger", TapMode::Reliable);
        assert_eq!(tap.rewrite_address("/synth"), "/logger");
    }

    #[test]
    fn ttl_constant_matches_documented_ceiling() {
        assert_eq!(MAX_TAP_TTL, 3);
    }
}
