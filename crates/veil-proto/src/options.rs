//! Request option flags carried inside the envelope

/// Option bitset of a client request (u16 on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestOptions(u16);

impl RequestOptions {
    pub const DNS: u16 = 0x0001;
    pub const CONNECT: u16 = 0x0002;
    pub const FORWARD: u16 = 0x0004;
    pub const LOCAL_RP: u16 = 0x0008;
    pub const UDP_RELAY: u16 = 0x0010;
    pub const MUX_UPGRADE: u16 = 0x0020;
    pub const WEBSOCKET: u16 = 0x0040;
    pub const PARTIAL: u16 = 0x0080;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with(mut self, flag: u16) -> Self {
        self.0 |= flag;
        self
    }

    pub fn set(&mut self, flag: u16) {
        self.0 |= flag;
    }

    pub fn is_set(&self, flag: u16) -> bool {
        self.0 & flag != 0
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn from_u16(value: u16) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_options() {
        let opts = RequestOptions::new();
        assert!(!opts.is_set(RequestOptions::CONNECT));
        assert_eq!(opts.as_u16(), 0);
    }

    #[test]
    fn test_combined_flags() {
        let opts = RequestOptions::new()
            .with(RequestOptions::CONNECT)
            .with(RequestOptions::UDP_RELAY);

        assert!(opts.is_set(RequestOptions::CONNECT));
        assert!(opts.is_set(RequestOptions::UDP_RELAY));
        assert!(!opts.is_set(RequestOptions::DNS));
        assert_eq!(RequestOptions::from_u16(opts.as_u16()), opts);
    }

    #[test]
    fn test_flags_are_distinct() {
        let all = [
            RequestOptions::DNS,
            RequestOptions::CONNECT,
            RequestOptions::FORWARD,
            RequestOptions::LOCAL_RP,
            RequestOptions::UDP_RELAY,
            RequestOptions::MUX_UPGRADE,
            RequestOptions::WEBSOCKET,
            RequestOptions::PARTIAL,
        ];
        let combined = all.iter().fold(0u16, |acc, f| {
            assert_eq!(acc & f, 0);
            acc | f
        });
        assert_eq!(combined.count_ones() as usize, all.len());
    }
}
