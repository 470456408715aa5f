//! Decoded client request

use crate::options::RequestOptions;
use crate::IV_LEN;
use rand::rngs::OsRng;
use rand::RngCore;

/// Per-request initialization vector
pub type Iv = [u8; IV_LEN];

/// A request decoded from the envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    /// Auth token (opaque)
    pub auth: String,
    /// host:port, URL, or a logical token (e.g. a LocalRP correlation key)
    pub destination: String,
    pub options: RequestOptions,
    /// Seeds every cipher operation for this request
    pub iv: Iv,
}

impl ClientRequest {
    /// Build a request with a fresh random IV
    pub fn new(
        auth: impl Into<String>,
        destination: impl Into<String>,
        options: RequestOptions,
    ) -> Self {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        Self {
            auth: auth.into(),
            destination: destination.into(),
            options,
            iv,
        }
    }

    pub fn is_set(&self, flag: u16) -> bool {
        self.options.is_set(flag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_request_has_unique_iv() {
        let a = ClientRequest::new("", "example.com:80", RequestOptions::new());
        let b = ClientRequest::new("", "example.com:80", RequestOptions::new());
        assert_ne!(a.iv, b.iv);
    }
}
