//! Veil proxy server
//!
//! Accepts HTTP(S) connections, decodes the request envelope carried in the
//! request target and serves DNS, Connect, Forward and LocalRP requests.
//! Everything else is answered like an ordinary web server would.
pub mod abuse_guard;
pub mod config;
pub mod dispatcher;
pub mod dns;
pub mod fallback;
pub mod forward;
pub mod mux;
pub mod request_head;
pub mod response;
pub mod server;
pub mod throttle;

pub use abuse_guard::AbuseGuard;
pub use config::{ServerConfig, TlsConfig};
pub use dispatcher::{DispatchError, Dispatcher, Outcome};
pub use fallback::{Fallback, FallbackError};
pub use forward::{ForwardError, Forwarder};
pub use mux::{serve_mux, Accepted};
pub use request_head::{HeadError, HttpConn, RequestHead};
pub use server::{ProxyServer, ServerError};
pub use throttle::ThrottleFactory;
