//! Protocol layer: listeners, connections, and the HTTP/1.1 + HTTP/2
//! adapters behind the [`channel::HttpChannel`] capability set.
//!
//! ```text
//! TCP/TLS connection → protocol select (ALPN / preface) → H1 or H2 adapter
//!     → RequestHead + HttpChannel → Router → RequestState → response
//! ```

pub mod channel;
pub mod conn;
pub mod h1;
pub mod h2;
pub mod hpack;
pub mod listener;

pub use channel::{BodyFraming, HttpChannel, Protocol, RequestHead};
pub use listener::{shutdown, start_listener, start_listeners, ListenerHandle, SHUTDOWN_GRACE};
