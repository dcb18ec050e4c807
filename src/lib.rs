pub mod config;
pub mod encoding;
pub mod error;
pub mod events;
pub mod multipart;
pub mod router;
pub mod server;
pub mod sse;
pub mod state;
pub mod static_files;
pub mod typed;

pub use config::{ListenerConfig, RuntimeConfig};
pub use error::{ErrorReason, HandlerOutcome, HandlerResult, SendError, StreamEnded};
pub use events::{bus, EventBus, EventName, EventPayload, Flow};
pub use router::{ListenerContext, RouteNode, Router, SecurityCheck};
pub use sse::SseHandle;
pub use state::{BodyFormat, RequestState, SetCookieOptions};
pub use static_files::SendFileOptions;
