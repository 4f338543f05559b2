//! Server core for a multi-client real-time conferencing system.
//!
//! A host creates a meeting identified by a six-digit code, admits
//! participants through an explicit approval workflow, and the server then
//! relays chat, file-transfer traffic, and live media among members until
//! they leave. Control traffic runs over a length-prefixed JSON stream on
//! TCP; video and audio frames are fanned out over UDP.
//!
//! ## Example
//!
//! ```no_run
//! use huddle::server::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), huddle::HuddleError> {
//!     let server = Server::new(ServerConfig::default());
//!     server.serve().await
//! }
//! ```

pub mod adaptive;
pub mod error;
pub mod media;
pub mod messages;
pub mod server;

pub use adaptive::{LinkReport, QualityLadder, QualityLevel, Step};
pub use error::HuddleError;
pub use media::{AudioHeader, MediaHeader, MediaParseError, VideoHeader};
pub use messages::{AbortReason, ControlMessage, Decoded, ErrorKind, FrameDecoder, FrameError};
pub use server::{Server, ServerConfig};
