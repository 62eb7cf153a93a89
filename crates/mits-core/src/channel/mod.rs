//! Interactive command channels.
//!
//! - [`Transport`]: raw byte channel (pty-backed local shell or `ssh`)
//! - [`ChannelSession`]: prompt-synchronised request/response on top of it
//! - [`SharedSession`]: one session shared between threads

pub mod session;
pub mod shared;
pub mod transport;

pub use session::{
    ChannelSession, Phase, SessionConfig, SessionError, SessionResult, SessionState,
    DEFAULT_SENTINEL,
};
pub use shared::SharedSession;
pub use transport::{PtyTransport, SshTarget, Transport, TransportError, TransportResult};
