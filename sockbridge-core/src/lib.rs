//! Sockbridge Core
//!
//! This crate contains the family-agnostic engine building blocks shared by
//! the stream-client, stream-server, and datagram socket families:
//! - Error taxonomy and stable wire result codes (`error`)
//! - Socket configuration and info snapshots (`config`)
//! - Id allocation + the dispatch-visible socket records (`registry`)
//! - Cross-thread mutation queue paired with the poll waker (`mailbox`)
//! - Single-shot completions for deferred call results (`completion`)
//! - Event-channel binding slot (`events`)
//! - The reactor thread harness and per-family driver seam (`reactor`)
//!
//! Ownership discipline: once a native handle has been handed to a reactor
//! through a mailbox message, only that reactor thread touches it. Dispatch
//! threads keep the integer id and communicate exclusively through the
//! mailbox, so no per-socket locking is needed.

#![allow(clippy::module_name_repetitions)]

pub mod completion;
pub mod config;
pub mod error;
pub mod events;
pub mod mailbox;
pub mod reactor;
pub mod registry;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::completion::{completion, Completion, CompletionHandle};
    pub use crate::config::{SocketConfig, SocketInfo, DEFAULT_BUFFER_SIZE};
    pub use crate::error::{codes, io_result_code, BridgeError, Result};
    pub use crate::events::EventBinding;
    pub use crate::mailbox::{mailbox, Command, Mailbox};
    pub use crate::reactor::{spawn, Drive, ReactorHandle, WAKE_TOKEN};
    pub use crate::registry::{IdAllocator, SocketId, SocketRegistry, SocketShared, SocketStatus};
}
