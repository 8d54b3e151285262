//! Multi-process cluster plumbing.
//!
//! The coordinator lives in the supervisor process. It is the single log
//! authority and the relay hub between workers. Each worker holds one
//! [`CoordinatorLink`] to it, used both as its [`MessageLog`] and its
//! [`Relay`].
//!
//! Both ends work over any ordered byte stream (tokio TCP in production,
//! turmoil TCP in network simulation).
//!
//! [`MessageLog`]: crate::MessageLog
//! [`Relay`]: crate::Relay

mod coordinator;
mod link;

use std::time::Duration;

pub use coordinator::{Coordinator, CoordinatorConfig};
pub use link::{CoordinatorLink, LinkClosed};

/// Default time a worker waits for a coordinator reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
