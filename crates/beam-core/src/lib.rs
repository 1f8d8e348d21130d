//! # beam-core
//!
//! Session membership, ordered fan-out, and follow-graph coordination for
//! the Beam broadcast coordinator.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **UserRegistry** - connection-to-identity mapping with reconnection
//! - **SessionRegistry** - session lifecycle, membership, catch-up buffers
//! - **FollowGraph** - directed follow edges with reverse lookup
//! - **Dispatcher** - best-effort frame delivery to connections
//! - **Hub** - composes the above; one atomic unit of work per frame
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────────┐
//! │  Connection │────▶│     Hub     │────▶│  SessionRegistry │
//! └─────────────┘     └─────────────┘     └──────────────────┘
//!                        │       │
//!                        ▼       ▼
//!                ┌────────────┐ ┌─────────────┐
//!                │ Dispatcher │ │ FollowGraph │
//!                └────────────┘ └─────────────┘
//! ```
//!
//! Registries are constructed once inside the [`Hub`] at process start and
//! reached only through it; there is no global state.

pub mod dispatch;
pub mod error;
pub mod follow;
pub mod hub;
pub mod registry;
pub mod session;
pub mod user;

pub use dispatch::{ConnectionId, Dispatcher, OutboundSender};
pub use error::CoreError;
pub use follow::FollowGraph;
pub use hub::{Hub, HubConfig, HubStats};
pub use registry::SessionRegistry;
pub use session::{CatchUpBuffer, Session, SessionKey, DEFAULT_CATCH_UP_CAPACITY};
pub use user::{User, UserRegistry};
