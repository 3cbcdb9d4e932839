//! # murmur-core
//!
//! Presence, message routing and call signaling for the murmur chat server.
//!
//! This crate provides:
//!
//! - **Session** - One live outbound channel per user
//! - **Routing** - Live delivery or durable offline queueing of chat messages
//! - **Signaling** - Call lifecycle and SDP/ICE relay between two participants
//! - **Store** - The persistence collaborator the core reads and writes through
//! - **Core** - The facade a transport drives per connection
//!
//! ## Architecture
//!
//! ```text
//!                  ┌─────────────┐
//!  transport ─────▶│    Core     │
//!                  └─────────────┘
//!                   │          │
//!                   ▼          ▼
//!          ┌─────────────┐ ┌─────────────┐
//!          │   Router    │ │  Signaling  │
//!          └─────────────┘ └─────────────┘
//!             │      │        │      │
//!             │      ▼        ▼      │
//!             │  ┌─────────────┐     │
//!             │  │  Sessions   │     │
//!             │  └─────────────┘     │
//!             ▼                      ▼
//!          ┌──────────────────────────┐
//!          │          Store           │
//!          └──────────────────────────┘
//! ```

pub mod call;
pub mod dispatch;
pub mod error;
pub mod memory;
pub mod message;
pub mod routing;
pub mod session;
pub mod signaling;
pub mod store;

pub use call::{Call, CallEvent, NewCall};
pub use dispatch::{Connected, Core, CoreConfig, Dispatched};
pub use error::{ConnectError, DispatchError};
pub use memory::MemoryStore;
pub use message::{now_millis, ChatMessage, NewMessage, NewOfflineItem, OfflineItem, OfflineItemId};
pub use routing::{FlushOutcome, MessageRouter, Recipient, RouteOutcome};
pub use session::{ConnectionId, Delivery, Outbound, SessionClosed, SessionHandle, SessionStore};
pub use signaling::{CallSignaling, IgnoreReason, SignalOutcome};
pub use store::{FriendshipStatus, Store, StoreError};
