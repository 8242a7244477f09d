//! Session registry for device-to-consumer routing
//!
//! The registry owns one [`StreamingSession`] per device. Each session runs a
//! capture helper and a worker task that ingests NAL units, keeps the
//! parameter cache current and fans units out to every attached consumer.
//!
//! # Architecture
//!
//! ```text
//!                        Arc<SessionRegistry>
//!                   ┌──────────────────────────┐
//!                   │ sessions: HashMap<Device,│
//!                   │   Mutex<StreamingSession>│
//!                   │ >                        │
//!                   └────────────┬─────────────┘
//!                                │ per device
//!                                ▼
//!   capture tunnel ──► worker: next_unit() ──► core.lock()
//!                                              ├─ cache.on_unit()
//!                                              └─ broadcaster.broadcast()
//!                                                   │        │        │
//!                                                   ▼        ▼        ▼
//!                                                 queue    queue    queue
//!                                                   │        │        │
//!                                                relay    relay    relay ──► WebSocket
//! ```
//!
//! # Zero-Copy Design
//!
//! `bytes::Bytes` uses reference counting, so all consumer queues share the
//! same memory allocation for a unit, including the replayed bundle.

pub mod broadcaster;
pub mod config;
pub mod error;
pub mod frame;
pub mod session;
pub mod store;

pub use broadcaster::{Broadcaster, ConsumerId, DetachReason, Subscription};
pub use config::RelayConfig;
pub use error::SessionError;
pub use frame::StreamEvent;
pub use session::{SessionState, StreamingSession};
pub use store::SessionRegistry;
