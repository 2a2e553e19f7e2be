//! SQLite-backed event storage for capstan sessions.
//!
//! This crate provides persistent storage for the session event log. Every
//! message the runtime appends is stored in full, so a session can be
//! reloaded, repaired and resumed.
//!
//! # Core Concepts
//!
//! ## EventStore
//!
//! The [`EventStore`] wraps a SQLite database and provides methods to append
//! events and query session history. Events are returned in insertion order.
//!
//! ## Event
//!
//! An [`Event`] has a unique ID, the [`SessionId`] it belongs to, a timestamp
//! and an [`EventKind`]:
//! - `SessionStart` / `SessionEnd`: Session lifecycle
//! - `Message`: A serialized conversation message and its [`Role`]
//!
//! The store does not interpret message payloads; the runtime owns their
//! shape.
//!
//! # Example
//!
//! ```no_run
//! use storage::{EventStore, Event, EventKind, Role, SessionId};
//!
//! let store = EventStore::open("events.db")?;
//!
//! let session_id = SessionId::new();
//! store.append(&Event::new(session_id, EventKind::SessionStart))?;
//! store.append(&Event::message(
//!     session_id,
//!     Role::User,
//!     serde_json::json!({"role": "user", "content": "Hello"}),
//! ))?;
//!
//! for message in store.load_messages(session_id)? {
//!     println!("{message}");
//! }
//!
//! for summary in store.list_sessions()? {
//!     println!("{}: {} messages", summary.id, summary.message_count);
//! }
//! # Ok::<(), storage::Error>(())
//! ```

mod error;
mod event;
mod store;

pub use error::{Error, Result};
pub use event::{Event, EventKind, Role, SessionId};
pub use store::{EventStore, SessionSummary};
