//! `flowbridge-storage` — durable state behind narrow store traits.
//!
//! The engine and the upstream client only see the [`RunStore`] and
//! [`SessionStore`] traits; in-memory implementations back dev and tests,
//! Postgres implementations back production.

pub mod postgres;
pub mod run_store;
pub mod session_store;

pub use postgres::{PgRunStore, PgSessionStore};
pub use run_store::{InMemoryRunStore, RunStore, StoreError};
pub use session_store::{InMemorySessionStore, SessionStore};
