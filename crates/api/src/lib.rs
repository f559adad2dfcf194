//! `flowbridge-api` — the thin HTTP surface and process wiring.
//!
//! Routes expose run creation and status to callers; the binary owns the
//! single session manager and scheduler instances and injects them into the
//! engine (no module-level singletons).

pub mod app;
pub mod settings;
