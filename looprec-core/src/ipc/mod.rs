//! Event and snapshot types consumed by the UI collaborator.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a shell
//! (Tauri, CLI, test harness) can forward them over any event bus without
//! re-mapping.

pub mod events;
