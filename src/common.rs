//! Common definitions that are shared between different parts of the runner.

// Use sorted maps for consistent report output
pub use std::collections::BTreeMap as Map;

/// Identifiers: register, label and function names.
pub type Id = internment::Intern<String>;
