//! Small shared helpers

pub mod serde_b64;
