//! Error plumbing shared by the toolstream crates.

pub mod context;

pub use context::FromMessage;
