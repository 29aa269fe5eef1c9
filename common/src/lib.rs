//! Small utilities shared by the refguard crates.

pub mod lock;
pub mod rand;
