//! Adapters for the driven ports that do not depend on the host fabric.

pub mod time;

pub use time::SystemTimeSource;
