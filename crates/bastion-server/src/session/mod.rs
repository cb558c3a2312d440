//! Session bookkeeping.

pub mod registry;

pub use registry::{SessionRegistry, TransportId};
