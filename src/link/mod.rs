//! Lower MAC implementations
//!
//! Only the in-process loopback exists: it wires engines together so an
//! access point and its stations can run inside one process.

mod loopback;

pub use loopback::LoopbackMac;
