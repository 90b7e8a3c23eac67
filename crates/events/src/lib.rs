//! Domain events emitted by the lending, contributions and accounting
//! aggregates.

pub mod event;

pub use event::Event;
