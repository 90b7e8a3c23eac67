//! `vikoba-core` — domain foundation building blocks for the village-banking ledger.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod entity;
pub mod error;
pub mod id;
pub mod money;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, GroupId, MemberId, UserId};
pub use money::Money;
pub use value_object::ValueObject;
