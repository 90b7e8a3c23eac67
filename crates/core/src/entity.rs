//! Things identified by a key rather than by their values (accounts, members).

pub trait Entity {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Stable identity; two values with the same id are the same thing.
    fn id(&self) -> &Self::Id;
}
