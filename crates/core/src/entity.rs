//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Every record the engine persists (connectors, tasks, payment initiations,
/// connection attempts, schedules...) is keyed by its entity id.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
