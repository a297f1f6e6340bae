//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by their attribute values;
/// identity does not matter. `Credits { minor: 250 }` equals any other
/// `Credits` with the same amount, while two `Task`s with the same fields
/// but different ids are still different tasks (entities).
///
/// To "modify" a value object, create a new one with the new values.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
