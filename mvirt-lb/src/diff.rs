//! Set difference over normalized keys.

use std::collections::HashSet;

use crate::normalize::Normalize;

/// Entities to add and remove to turn `current` into `desired`.
///
/// Both lists reference the original entities, not their keys, and keep the
/// order in which the entities were passed in.
#[derive(Debug)]
pub struct Diff<'a, T> {
    pub to_add: Vec<&'a T>,
    pub to_remove: Vec<&'a T>,
}

impl<T> Diff<'_, T> {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Compute `desired - current` and `current - desired` under normalized equality.
pub fn diff<'a, T, D, C>(desired: D, current: C) -> Diff<'a, T>
where
    T: Normalize + 'a,
    D: IntoIterator<Item = &'a T>,
    C: IntoIterator<Item = &'a T>,
{
    let desired: Vec<&T> = desired.into_iter().collect();
    let current: Vec<&T> = current.into_iter().collect();

    let desired_keys: HashSet<T::Key> = desired.iter().map(|e| e.normalized()).collect();
    let current_keys: HashSet<T::Key> = current.iter().map(|e| e.normalized()).collect();

    let to_add = desired
        .into_iter()
        .filter(|e| !current_keys.contains(&e.normalized()))
        .collect();
    let to_remove = current
        .into_iter()
        .filter(|e| !desired_keys.contains(&e.normalized()))
        .collect();

    Diff { to_add, to_remove }
}
