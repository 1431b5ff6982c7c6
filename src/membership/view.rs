use std::{collections::BTreeSet, fmt};

use crate::common::id::ProcessorId;

/// A processor's view of its group: the ids it currently believes alive.
///
/// Members are kept sorted, which also gives the attendance-list ring its
/// order: the first member originates the token and each member hands it to
/// its successor, wrapping around to the first.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Membership {
    members: BTreeSet<ProcessorId>,
}

impl Membership {
    pub fn new() -> Self {
        Membership::default()
    }

    pub fn singleton(id: ProcessorId) -> Self {
        Membership {
            members: BTreeSet::from([id]),
        }
    }

    pub fn contains(&self, id: ProcessorId) -> bool {
        self.members.contains(&id)
    }

    pub fn insert(&mut self, id: ProcessorId) -> bool {
        self.members.insert(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ProcessorId> + '_ {
        self.members.iter().copied()
    }

    pub fn union(&self, other: &Membership) -> Membership {
        Membership {
            members: self.members.union(&other.members).copied().collect(),
        }
    }

    /// This view with `id` added.
    pub fn with(&self, id: ProcessorId) -> Membership {
        let mut members = self.members.clone();
        members.insert(id);
        Membership { members }
    }

    pub fn to_vec(&self) -> Vec<ProcessorId> {
        self.iter().collect()
    }

    /// The member that originates the attendance token.
    pub fn originator(&self) -> Option<ProcessorId> {
        self.members.first().copied()
    }

    pub fn position(&self, id: ProcessorId) -> Option<usize> {
        self.members.iter().position(|member| *member == id)
    }

    /// Next member after `id` in ring order, wrapping around. `None` if `id`
    /// is not a member.
    pub fn successor(&self, id: ProcessorId) -> Option<ProcessorId> {
        if !self.contains(id) {
            return None;
        }
        self.members
            .range((std::ops::Bound::Excluded(id), std::ops::Bound::Unbounded))
            .next()
            .or_else(|| self.members.first())
            .copied()
    }
}

impl FromIterator<ProcessorId> for Membership {
    fn from_iter<I: IntoIterator<Item = ProcessorId>>(iter: I) -> Self {
        Membership {
            members: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", member)?;
        }
        write!(f, "}}")
    }
}
