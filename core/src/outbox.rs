//! Pending-change (outbox) rows.
//!
//! Every create or delete of a user writes exactly one [`PendingChange`] in
//! the same transaction as the mutation. A row exists if and only if the
//! corresponding mutation committed; a downstream publisher drains the table.

use crate::user::UserId;
use serde::{Deserialize, Serialize};

/// Kind of change recorded in the outbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutboxChangeType {
    /// A user row was inserted.
    Create,
    /// A user row was removed.
    Delete,
}

impl OutboxChangeType {
    /// Column value in the `outbox` table.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Delete => "delete",
        }
    }

    /// Parse the column value.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One outbox row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Kind of mutation.
    pub change_type: OutboxChangeType,
    /// User the mutation applied to.
    pub user_id: UserId,
}

impl PendingChange {
    /// Outbox row for a created user.
    #[must_use]
    pub const fn create(user_id: UserId) -> Self {
        Self {
            change_type: OutboxChangeType::Create,
            user_id,
        }
    }

    /// Outbox row for a deleted user.
    #[must_use]
    pub const fn delete(user_id: UserId) -> Self {
        Self {
            change_type: OutboxChangeType::Delete,
            user_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_type_column_values_are_stable() {
        assert_eq!(OutboxChangeType::Create.as_str(), "create");
        assert_eq!(OutboxChangeType::Delete.as_str(), "delete");
        assert_eq!(OutboxChangeType::parse("delete"), Some(OutboxChangeType::Delete));
        assert_eq!(OutboxChangeType::parse("update"), None);
    }
}
