// Picks, draftable items and their category pairs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a draft participant (an authenticated user id).
pub type UserId = String;

/// Identifier of a draftable item.
pub type ItemId = String;

/// The pair of categories an item belongs to (e.g. a team and a position).
///
/// Two items with equal pairs conflict under the category rule; the
/// comparison is exact and order-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CategoryPair {
    pub primary: String,
    pub secondary: String,
}

impl CategoryPair {
    pub fn new(primary: impl Into<String>, secondary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            secondary: secondary.into(),
        }
    }
}

impl fmt::Display for CategoryPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.primary, self.secondary)
    }
}

/// A draftable item from the shared pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: ItemId,
    pub name: String,
    pub categories: CategoryPair,
}

/// A single accepted pick. Entries in the pick log are append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pick {
    pub id: String,
    /// Round the pick was made in (1-indexed).
    pub round: u32,
    /// Overall pick number (1-indexed); totally orders the log.
    pub pick_number: u32,
    pub user_id: UserId,
    pub item_id: ItemId,
    /// True when the pick was synthesized after the turn timer expired.
    #[serde(default)]
    pub is_auto_pick: bool,
    pub timestamp: DateTime<Utc>,
}

impl Pick {
    /// Identity used to recognize redelivered pick notifications.
    pub fn identity(&self) -> PickIdentity {
        PickIdentity {
            user_id: self.user_id.clone(),
            item_id: self.item_id.clone(),
            round: self.round,
        }
    }
}

/// Derived identity of a pick notification: who took what in which round.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PickIdentity {
    pub user_id: UserId,
    pub item_id: ItemId,
    pub round: u32,
}
