// Pick eligibility rules.
//
// Local validation only spares the user a round trip: the pick-submission
// endpoint re-validates every pick against the authoritative state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::pick::{CategoryPair, Item, UserId};
use super::state::{DraftState, DraftStatus};

/// Why a candidate pick was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PickRejection {
    #[error("draft session is not active")]
    SessionNotActive,

    #[error("it is {holder}'s turn, not {submitter}'s")]
    NotYourTurn { submitter: UserId, holder: UserId },

    #[error("item {0} has already been taken")]
    AlreadyTaken(String),

    #[error("item {0} is not part of this draft")]
    UnknownItem(String),

    #[error("{user_id} already holds an item in category {categories}")]
    CategoryConflict {
        user_id: UserId,
        categories: CategoryPair,
    },
}

/// Configurable eligibility rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickRules {
    /// Block a participant from holding two items with the same category pair.
    pub category_conflict: bool,
}

impl Default for PickRules {
    fn default() -> Self {
        Self {
            category_conflict: true,
        }
    }
}

/// Checks candidate picks against the current draft state.
#[derive(Debug, Clone, Copy, Default)]
pub struct PickValidator {
    rules: PickRules,
}

impl PickValidator {
    pub fn new(rules: PickRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> PickRules {
        self.rules
    }

    /// Validate `item_id` as the next pick by `submitter`.
    ///
    /// Item-level checks run before the turn check so that resubmitting an
    /// already-drafted item reports `AlreadyTaken` regardless of whose turn
    /// it has become.
    pub fn validate<'s>(
        &self,
        state: &'s DraftState,
        submitter: &str,
        item_id: &str,
    ) -> Result<&'s Item, PickRejection> {
        if state.status() != DraftStatus::Active {
            return Err(PickRejection::SessionNotActive);
        }

        let item = state
            .item(item_id)
            .ok_or_else(|| PickRejection::UnknownItem(item_id.to_string()))?;

        if !state.is_available(item_id) {
            return Err(PickRejection::AlreadyTaken(item_id.to_string()));
        }

        let holder = state
            .current_holder()
            .ok_or(PickRejection::SessionNotActive)?;
        if holder != submitter {
            return Err(PickRejection::NotYourTurn {
                submitter: submitter.to_string(),
                holder: holder.clone(),
            });
        }

        self.check_categories(state, submitter, item)?;
        Ok(item)
    }

    /// Whether `user_id` could take `item` right now, ignoring whose turn it
    /// is. Used to pick a fallback item when a turn times out.
    pub fn is_eligible(&self, state: &DraftState, user_id: &str, item: &Item) -> bool {
        state.is_available(&item.id) && self.check_categories(state, user_id, item).is_ok()
    }

    fn check_categories(
        &self,
        state: &DraftState,
        user_id: &str,
        item: &Item,
    ) -> Result<(), PickRejection> {
        if !self.rules.category_conflict {
            return Ok(());
        }
        let conflict = state
            .picks_by(user_id)
            .filter_map(|pick| state.item(&pick.item_id))
            .any(|held| held.categories == item.categories);
        if conflict {
            return Err(PickRejection::CategoryConflict {
                user_id: user_id.to_string(),
                categories: item.categories.clone(),
            });
        }
        Ok(())
    }
}
