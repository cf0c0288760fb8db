pub mod pick;
pub mod snake;
pub mod state;
pub mod validator;

pub use pick::{CategoryPair, Item, ItemId, Pick, PickIdentity, UserId};
pub use state::{Accepted, Advance, DraftSession, DraftState, DraftStatus, RemotePick, StateError};
pub use validator::{PickRejection, PickRules, PickValidator};
