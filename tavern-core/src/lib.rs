//! # tavern-core: Shared tabletop state for Tavern
//!
//! The document model replicated between players in a room, the pure state
//! transitions applied to it, and the dice engine.
//!
//! ## Modules
//!
//! - [`model`]: `RoomState`, tokens, initiative, loot, characters
//! - [`store`]: Pure transitions: current state + intent → next state
//! - [`dice`]: Seedable dice rolls and capped roll history
//! - [`input`]: Lenient parsing of free-text form fields
//! - [`error`]: `ValidationError`
//!
//! Nothing in this crate performs I/O. Replication lives in `tavern-collab`.

pub mod error;
pub mod model;
pub mod store;
pub mod dice;
pub mod input;

pub use error::ValidationError;
pub use model::{
    AbilityScores, Character, Currency, CurrencyCode, GridPos, InitiativeEntry, InventoryItem,
    LootItem, PartyLoot, PlayerDocument, PlayerName, RoomCode, RoomState, Settings, Token,
};
pub use store::{Direction, LootPatch, NewLootItem, TokenPatch};
pub use dice::{RollHistory, RollMode, RollResult};
pub use input::TokenEdit;
