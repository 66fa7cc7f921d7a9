//! Local, synchronous validation failures.
//!
//! A `ValidationError` is raised before any state mutation or publish, so
//! the caller's state is always unchanged when one is returned.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("cannot roll initiative: no tokens on the board")]
    EmptyBoard,

    #[error("no initiative order: combat has not started")]
    NoInitiative,

    #[error("no token at position {0}")]
    TokenNotFound(String),

    #[error("no loot item with id {0}")]
    LootItemNotFound(String),

    #[error("loot item name must not be empty")]
    EmptyItemName,

    #[error("room code must not be empty")]
    EmptyRoomCode,

    #[error("player name must not be empty")]
    EmptyPlayerName,

    #[error("character name must not be empty")]
    EmptyCharacterName,

    #[error("invalid grid position: {0}")]
    InvalidPosition(String),

    #[error("invalid dice: {quantity}d{sides}")]
    InvalidDice { sides: u32, quantity: u32 },
}
