//! Shared room document model.
//!
//! `RoomState` is the sole unit of replication: a publish replaces the whole
//! document and every subscriber replaces its local mirror with the snapshot
//! it receives. Field names follow the persisted JSON shape (camelCase).
//!
//! ```text
//! RoomState
//! ├── tokens       "row-col" → Token   (insertion ordered)
//! ├── layers       opaque JSON flags
//! ├── initiative   [InitiativeEntry]   (turn order)
//! ├── inCombat / currentTurn
//! ├── partyLoot    currency + items
//! ├── characters   [Character]
//! ├── settings
//! └── lastUpdate   epoch millis, advisory
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use crate::error::ValidationError;

/// Default hit points for a freshly placed token.
pub const DEFAULT_HP: i32 = 10;
/// Default board edge length in cells.
pub const DEFAULT_GRID_SIZE: u32 = 20;
/// Default token color when the UI does not pick one.
pub const DEFAULT_TOKEN_COLOR: &str = "#e74c3c";

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

// ───────────────────────────────────────────────────────────────────
// Grid positions
// ───────────────────────────────────────────────────────────────────

/// A grid cell. Its string key (`"row-col"`) indexes the token map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridPos {
    pub row: u32,
    pub col: u32,
}

impl GridPos {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    pub fn key(&self) -> String {
        format!("{}-{}", self.row, self.col)
    }
}

impl fmt::Display for GridPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.row, self.col)
    }
}

impl FromStr for GridPos {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidPosition(s.to_string());
        let (row, col) = s.split_once('-').ok_or_else(invalid)?;
        let row = row.trim().parse().map_err(|_| invalid())?;
        let col = col.trim().parse().map_err(|_| invalid())?;
        Ok(Self { row, col })
    }
}

// ───────────────────────────────────────────────────────────────────
// Identifiers
// ───────────────────────────────────────────────────────────────────

/// Normalized room code: trimmed, lowercase, non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomCode(String);

impl RoomCode {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let code = raw.trim().to_lowercase();
        if code.is_empty() {
            return Err(ValidationError::EmptyRoomCode);
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trimmed, non-empty player display name. Case is preserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerName(String);

impl PlayerName {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let name = raw.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyPlayerName);
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ───────────────────────────────────────────────────────────────────
// Tokens & initiative
// ───────────────────────────────────────────────────────────────────

/// A combatant marker placed on the grid.
///
/// `hp` is not clamped here; writers clamp to `[0, max_hp]` before storing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub name: String,
    pub color: String,
    pub hp: i32,
    pub max_hp: i32,
    #[serde(default)]
    pub initiative_bonus: i32,
    #[serde(default)]
    pub effects: BTreeSet<String>,
    /// Must equal the token's key in `RoomState::tokens`.
    pub position: String,
}

impl Token {
    pub fn new(name: impl Into<String>, color: impl Into<String>, pos: GridPos) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
            hp: DEFAULT_HP,
            max_hp: DEFAULT_HP,
            initiative_bonus: 0,
            effects: BTreeSet::new(),
            position: pos.key(),
        }
    }

    pub fn is_down(&self) -> bool {
        self.hp <= 0
    }
}

/// One slot in the combat turn order.
///
/// `position` may point at a token that has since been deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiativeEntry {
    pub position: String,
    /// Display label, e.g. `"Token 1 (17)"`.
    pub details: String,
    /// d20 + initiative bonus; the sort key.
    #[serde(default)]
    pub roll: i32,
}

// ───────────────────────────────────────────────────────────────────
// Party loot
// ───────────────────────────────────────────────────────────────────

/// The five fixed coin denominations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CurrencyCode {
    CP,
    SP,
    EP,
    GP,
    PP,
}

impl CurrencyCode {
    pub const ALL: [CurrencyCode; 5] = [
        CurrencyCode::CP,
        CurrencyCode::SP,
        CurrencyCode::EP,
        CurrencyCode::GP,
        CurrencyCode::PP,
    ];
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CurrencyCode::CP => "CP",
            CurrencyCode::SP => "SP",
            CurrencyCode::EP => "EP",
            CurrencyCode::GP => "GP",
            CurrencyCode::PP => "PP",
        };
        f.write_str(s)
    }
}

/// Coin counts. Never negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Currency {
    #[serde(rename = "CP", default)]
    pub cp: u64,
    #[serde(rename = "SP", default)]
    pub sp: u64,
    #[serde(rename = "EP", default)]
    pub ep: u64,
    #[serde(rename = "GP", default)]
    pub gp: u64,
    #[serde(rename = "PP", default)]
    pub pp: u64,
}

impl Currency {
    pub fn get(&self, code: CurrencyCode) -> u64 {
        match code {
            CurrencyCode::CP => self.cp,
            CurrencyCode::SP => self.sp,
            CurrencyCode::EP => self.ep,
            CurrencyCode::GP => self.gp,
            CurrencyCode::PP => self.pp,
        }
    }

    fn slot(&mut self, code: CurrencyCode) -> &mut u64 {
        match code {
            CurrencyCode::CP => &mut self.cp,
            CurrencyCode::SP => &mut self.sp,
            CurrencyCode::EP => &mut self.ep,
            CurrencyCode::GP => &mut self.gp,
            CurrencyCode::PP => &mut self.pp,
        }
    }

    /// Add `delta` coins, flooring the result at zero.
    pub fn adjust(&mut self, code: CurrencyCode, delta: i64) {
        let slot = self.slot(code);
        *slot = if delta >= 0 {
            slot.saturating_add(delta as u64)
        } else {
            slot.saturating_sub(delta.unsigned_abs())
        };
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LootItem {
    pub id: String,
    pub name: String,
    pub quantity: u32,
    #[serde(default)]
    pub added_by: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartyLoot {
    #[serde(default)]
    pub currency: Currency,
    #[serde(default)]
    pub items: Vec<LootItem>,
    /// Player currently holding the loot panel open, if any.
    #[serde(default)]
    pub current_viewer: Option<String>,
}

// ───────────────────────────────────────────────────────────────────
// Characters
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbilityScores {
    pub strength: i32,
    pub dexterity: i32,
    pub constitution: i32,
    pub intelligence: i32,
    pub wisdom: i32,
    pub charisma: i32,
}

impl Default for AbilityScores {
    fn default() -> Self {
        Self {
            strength: 10,
            dexterity: 10,
            constitution: 10,
            intelligence: 10,
            wisdom: 10,
            charisma: 10,
        }
    }
}

impl AbilityScores {
    /// Standard ability modifier: `floor((score - 10) / 2)`.
    pub fn modifier(score: i32) -> i32 {
        (score - 10).div_euclid(2)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
    pub name: String,
    pub quantity: u32,
    #[serde(default)]
    pub notes: String,
}

/// A character sheet. Logically owned by a player; replicated per room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    pub name: String,
    #[serde(default)]
    pub owner: String,
    #[serde(rename = "class", default)]
    pub class_name: String,
    #[serde(default = "default_level")]
    pub level: u32,
    #[serde(default)]
    pub abilities: AbilityScores,
    #[serde(default)]
    pub proficiencies: BTreeSet<String>,
    #[serde(default)]
    pub inventory: Vec<InventoryItem>,
}

fn default_level() -> u32 {
    1
}

impl Character {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: String::new(),
            class_name: String::new(),
            level: 1,
            abilities: AbilityScores::default(),
            proficiencies: BTreeSet::new(),
            inventory: Vec::new(),
        }
    }

    /// Proficiency bonus by level (+2 at 1–4, +3 at 5–8, ...).
    pub fn proficiency_bonus(&self) -> i32 {
        2 + (self.level.max(1) as i32 - 1) / 4
    }
}

// ───────────────────────────────────────────────────────────────────
// Documents
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub grid_size: u32,
    pub show_coordinates: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            grid_size: DEFAULT_GRID_SIZE,
            show_coordinates: false,
        }
    }
}

/// Default layer flags. Opaque to the core beyond pass-through.
pub fn default_layers() -> Value {
    json!({
        "grid": { "visible": true },
        "terrain": { "visible": true },
        "fog": { "visible": false },
    })
}

/// The replicated state of one room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    #[serde(default)]
    pub tokens: IndexMap<String, Token>,
    #[serde(default = "default_layers")]
    pub layers: Value,
    #[serde(default)]
    pub initiative: Vec<InitiativeEntry>,
    #[serde(default)]
    pub in_combat: bool,
    #[serde(default)]
    pub current_turn: usize,
    #[serde(default)]
    pub party_loot: PartyLoot,
    #[serde(default)]
    pub characters: Vec<Character>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub last_update: i64,
}

impl Default for RoomState {
    fn default() -> Self {
        Self {
            tokens: IndexMap::new(),
            layers: default_layers(),
            initiative: Vec::new(),
            in_combat: false,
            current_turn: 0,
            party_loot: PartyLoot::default(),
            characters: Vec::new(),
            settings: Settings::default(),
            last_update: 0,
        }
    }
}

impl RoomState {
    pub fn token_at(&self, pos: GridPos) -> Option<&Token> {
        self.tokens.get(&pos.key())
    }

    /// Initiative entry whose turn it is, if combat is running.
    pub fn current_combatant(&self) -> Option<&InitiativeEntry> {
        if !self.in_combat {
            return None;
        }
        self.initiative.get(self.current_turn)
    }

    /// Token behind an initiative entry; `None` if it was deleted mid-combat.
    pub fn combatant_token(&self, entry: &InitiativeEntry) -> Option<&Token> {
        self.tokens.get(&entry.position)
    }

    /// Check the structural invariants: every token key matches its
    /// `position`, and `current_turn` indexes `initiative` during combat.
    pub fn is_consistent(&self) -> bool {
        let keys_match = self.tokens.iter().all(|(k, t)| *k == t.position);
        let turn_ok = !self.in_combat
            || self.initiative.is_empty()
            || self.current_turn < self.initiative.len();
        keys_match && turn_ok
    }

    pub fn layer_visible(&self, layer: &str) -> bool {
        self.layers
            .get(layer)
            .and_then(|l| l.get("visible"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Per-player character storage, independent of any room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerDocument {
    #[serde(default)]
    pub characters: Vec<Character>,
    #[serde(default)]
    pub last_update: i64,
}
