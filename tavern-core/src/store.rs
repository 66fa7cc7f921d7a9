//! Room state transitions.
//!
//! Every operation takes the current `RoomState` plus intent parameters and
//! returns the complete next state, never a patch. Nothing here touches the
//! network; the caller publishes the returned value as a whole document.
//! Only initiative consumes randomness, from a caller-supplied source.

use rand::Rng;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::error::ValidationError;
use crate::model::{
    Character, Currency, CurrencyCode, GridPos, InitiativeEntry, LootItem, PlayerDocument,
    RoomState, Settings, Token,
};

/// Turn step direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Back,
}

/// Fields to overwrite on an existing token. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenPatch {
    pub name: Option<String>,
    pub color: Option<String>,
    pub hp: Option<i32>,
    pub max_hp: Option<i32>,
    pub initiative_bonus: Option<i32>,
    pub effects: Option<BTreeSet<String>>,
}

/// Fields to overwrite on the party loot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LootPatch {
    pub currency: Option<Currency>,
    pub items: Option<Vec<LootItem>>,
    pub current_viewer: Option<Option<String>>,
}

/// A loot item before it has been assigned an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLootItem {
    pub name: String,
    pub quantity: u32,
    pub added_by: String,
}

/// Place a token on an empty cell, or remove the token occupying it.
///
/// New tokens are named `"Token <n+1>"` from the current token count, so
/// names can repeat after deletions.
pub fn toggle_token(state: &RoomState, pos: GridPos, color: &str) -> RoomState {
    let mut next = state.clone();
    let key = pos.key();
    if next.tokens.shift_remove(&key).is_none() {
        let name = format!("Token {}", state.tokens.len() + 1);
        next.tokens.insert(key, Token::new(name, color, pos));
    }
    next
}

pub fn update_token(
    state: &RoomState,
    position: &str,
    patch: &TokenPatch,
) -> Result<RoomState, ValidationError> {
    let mut next = state.clone();
    let token = next
        .tokens
        .get_mut(position)
        .ok_or_else(|| ValidationError::TokenNotFound(position.to_string()))?;

    if let Some(name) = &patch.name {
        token.name = name.clone();
    }
    if let Some(color) = &patch.color {
        token.color = color.clone();
    }
    if let Some(hp) = patch.hp {
        token.hp = hp;
    }
    if let Some(max_hp) = patch.max_hp {
        token.max_hp = max_hp;
    }
    if let Some(bonus) = patch.initiative_bonus {
        token.initiative_bonus = bonus;
    }
    if let Some(effects) = &patch.effects {
        token.effects = effects.clone();
    }
    Ok(next)
}

/// Add the status effect if absent, remove it if present.
pub fn toggle_effect(
    state: &RoomState,
    position: &str,
    effect: &str,
) -> Result<RoomState, ValidationError> {
    let mut next = state.clone();
    let token = next
        .tokens
        .get_mut(position)
        .ok_or_else(|| ValidationError::TokenNotFound(position.to_string()))?;
    if !token.effects.remove(effect) {
        token.effects.insert(effect.to_string());
    }
    Ok(next)
}

/// Remove a token. Initiative entries pointing at it are left in place.
pub fn delete_token(state: &RoomState, position: &str) -> Result<RoomState, ValidationError> {
    let mut next = state.clone();
    if next.tokens.shift_remove(position).is_none() {
        return Err(ValidationError::TokenNotFound(position.to_string()));
    }
    Ok(next)
}

/// Start combat: d20 + bonus for every token, highest first.
///
/// Ties keep token insertion order. Totals saturate at the `i32` range.
pub fn roll_initiative<R: Rng + ?Sized>(
    state: &RoomState,
    rng: &mut R,
) -> Result<RoomState, ValidationError> {
    if state.tokens.is_empty() {
        return Err(ValidationError::EmptyBoard);
    }

    let mut order: Vec<InitiativeEntry> = state
        .tokens
        .values()
        .map(|token| {
            let roll = rng.gen_range(1i32..=20).saturating_add(token.initiative_bonus);
            InitiativeEntry {
                position: token.position.clone(),
                details: format!("{} ({})", token.name, roll),
                roll,
            }
        })
        .collect();
    // stable
    order.sort_by(|a, b| b.roll.cmp(&a.roll));
    log::debug!("Rolled initiative for {} tokens", order.len());

    let mut next = state.clone();
    next.initiative = order;
    next.in_combat = true;
    next.current_turn = 0;
    Ok(next)
}

pub fn advance_turn(state: &RoomState, direction: Direction) -> Result<RoomState, ValidationError> {
    let len = state.initiative.len();
    if len == 0 {
        return Err(ValidationError::NoInitiative);
    }
    let current = state.current_turn % len;
    let mut next = state.clone();
    next.current_turn = match direction {
        Direction::Forward => (current + 1) % len,
        Direction::Back => (current + len - 1) % len,
    };
    Ok(next)
}

pub fn end_combat(state: &RoomState) -> RoomState {
    let mut next = state.clone();
    next.initiative.clear();
    next.in_combat = false;
    next.current_turn = 0;
    next
}

pub fn update_loot(state: &RoomState, patch: &LootPatch) -> RoomState {
    let mut next = state.clone();
    if let Some(currency) = patch.currency {
        next.party_loot.currency = currency;
    }
    if let Some(items) = &patch.items {
        next.party_loot.items = items.clone();
    }
    if let Some(viewer) = &patch.current_viewer {
        next.party_loot.current_viewer = viewer.clone();
    }
    next
}

/// Append a loot item under a fresh v4 UUID.
pub fn add_loot_item(state: &RoomState, item: NewLootItem) -> Result<RoomState, ValidationError> {
    let name = item.name.trim();
    if name.is_empty() {
        return Err(ValidationError::EmptyItemName);
    }
    let mut next = state.clone();
    next.party_loot.items.push(LootItem {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        quantity: item.quantity.max(1),
        added_by: item.added_by,
    });
    Ok(next)
}

pub fn remove_loot_item(state: &RoomState, id: &str) -> Result<RoomState, ValidationError> {
    let mut next = state.clone();
    let before = next.party_loot.items.len();
    next.party_loot.items.retain(|item| item.id != id);
    if next.party_loot.items.len() == before {
        return Err(ValidationError::LootItemNotFound(id.to_string()));
    }
    Ok(next)
}

pub fn adjust_currency(state: &RoomState, code: CurrencyCode, delta: i64) -> RoomState {
    let mut next = state.clone();
    next.party_loot.currency.adjust(code, delta);
    next
}

/// Replace the acting player's character of the same name, or append.
///
/// Characters owned by other players are never replaced, even on a name
/// clash.
pub fn upsert_character(
    state: &RoomState,
    acting_player: &str,
    character: &Character,
) -> Result<RoomState, ValidationError> {
    if character.name.trim().is_empty() {
        return Err(ValidationError::EmptyCharacterName);
    }
    let mut owned = character.clone();
    owned.owner = acting_player.to_string();

    let mut next = state.clone();
    match next
        .characters
        .iter_mut()
        .find(|c| c.owner == acting_player && c.name == owned.name)
    {
        Some(existing) => *existing = owned,
        None => next.characters.push(owned),
    }
    Ok(next)
}

/// Player-document counterpart of [`upsert_character`]: replace by name.
pub fn upsert_player_character(
    doc: &PlayerDocument,
    character: &Character,
) -> Result<PlayerDocument, ValidationError> {
    if character.name.trim().is_empty() {
        return Err(ValidationError::EmptyCharacterName);
    }
    let mut next = doc.clone();
    match next.characters.iter_mut().find(|c| c.name == character.name) {
        Some(existing) => *existing = character.clone(),
        None => next.characters.push(character.clone()),
    }
    Ok(next)
}

/// Flip `layers.<name>.visible`, creating the layer entry if missing.
pub fn toggle_layer(state: &RoomState, layer: &str) -> RoomState {
    let mut next = state.clone();
    let visible = state.layer_visible(layer);
    if !next.layers.is_object() {
        next.layers = serde_json::Value::Object(Default::default());
    }
    if let Some(layers) = next.layers.as_object_mut() {
        let entry = layers
            .entry(layer.to_string())
            .or_insert_with(|| serde_json::json!({}));
        if !entry.is_object() {
            *entry = serde_json::json!({});
        }
        entry["visible"] = serde_json::Value::Bool(!visible);
    }
    next
}

pub fn update_settings(state: &RoomState, settings: &Settings) -> RoomState {
    let mut next = state.clone();
    next.settings = settings.clone();
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    fn board(cells: &[(u32, u32)]) -> RoomState {
        cells.iter().fold(RoomState::default(), |s, &(r, c)| {
            toggle_token(&s, GridPos::new(r, c), "#3498db")
        })
    }

    #[test]
    fn test_toggle_creates_default_token() {
        let state = toggle_token(&RoomState::default(), GridPos::new(0, 0), "#e74c3c");
        let token = state.tokens.get("0-0").unwrap();
        assert_eq!(token.name, "Token 1");
        assert_eq!(token.color, "#e74c3c");
        assert_eq!((token.hp, token.max_hp, token.initiative_bonus), (10, 10, 0));
        assert!(token.effects.is_empty());
        assert_eq!(token.position, "0-0");
    }

    #[test]
    fn test_toggle_twice_is_identity() {
        let start = board(&[(1, 1), (2, 2)]);
        let placed = toggle_token(&start, GridPos::new(4, 4), "#fff");
        assert_eq!(placed.tokens.len(), 3);
        let removed = toggle_token(&placed, GridPos::new(4, 4), "#fff");
        assert_eq!(removed.tokens, start.tokens);
    }

    #[test]
    fn test_default_names_can_repeat() {
        let s = board(&[(0, 0), (0, 1)]);
        let s = delete_token(&s, "0-0").unwrap();
        let s = toggle_token(&s, GridPos::new(0, 2), "#fff");
        assert_eq!(s.tokens["0-1"].name, "Token 2");
        assert_eq!(s.tokens["0-2"].name, "Token 2");
    }

    #[test]
    fn test_update_token_patch() {
        let s = board(&[(0, 0)]);
        let patch = TokenPatch {
            name: Some("Goblin".into()),
            hp: Some(4),
            initiative_bonus: Some(2),
            ..TokenPatch::default()
        };
        let s = update_token(&s, "0-0", &patch).unwrap();
        let t = &s.tokens["0-0"];
        assert_eq!(t.name, "Goblin");
        assert_eq!(t.hp, 4);
        assert_eq!(t.max_hp, 10);
        assert_eq!(t.initiative_bonus, 2);
        assert_eq!(t.position, "0-0");
    }

    #[test]
    fn test_update_missing_token_fails() {
        let s = board(&[(0, 0)]);
        let err = update_token(&s, "5-5", &TokenPatch::default()).unwrap_err();
        assert_eq!(err, ValidationError::TokenNotFound("5-5".into()));
    }

    #[test]
    fn test_toggle_effect() {
        let s = board(&[(0, 0)]);
        let s = toggle_effect(&s, "0-0", "prone").unwrap();
        assert!(s.tokens["0-0"].effects.contains("prone"));
        let s = toggle_effect(&s, "0-0", "prone").unwrap();
        assert!(s.tokens["0-0"].effects.is_empty());
    }

    #[test]
    fn test_roll_initiative_empty_board() {
        let mut rng = Pcg64Mcg::seed_from_u64(1);
        let err = roll_initiative(&RoomState::default(), &mut rng).unwrap_err();
        assert_eq!(err, ValidationError::EmptyBoard);
    }

    #[test]
    fn test_roll_initiative_single_token() {
        let s = toggle_token(&RoomState::default(), GridPos::new(0, 0), "#e74c3c");
        let mut rng = Pcg64Mcg::seed_from_u64(9);
        let s = roll_initiative(&s, &mut rng).unwrap();
        assert!(s.in_combat);
        assert_eq!(s.current_turn, 0);
        assert_eq!(s.initiative.len(), 1);
        let entry = &s.initiative[0];
        assert_eq!(entry.position, "0-0");
        assert!((1..=20).contains(&entry.roll));
        assert_eq!(entry.details, format!("Token 1 ({})", entry.roll));
    }

    #[test]
    fn test_initiative_sorted_permutation() {
        let mut s = board(&[(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2), (2, 0)]);
        s = update_token(&s, "0-1", &TokenPatch { initiative_bonus: Some(5), ..Default::default() }).unwrap();
        for seed in 0..50 {
            let mut rng = Pcg64Mcg::seed_from_u64(seed);
            let next = roll_initiative(&s, &mut rng).unwrap();

            let mut positions: Vec<&str> = next.initiative.iter().map(|e| e.position.as_str()).collect();
            positions.sort();
            let mut keys: Vec<&str> = s.tokens.keys().map(String::as_str).collect();
            keys.sort();
            assert_eq!(positions, keys);

            for pair in next.initiative.windows(2) {
                assert!(pair[0].roll >= pair[1].roll);
                if pair[0].roll == pair[1].roll {
                    let a = s.tokens.get_index_of(&pair[0].position).unwrap();
                    let b = s.tokens.get_index_of(&pair[1].position).unwrap();
                    assert!(a < b, "ties must keep insertion order");
                }
            }
        }
    }

    #[test]
    fn test_initiative_with_extreme_bonuses() {
        let s = board(&[(0, 0), (0, 1), (0, 2)]);
        let s = update_token(&s, "0-0", &TokenPatch { initiative_bonus: Some(i32::MIN), ..Default::default() }).unwrap();
        let s = update_token(&s, "0-2", &TokenPatch { initiative_bonus: Some(i32::MAX), ..Default::default() }).unwrap();

        let next = roll_initiative(&s, &mut Pcg64Mcg::seed_from_u64(1)).unwrap();
        let order: Vec<&str> = next.initiative.iter().map(|e| e.position.as_str()).collect();
        assert_eq!(order, ["0-2", "0-1", "0-0"]);
        assert_eq!(next.initiative[0].roll, i32::MAX);
        assert!(next.initiative[2].roll < -2_000_000_000);
    }

    #[test]
    fn test_initiative_from_remote_document_with_huge_bonus() {
        let s = board(&[(0, 0), (1, 1)]);
        let mut doc = serde_json::to_value(&s).unwrap();
        doc["tokens"]["1-1"]["initiativeBonus"] = serde_json::json!(i32::MAX);
        let remote: RoomState = serde_json::from_value(doc).unwrap();

        for seed in 0..20 {
            let next = roll_initiative(&remote, &mut Pcg64Mcg::seed_from_u64(seed)).unwrap();
            assert_eq!(next.initiative[0].position, "1-1");
            assert_eq!(next.initiative[0].roll, i32::MAX);
        }
    }

    #[test]
    fn test_initiative_reproducible() {
        let s = board(&[(0, 0), (3, 3), (7, 1)]);
        let a = roll_initiative(&s, &mut Pcg64Mcg::seed_from_u64(77)).unwrap();
        let b = roll_initiative(&s, &mut Pcg64Mcg::seed_from_u64(77)).unwrap();
        assert_eq!(a.initiative, b.initiative);
    }

    #[test]
    fn test_advance_turn_cycles() {
        let s = board(&[(0, 0), (0, 1), (0, 2), (0, 3)]);
        let mut s = roll_initiative(&s, &mut Pcg64Mcg::seed_from_u64(3)).unwrap();
        s.current_turn = 2;
        let start = s.current_turn;
        for _ in 0..s.initiative.len() {
            s = advance_turn(&s, Direction::Forward).unwrap();
        }
        assert_eq!(s.current_turn, start);
    }

    #[test]
    fn test_advance_turn_wraps_backwards() {
        let s = board(&[(0, 0), (0, 1), (0, 2)]);
        let s = roll_initiative(&s, &mut Pcg64Mcg::seed_from_u64(3)).unwrap();
        let s = advance_turn(&s, Direction::Back).unwrap();
        assert_eq!(s.current_turn, 2);
        let s = advance_turn(&s, Direction::Forward).unwrap();
        assert_eq!(s.current_turn, 0);
    }

    #[test]
    fn test_advance_turn_without_initiative() {
        let s = board(&[(0, 0)]);
        assert_eq!(advance_turn(&s, Direction::Forward), Err(ValidationError::NoInitiative));
    }

    #[test]
    fn test_delete_leaves_dangling_initiative() {
        let s = board(&[(0, 0), (0, 1)]);
        let s = roll_initiative(&s, &mut Pcg64Mcg::seed_from_u64(5)).unwrap();
        let s = delete_token(&s, "0-1").unwrap();
        assert_eq!(s.initiative.len(), 2);
        assert!(s.in_combat);
        let dangling = s.initiative.iter().find(|e| e.position == "0-1").unwrap();
        assert!(s.combatant_token(dangling).is_none());
    }

    #[test]
    fn test_end_combat_resets() {
        let s = board(&[(0, 0), (0, 1)]);
        let s = roll_initiative(&s, &mut Pcg64Mcg::seed_from_u64(5)).unwrap();
        let s = advance_turn(&s, Direction::Forward).unwrap();
        let s = end_combat(&s);
        assert!(s.initiative.is_empty());
        assert!(!s.in_combat);
        assert_eq!(s.current_turn, 0);
        assert_eq!(s.tokens.len(), 2);
    }

    #[test]
    fn test_loot_items_unique_ids() {
        let mut s = RoomState::default();
        for i in 0..20 {
            s = add_loot_item(
                &s,
                NewLootItem { name: format!("Gem {i}"), quantity: 1, added_by: "Mira".into() },
            )
            .unwrap();
        }
        let ids: BTreeSet<&str> = s.party_loot.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids.len(), 20);
        assert_eq!(s.party_loot.items[0].added_by, "Mira");
    }

    #[test]
    fn test_add_loot_rejects_blank_name() {
        let item = NewLootItem { name: "  ".into(), quantity: 1, added_by: "Mira".into() };
        assert_eq!(add_loot_item(&RoomState::default(), item), Err(ValidationError::EmptyItemName));
    }

    #[test]
    fn test_remove_loot_item() {
        let s = add_loot_item(
            &RoomState::default(),
            NewLootItem { name: "Rope".into(), quantity: 2, added_by: "Bo".into() },
        )
        .unwrap();
        let id = s.party_loot.items[0].id.clone();
        let s = remove_loot_item(&s, &id).unwrap();
        assert!(s.party_loot.items.is_empty());
        assert!(remove_loot_item(&s, &id).is_err());
    }

    #[test]
    fn test_adjust_currency_floors_at_zero() {
        let s = adjust_currency(&RoomState::default(), CurrencyCode::GP, 12);
        let s = adjust_currency(&s, CurrencyCode::GP, -20);
        assert_eq!(s.party_loot.currency.gp, 0);
        let s = adjust_currency(&s, CurrencyCode::PP, 1);
        assert_eq!(s.party_loot.currency.get(CurrencyCode::PP), 1);
    }

    #[test]
    fn test_update_loot_viewer() {
        let patch = LootPatch { current_viewer: Some(Some("Bo".into())), ..Default::default() };
        let s = update_loot(&RoomState::default(), &patch);
        assert_eq!(s.party_loot.current_viewer.as_deref(), Some("Bo"));
        let patch = LootPatch { current_viewer: Some(None), ..Default::default() };
        assert!(update_loot(&s, &patch).party_loot.current_viewer.is_none());
    }

    #[test]
    fn test_upsert_character_scoped_to_owner() {
        let mut sheet = Character::new("Vex");
        let s = upsert_character(&RoomState::default(), "Mira", &sheet).unwrap();
        let s = upsert_character(&s, "Bo", &sheet).unwrap();
        assert_eq!(s.characters.len(), 2);

        sheet.level = 4;
        let s = upsert_character(&s, "Mira", &sheet).unwrap();
        assert_eq!(s.characters.len(), 2);
        let mira = s.characters.iter().find(|c| c.owner == "Mira").unwrap();
        let bo = s.characters.iter().find(|c| c.owner == "Bo").unwrap();
        assert_eq!(mira.level, 4);
        assert_eq!(bo.level, 1);
    }

    #[test]
    fn test_upsert_player_character() {
        let doc = upsert_player_character(&PlayerDocument::default(), &Character::new("Vex")).unwrap();
        let mut sheet = Character::new("Vex");
        sheet.class_name = "Rogue".into();
        let doc = upsert_player_character(&doc, &sheet).unwrap();
        assert_eq!(doc.characters.len(), 1);
        assert_eq!(doc.characters[0].class_name, "Rogue");
    }

    #[test]
    fn test_toggle_layer() {
        let s = toggle_layer(&RoomState::default(), "fog");
        assert!(s.layer_visible("fog"));
        let s = toggle_layer(&s, "fog");
        assert!(!s.layer_visible("fog"));
        let s = toggle_layer(&s, "lighting");
        assert!(s.layer_visible("lighting"));
        assert!(s.layer_visible("grid"));
    }
}
