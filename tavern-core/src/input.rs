//! Free-text numeric input from edit forms.
//!
//! Nothing here fails: unparseable text becomes a fixed default.

use crate::model::Token;
use crate::store::TokenPatch;

/// Parse a trimmed integer, falling back to `default`.
pub fn int_or(text: &str, default: i64) -> i64 {
    text.trim().parse().unwrap_or(default)
}

/// Parse into `i32`, clamping out-of-range values instead of wrapping.
pub fn i32_or(text: &str, default: i32) -> i32 {
    int_or(text, i64::from(default)).clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Quantity field: non-numeric means 1, never below 1.
pub fn quantity(text: &str) -> u32 {
    int_or(text, 1).clamp(1, i64::from(u32::MAX)) as u32
}

/// Modifier field: non-numeric means 0.
pub fn modifier(text: &str) -> i32 {
    i32_or(text, 0)
}

/// Raw contents of the token edit form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenEdit {
    pub name: String,
    pub color: Option<String>,
    pub hp: String,
    pub max_hp: String,
    pub initiative_bonus: String,
}

impl TokenEdit {
    /// Pre-fill the form from an existing token.
    pub fn from_token(token: &Token) -> Self {
        Self {
            name: token.name.clone(),
            color: Some(token.color.clone()),
            hp: token.hp.to_string(),
            max_hp: token.max_hp.to_string(),
            initiative_bonus: token.initiative_bonus.to_string(),
        }
    }

    /// Build a patch with `max_hp >= 1` and `hp` within `[0, max_hp]`.
    ///
    /// A blank name keeps the current one.
    pub fn to_patch(&self) -> TokenPatch {
        let max_hp = i32_or(&self.max_hp, 1).max(1);
        let hp = i32_or(&self.hp, 0).clamp(0, max_hp);
        let name = self.name.trim();
        TokenPatch {
            name: (!name.is_empty()).then(|| name.to_string()),
            color: self.color.clone(),
            hp: Some(hp),
            max_hp: Some(max_hp),
            initiative_bonus: Some(i32_or(&self.initiative_bonus, 0)),
            effects: None,
        }
    }
}
