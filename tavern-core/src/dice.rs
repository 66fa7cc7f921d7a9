//! Dice engine.
//!
//! Pure apart from consuming the supplied random source, so a seeded
//! `Pcg64Mcg` reproduces any sequence of rolls exactly.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::ValidationError;
use crate::model::now_millis;

/// Most dice in one roll.
pub const MAX_DICE: u32 = 100;
/// Roll history length kept per client.
pub const HISTORY_CAP: usize = 50;
/// Dice offered by the roller.
pub const DICE_TYPES: [u32; 7] = [4, 6, 8, 10, 12, 20, 100];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollMode {
    #[default]
    Normal,
    Advantage,
    Disadvantage,
}

impl RollMode {
    /// Flip between `self` and `Normal`, like the advantage toggle buttons.
    pub fn toggled(self, mode: RollMode) -> RollMode {
        if self == mode {
            RollMode::Normal
        } else {
            mode
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollResult {
    /// `"<quantity>d<sides>"`
    pub label: String,
    /// First draw of every die, in order.
    pub raw_rolls: Vec<u32>,
    /// Second draw of every die; empty for `Normal`.
    pub extra_rolls: Vec<u32>,
    /// Per-die value after advantage/disadvantage.
    pub kept_values: Vec<u32>,
    pub modifier: i32,
    pub mode: RollMode,
    pub total: i64,
    pub timestamp: i64,
}

impl RollResult {
    /// History line, e.g. `"2d20 + 3 (Adv)"`.
    pub fn describe(&self) -> String {
        let mut out = self.label.clone();
        if self.modifier > 0 {
            out.push_str(&format!(" + {}", self.modifier));
        } else if self.modifier < 0 {
            out.push_str(&format!(" - {}", self.modifier.unsigned_abs()));
        }
        match self.mode {
            RollMode::Advantage => out.push_str(" (Adv)"),
            RollMode::Disadvantage => out.push_str(" (Dis)"),
            RollMode::Normal => {}
        }
        out
    }
}

/// Roll `quantity` dice with `sides` faces.
pub fn roll<R: Rng + ?Sized>(
    rng: &mut R,
    sides: u32,
    quantity: u32,
    mode: RollMode,
    modifier: i32,
) -> Result<RollResult, ValidationError> {
    if sides == 0 || quantity == 0 || quantity > MAX_DICE {
        return Err(ValidationError::InvalidDice { sides, quantity });
    }

    let n = quantity as usize;
    let mut raw_rolls = Vec::with_capacity(n);
    let mut extra_rolls = Vec::new();
    let mut kept_values = Vec::with_capacity(n);

    for _ in 0..quantity {
        let first = rng.gen_range(1..=sides);
        raw_rolls.push(first);
        let kept = match mode {
            RollMode::Normal => first,
            RollMode::Advantage | RollMode::Disadvantage => {
                let second = rng.gen_range(1..=sides);
                extra_rolls.push(second);
                if mode == RollMode::Advantage {
                    first.max(second)
                } else {
                    first.min(second)
                }
            }
        };
        kept_values.push(kept);
    }

    let total = kept_values.iter().map(|&v| i64::from(v)).sum::<i64>() + i64::from(modifier);

    Ok(RollResult {
        label: format!("{quantity}d{sides}"),
        raw_rolls,
        extra_rolls,
        kept_values,
        modifier,
        mode,
        total,
        timestamp: now_millis(),
    })
}

/// Most-recent-first roll history with a fixed capacity.
#[derive(Debug, Clone)]
pub struct RollHistory {
    entries: VecDeque<RollResult>,
    cap: usize,
}

impl Default for RollHistory {
    fn default() -> Self {
        Self::new(HISTORY_CAP)
    }
}

impl RollHistory {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(cap.min(HISTORY_CAP)),
            cap: cap.max(1),
        }
    }

    /// Push a result to the front, evicting the oldest past capacity.
    pub fn push(&mut self, result: RollResult) {
        self.entries.push_front(result);
        self.entries.truncate(self.cap);
    }

    pub fn latest(&self) -> Option<&RollResult> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RollResult> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
