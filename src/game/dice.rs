//! Dice Scoring
//!
//! Decomposes a set of dice into scoring groups and validates selections.
//!
//! Extraction order is fixed: the five-die street first, then
//! five/four/three of a kind (largest size first, faces 1 to 6), then single
//! ones and fives. Anything left over scores nothing.

use serde::{Serialize, Deserialize};

/// Score for the 1-2-3-4-5 street.
pub const STREET_SCORE: i32 = 125;

/// Score for a leftover single one.
pub const SINGLE_ONE_SCORE: i32 = 10;

/// Score for a leftover single five.
pub const SINGLE_FIVE_SCORE: i32 = 5;

/// Kind of scoring group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    /// Exactly {1,2,3,4,5} in a five-die roll.
    Street,
    /// Five dice of one face.
    FiveOfAKind,
    /// Four dice of one face.
    FourOfAKind,
    /// Three dice of one face.
    ThreeOfAKind,
    /// A lone one or five.
    Single,
}

impl GroupKind {
    fn of_size(size: usize) -> Option<Self> {
        match size {
            5 => Some(GroupKind::FiveOfAKind),
            4 => Some(GroupKind::FourOfAKind),
            3 => Some(GroupKind::ThreeOfAKind),
            _ => None,
        }
    }
}

/// One scoring group within a roll.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringGroup {
    /// Group kind.
    pub kind: GroupKind,
    /// Dice consumed by this group.
    pub dice: Vec<u8>,
    /// Points awarded.
    pub score: i32,
}

/// Full decomposition of a set of dice.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiceAnalysis {
    /// Scoring groups in extraction order.
    pub groups: Vec<ScoringGroup>,
    /// Dice no group consumed.
    pub leftover: Vec<u8>,
}

impl DiceAnalysis {
    /// Sum of all group scores.
    pub fn total(&self) -> i32 {
        self.groups.iter().map(|g| g.score).sum()
    }

    /// True when every die belongs to some group.
    pub fn consumes_all(&self) -> bool {
        self.leftover.is_empty()
    }
}

/// Result of validating a selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Validation {
    /// Every selected die scores.
    pub is_valid: bool,
    /// Score of the selection (0 when invalid).
    pub score: i32,
}

impl Validation {
    /// A rejected selection.
    pub const INVALID: Validation = Validation { is_valid: false, score: 0 };
}

/// Score for `size` dice of `face`.
pub fn kind_score(face: u8, size: usize) -> i32 {
    let face = face as i32;
    match size {
        5 => if face == 1 { 1000 } else { face * 100 },
        4 => if face == 1 { 200 } else { face * 20 },
        3 => if face == 1 { 100 } else { face * 10 },
        _ => 0,
    }
}

/// Decompose dice into scoring groups.
pub fn analyze(dice: &[u8]) -> DiceAnalysis {
    if is_street(dice) {
        return DiceAnalysis {
            groups: vec![ScoringGroup {
                kind: GroupKind::Street,
                dice: dice.to_vec(),
                score: STREET_SCORE,
            }],
            leftover: Vec::new(),
        };
    }

    // counts[face], faces 1..=6; anything out of range is leftover
    let mut counts = [0usize; 7];
    let mut leftover = Vec::new();
    for &die in dice {
        if (1..=6).contains(&die) {
            counts[die as usize] += 1;
        } else {
            leftover.push(die);
        }
    }

    let mut groups = Vec::new();

    for size in [5usize, 4, 3] {
        let Some(kind) = GroupKind::of_size(size) else { continue };
        for face in 1..=6u8 {
            while counts[face as usize] >= size {
                counts[face as usize] -= size;
                groups.push(ScoringGroup {
                    kind,
                    dice: vec![face; size],
                    score: kind_score(face, size),
                });
            }
        }
    }

    for _ in 0..counts[1] {
        groups.push(ScoringGroup { kind: GroupKind::Single, dice: vec![1], score: SINGLE_ONE_SCORE });
    }
    counts[1] = 0;

    for _ in 0..counts[5] {
        groups.push(ScoringGroup { kind: GroupKind::Single, dice: vec![5], score: SINGLE_FIVE_SCORE });
    }
    counts[5] = 0;

    for face in 1..=6u8 {
        leftover.extend(std::iter::repeat(face).take(counts[face as usize]));
    }

    DiceAnalysis { groups, leftover }
}

/// Total score of a set of dice, ignoring non-scoring leftovers.
pub fn score_of(dice: &[u8]) -> i32 {
    analyze(dice).total()
}

/// Validate a selection: every die must belong to a scoring group.
pub fn validate(dice: &[u8]) -> Validation {
    if dice.is_empty() {
        return Validation::INVALID;
    }

    let analysis = analyze(dice);
    if analysis.consumes_all() {
        Validation { is_valid: true, score: analysis.total() }
    } else {
        Validation::INVALID
    }
}

fn is_street(dice: &[u8]) -> bool {
    if dice.len() != 5 {
        return false;
    }
    let mut sorted = dice.to_vec();
    sorted.sort_unstable();
    sorted == [1, 2, 3, 4, 5]
}
