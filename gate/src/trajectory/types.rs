//! Turn and Trajectory — the canonical, validated turn sequence of an incident

use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};

/// Safety label attached to a single turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyLabel {
    Safe,
    /// Partial compliance or hedged refusal
    Hedge,
    Unsafe,
}

impl SafetyLabel {
    /// Parse labels as they appear in captured incident files (case-insensitive)
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "safe" => Some(Self::Safe),
            "hedge" | "hedged" => Some(Self::Hedge),
            "unsafe" => Some(Self::Unsafe),
            _ => None,
        }
    }

    pub fn is_safe(self) -> bool {
        self == Self::Safe
    }
}

impl std::fmt::Display for SafetyLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Safe => write!(f, "SAFE"),
            Self::Hedge => write!(f, "HEDGE"),
            Self::Unsafe => write!(f, "UNSAFE"),
        }
    }
}

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    User,
    Assistant,
    Tool,
    System,
}

/// One recorded turn. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    position: u32,
    role: ActorRole,
    content_summary: String,
    label: Option<SafetyLabel>,
    triggered_safeguard: Option<String>,
}

impl Turn {
    pub fn new(
        position: u32,
        role: ActorRole,
        content_summary: impl Into<String>,
        label: Option<SafetyLabel>,
    ) -> Self {
        Self {
            position,
            role,
            content_summary: content_summary.into(),
            label,
            triggered_safeguard: None,
        }
    }

    /// Attach the safeguard that fired on this turn in production
    pub fn with_triggered_safeguard(mut self, safeguard: impl Into<String>) -> Self {
        self.triggered_safeguard = Some(safeguard.into());
        self
    }

    /// 1-based position in the trajectory
    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn role(&self) -> ActorRole {
        self.role
    }

    pub fn content_summary(&self) -> &str {
        &self.content_summary
    }

    pub fn label(&self) -> Option<SafetyLabel> {
        self.label
    }

    pub fn triggered_safeguard(&self) -> Option<&str> {
        self.triggered_safeguard.as_deref()
    }
}

/// Ordered turn sequence of one incident.
///
/// Invariant: positions are strictly increasing and contiguous from 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Turn>", into = "Vec<Turn>")]
pub struct Trajectory {
    turns: Vec<Turn>,
}

impl Trajectory {
    /// Validate a raw turn sequence.
    ///
    /// An empty sequence is accepted here; replay rejects it with
    /// `EmptyTrajectory` because only replay knows the incident it belongs to.
    pub fn new(turns: Vec<Turn>) -> GateResult<Self> {
        for (idx, turn) in turns.iter().enumerate() {
            let expected = idx as u32 + 1;
            if turn.position != expected {
                return Err(GateError::malformed(format!(
                    "turn at index {idx} has position {} (expected {expected})",
                    turn.position
                )));
            }
        }
        Ok(Self { turns })
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Lookup by 1-based turn position
    pub fn turn(&self, position: u32) -> Option<&Turn> {
        if position == 0 {
            return None;
        }
        self.turns.get(position as usize - 1)
    }

    /// Restartable iterator over the turns in order
    pub fn iter(&self) -> std::slice::Iter<'_, Turn> {
        self.turns.iter()
    }

    /// Resolve every turn's label, failing on the first unlabeled turn
    pub fn labels(&self) -> GateResult<Vec<SafetyLabel>> {
        self.turns
            .iter()
            .map(|t| {
                t.label.ok_or_else(|| {
                    GateError::malformed(format!("turn {} has no safety label", t.position))
                })
            })
            .collect()
    }

    /// Position of the first UNSAFE turn, if any
    pub fn first_unsafe_turn(&self) -> Option<u32> {
        self.turns
            .iter()
            .find(|t| t.label == Some(SafetyLabel::Unsafe))
            .map(|t| t.position)
    }
}

impl<'a> IntoIterator for &'a Trajectory {
    type Item = &'a Turn;
    type IntoIter = std::slice::Iter<'a, Turn>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl TryFrom<Vec<Turn>> for Trajectory {
    type Error = GateError;

    fn try_from(turns: Vec<Turn>) -> Result<Self, Self::Error> {
        Self::new(turns)
    }
}

impl From<Trajectory> for Vec<Turn> {
    fn from(trajectory: Trajectory) -> Self {
        trajectory.turns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(pos: u32, label: SafetyLabel) -> Turn {
        Turn::new(pos, ActorRole::Assistant, format!("turn {pos}"), Some(label))
    }

    #[test]
    fn test_contiguous_positions_accepted() {
        let t = Trajectory::new(vec![
            turn(1, SafetyLabel::Safe),
            turn(2, SafetyLabel::Hedge),
            turn(3, SafetyLabel::Unsafe),
        ])
        .unwrap();
        assert_eq!(t.len(), 3);
        assert_eq!(t.turn(2).unwrap().label(), Some(SafetyLabel::Hedge));
        assert!(t.turn(0).is_none());
        assert!(t.turn(4).is_none());
        assert_eq!(t.first_unsafe_turn(), Some(3));
    }

    #[test]
    fn test_gap_rejected() {
        let err = Trajectory::new(vec![turn(1, SafetyLabel::Safe), turn(3, SafetyLabel::Safe)])
            .unwrap_err();
        assert!(matches!(err, GateError::MalformedTrajectory { .. }));
    }

    #[test]
    fn test_not_starting_at_one_rejected() {
        let err = Trajectory::new(vec![turn(2, SafetyLabel::Safe)]).unwrap_err();
        assert!(matches!(err, GateError::MalformedTrajectory { .. }));
    }

    #[test]
    fn test_missing_label_surfaces_on_resolution() {
        let t = Trajectory::new(vec![
            turn(1, SafetyLabel::Safe),
            Turn::new(2, ActorRole::User, "ask", None),
        ])
        .unwrap();
        let err = t.labels().unwrap_err();
        assert!(err.to_string().contains("turn 2"));
    }

    #[test]
    fn test_iteration_is_restartable() {
        let t = Trajectory::new(vec![turn(1, SafetyLabel::Safe), turn(2, SafetyLabel::Safe)])
            .unwrap();
        let first: Vec<u32> = t.iter().map(Turn::position).collect();
        let second: Vec<u32> = (&t).into_iter().map(Turn::position).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_label_parse_accepts_legacy_spellings() {
        assert_eq!(SafetyLabel::parse("unsafe"), Some(SafetyLabel::Unsafe));
        assert_eq!(SafetyLabel::parse(" Hedged "), Some(SafetyLabel::Hedge));
        assert_eq!(SafetyLabel::parse("maybe"), None);
    }
}
