//! Trigger specifications.
//!
//! Two levels exist: a per-channel [`TriggerMatchType`] stored on
//! [`Channel`](crate::device::Channel), and the session-wide [`Trigger`]
//! made of ordered stages. A session trigger must be well formed before an
//! acquisition starts; [`Trigger::verify`] enforces that.

use std::str::FromStr;

use crate::error::{AcqError, AcqResult};

/// Condition a channel must satisfy to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerMatchType {
    Zero,
    One,
    Rising,
    Falling,
    Edge,
    Over,
    Under,
}

impl TriggerMatchType {
    /// Single character notation (`0 1 r f e o u`).
    pub fn as_char(self) -> char {
        match self {
            TriggerMatchType::Zero => '0',
            TriggerMatchType::One => '1',
            TriggerMatchType::Rising => 'r',
            TriggerMatchType::Falling => 'f',
            TriggerMatchType::Edge => 'e',
            TriggerMatchType::Over => 'o',
            TriggerMatchType::Under => 'u',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            '0' => TriggerMatchType::Zero,
            '1' => TriggerMatchType::One,
            'r' => TriggerMatchType::Rising,
            'f' => TriggerMatchType::Falling,
            'e' => TriggerMatchType::Edge,
            'o' => TriggerMatchType::Over,
            'u' => TriggerMatchType::Under,
            _ => return None,
        })
    }

    /// Analog-only conditions.
    pub fn needs_value(self) -> bool {
        matches!(self, TriggerMatchType::Over | TriggerMatchType::Under)
    }
}

impl FromStr for TriggerMatchType {
    type Err = AcqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.trim().chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => TriggerMatchType::from_char(c)
                .ok_or_else(|| AcqError::arg(format!("unknown trigger match '{}'", s))),
            _ => Err(AcqError::arg(format!("unknown trigger match '{}'", s))),
        }
    }
}

impl std::fmt::Display for TriggerMatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// One channel condition inside a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerMatch {
    /// Channel name; an empty name matches nothing and fails verification.
    pub channel: String,
    pub match_type: TriggerMatchType,
    /// Threshold for `Over`/`Under`.
    pub value: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerStage {
    pub stage: usize,
    pub matches: Vec<TriggerMatch>,
}

/// Session-wide multi-stage trigger.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trigger {
    pub name: Option<String>,
    pub stages: Vec<TriggerStage>,
}

impl Trigger {
    pub fn new(name: Option<&str>) -> Self {
        Self {
            name: name.map(str::to_string),
            stages: Vec::new(),
        }
    }

    /// Append an empty stage and return it for filling.
    pub fn add_stage(&mut self) -> &mut TriggerStage {
        let stage = self.stages.len();
        self.stages.push(TriggerStage {
            stage,
            matches: Vec::new(),
        });
        let last = self.stages.len() - 1;
        &mut self.stages[last]
    }

    /// Reject triggers that could never fire.
    pub fn verify(&self) -> AcqResult<()> {
        if self.stages.is_empty() {
            return Err(AcqError::arg("trigger has no stages"));
        }
        for stage in &self.stages {
            if stage.matches.is_empty() {
                return Err(AcqError::arg(format!(
                    "trigger stage {} has no matches",
                    stage.stage
                )));
            }
            for m in &stage.matches {
                if m.channel.is_empty() {
                    return Err(AcqError::arg(format!(
                        "trigger stage {} has a match without a channel",
                        stage.stage
                    )));
                }
            }
        }
        Ok(())
    }
}

impl TriggerStage {
    pub fn add_match(&mut self, channel: &str, match_type: TriggerMatchType, value: f32) {
        self.matches.push(TriggerMatch {
            channel: channel.to_string(),
            match_type,
            value,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_type_notation() {
        for c in ['0', '1', 'r', 'f', 'e', 'o', 'u'] {
            let m = TriggerMatchType::from_char(c).unwrap();
            assert_eq!(m.as_char(), c);
        }
        assert!("x".parse::<TriggerMatchType>().is_err());
        assert!("rf".parse::<TriggerMatchType>().is_err());
        assert_eq!("r".parse::<TriggerMatchType>().unwrap(), TriggerMatchType::Rising);
    }

    #[test]
    fn test_verify() {
        let mut trigger = Trigger::new(Some("t"));
        assert!(trigger.verify().is_err());

        trigger.add_stage();
        assert!(trigger.verify().is_err());

        trigger.stages[0].add_match("D0", TriggerMatchType::Rising, 0.0);
        assert!(trigger.verify().is_ok());

        trigger.add_stage().add_match("", TriggerMatchType::One, 0.0);
        assert!(matches!(trigger.verify(), Err(AcqError::Arg(_))));
    }
}
