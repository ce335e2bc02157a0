//! Rule evaluation engine.
//!
//! A rule's threshold condition is stored as a selector plus optional lower and
//! upper bounds. [`Condition::from_parts`] is the only way to build a condition
//! from those columns, so a selector with missing or extra bounds is rejected
//! when the rule is saved and never reaches evaluation.
//!
//! Evaluation is a pure decision: given rules and a reading value it returns
//! one [`Verdict`] per rule and touches no alert state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Rule, RuleState, text_enum};

/// Stored name of a rule's evaluation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
    OutOfRange,
}

text_enum!(Selector, "rule selector" {
    LessThan => "less_than",
    LessOrEqual => "less_or_equal",
    GreaterThan => "greater_than",
    GreaterOrEqual => "greater_or_equal",
    OutOfRange => "out_of_range",
});

/// A validated threshold condition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "selector", rename_all = "snake_case")]
pub enum Condition {
    LessThan { lower: f64 },
    LessOrEqual { lower: f64 },
    GreaterThan { upper: f64 },
    GreaterOrEqual { upper: f64 },
    OutOfRange { lower: f64, upper: f64 },
}

impl Condition {
    /// Build a condition from its stored selector and bounds.
    ///
    /// Less-than style selectors take only a lower bound, greater-than style
    /// selectors only an upper bound, and out-of-range takes both with
    /// `lower <= upper`. Bounds must be finite.
    pub fn from_parts(selector: Selector, lower: Option<f64>, upper: Option<f64>) -> Result<Self> {
        for bound in [lower, upper].into_iter().flatten() {
            if !bound.is_finite() {
                return Err(Error::InvalidRule(format!(
                    "{selector} threshold must be a finite number"
                )));
            }
        }

        match (selector, lower, upper) {
            (Selector::LessThan, Some(lower), None) => Ok(Condition::LessThan { lower }),
            (Selector::LessOrEqual, Some(lower), None) => Ok(Condition::LessOrEqual { lower }),
            (Selector::GreaterThan, None, Some(upper)) => Ok(Condition::GreaterThan { upper }),
            (Selector::GreaterOrEqual, None, Some(upper)) => {
                Ok(Condition::GreaterOrEqual { upper })
            }
            (Selector::OutOfRange, Some(lower), Some(upper)) if lower <= upper => {
                Ok(Condition::OutOfRange { lower, upper })
            }
            (Selector::OutOfRange, Some(lower), Some(upper)) => Err(Error::InvalidRule(format!(
                "out_of_range lower threshold {lower} exceeds upper threshold {upper}"
            ))),
            (Selector::OutOfRange, _, _) => Err(Error::InvalidRule(
                "out_of_range requires both lower and upper thresholds".to_string(),
            )),
            (Selector::LessThan | Selector::LessOrEqual, _, _) => Err(Error::InvalidRule(
                format!("{selector} requires a lower threshold and no upper threshold"),
            )),
            (Selector::GreaterThan | Selector::GreaterOrEqual, _, _) => Err(Error::InvalidRule(
                format!("{selector} requires an upper threshold and no lower threshold"),
            )),
        }
    }

    pub fn selector(&self) -> Selector {
        match self {
            Condition::LessThan { .. } => Selector::LessThan,
            Condition::LessOrEqual { .. } => Selector::LessOrEqual,
            Condition::GreaterThan { .. } => Selector::GreaterThan,
            Condition::GreaterOrEqual { .. } => Selector::GreaterOrEqual,
            Condition::OutOfRange { .. } => Selector::OutOfRange,
        }
    }

    pub fn lower(&self) -> Option<f64> {
        match *self {
            Condition::LessThan { lower }
            | Condition::LessOrEqual { lower }
            | Condition::OutOfRange { lower, .. } => Some(lower),
            _ => None,
        }
    }

    pub fn upper(&self) -> Option<f64> {
        match *self {
            Condition::GreaterThan { upper }
            | Condition::GreaterOrEqual { upper }
            | Condition::OutOfRange { upper, .. } => Some(upper),
            _ => None,
        }
    }

    /// True if `value` violates the condition.
    pub fn matches(&self, value: f64) -> bool {
        match *self {
            Condition::LessThan { lower } => value < lower,
            Condition::LessOrEqual { lower } => value <= lower,
            Condition::GreaterThan { upper } => value > upper,
            Condition::GreaterOrEqual { upper } => value >= upper,
            Condition::OutOfRange { lower, upper } => value < lower || value > upper,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::LessThan { lower } => write!(f, "value < {lower}"),
            Condition::LessOrEqual { lower } => write!(f, "value <= {lower}"),
            Condition::GreaterThan { upper } => write!(f, "value > {upper}"),
            Condition::GreaterOrEqual { upper } => write!(f, "value >= {upper}"),
            Condition::OutOfRange { lower, upper } => {
                write!(f, "value outside {lower} to {upper}")
            }
        }
    }
}

/// Why a rule was not evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SkipReason {
    Inactive,
    Paused,
}

/// Outcome of evaluating one rule against one reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Match,
    NoMatch,
    Skipped(SkipReason),
}

/// Evaluate a single rule against a reading value.
pub fn evaluate(rule: &Rule, value: f64) -> Verdict {
    match rule.state {
        RuleState::Inactive => Verdict::Skipped(SkipReason::Inactive),
        RuleState::Paused => Verdict::Skipped(SkipReason::Paused),
        RuleState::Active if rule.condition.matches(value) => Verdict::Match,
        RuleState::Active => Verdict::NoMatch,
    }
}

/// Evaluate every rule attached to a channel, preserving rule order.
pub fn evaluate_all(rules: &[Rule], value: f64) -> Vec<(&Rule, Verdict)> {
    rules.iter().map(|rule| (rule, evaluate(rule, value))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RuleAction;

    fn rule(condition: Condition, state: RuleState) -> Rule {
        Rule {
            id: 1,
            name: "freezer".to_string(),
            condition,
            action: RuleAction::EmailText,
            state,
            paused_until: None,
            contacts: vec![],
        }
    }

    #[test]
    fn test_less_than() {
        let r = rule(Condition::LessThan { lower: 10.0 }, RuleState::Active);
        assert_eq!(evaluate(&r, 9.0), Verdict::Match);
        assert_eq!(evaluate(&r, 10.0), Verdict::NoMatch);
        assert_eq!(evaluate(&r, 11.0), Verdict::NoMatch);
    }

    #[test]
    fn test_less_or_equal_includes_boundary() {
        let r = rule(Condition::LessOrEqual { lower: 10.0 }, RuleState::Active);
        assert_eq!(evaluate(&r, 10.0), Verdict::Match);
        assert_eq!(evaluate(&r, 10.5), Verdict::NoMatch);
    }

    #[test]
    fn test_greater_than_and_greater_or_equal() {
        let gt = rule(Condition::GreaterThan { upper: 30.0 }, RuleState::Active);
        assert_eq!(evaluate(&gt, 30.0), Verdict::NoMatch);
        assert_eq!(evaluate(&gt, 30.1), Verdict::Match);

        let ge = rule(Condition::GreaterOrEqual { upper: 30.0 }, RuleState::Active);
        assert_eq!(evaluate(&ge, 30.0), Verdict::Match);
        assert_eq!(evaluate(&ge, 29.9), Verdict::NoMatch);
    }

    #[test]
    fn test_out_of_range() {
        let r = rule(
            Condition::OutOfRange {
                lower: 5.0,
                upper: 20.0,
            },
            RuleState::Active,
        );
        assert_eq!(evaluate(&r, 3.0), Verdict::Match);
        assert_eq!(evaluate(&r, 12.0), Verdict::NoMatch);
        assert_eq!(evaluate(&r, 25.0), Verdict::Match);
        assert_eq!(evaluate(&r, 5.0), Verdict::NoMatch);
        assert_eq!(evaluate(&r, 20.0), Verdict::NoMatch);
    }

    #[test]
    fn test_inactive_and_paused_rules_are_skipped() {
        let inactive = rule(Condition::LessThan { lower: 10.0 }, RuleState::Inactive);
        let paused = rule(Condition::LessThan { lower: 10.0 }, RuleState::Paused);

        assert_eq!(
            evaluate(&inactive, 0.0),
            Verdict::Skipped(SkipReason::Inactive)
        );
        assert_eq!(evaluate(&paused, 0.0), Verdict::Skipped(SkipReason::Paused));
    }

    #[test]
    fn test_evaluate_all_keeps_order() {
        let rules = vec![
            rule(Condition::LessThan { lower: 10.0 }, RuleState::Active),
            rule(Condition::GreaterThan { upper: 5.0 }, RuleState::Paused),
        ];

        let verdicts: Vec<Verdict> = evaluate_all(&rules, 7.0).into_iter().map(|(_, v)| v).collect();
        assert_eq!(
            verdicts,
            vec![Verdict::Match, Verdict::Skipped(SkipReason::Paused)]
        );
    }

    #[test]
    fn test_from_parts_accepts_well_formed() {
        assert_eq!(
            Condition::from_parts(Selector::OutOfRange, Some(5.0), Some(20.0)).unwrap(),
            Condition::OutOfRange {
                lower: 5.0,
                upper: 20.0
            }
        );
        assert_eq!(
            Condition::from_parts(Selector::GreaterOrEqual, None, Some(1.0)).unwrap(),
            Condition::GreaterOrEqual { upper: 1.0 }
        );
    }

    #[test]
    fn test_from_parts_rejects_malformed() {
        let missing_bound = Condition::from_parts(Selector::OutOfRange, Some(5.0), None);
        assert!(matches!(missing_bound, Err(Error::InvalidRule(_))));

        let extra_bound = Condition::from_parts(Selector::LessThan, Some(5.0), Some(9.0));
        assert!(matches!(extra_bound, Err(Error::InvalidRule(_))));

        let wrong_side = Condition::from_parts(Selector::GreaterThan, Some(5.0), None);
        assert!(matches!(wrong_side, Err(Error::InvalidRule(_))));

        let inverted = Condition::from_parts(Selector::OutOfRange, Some(20.0), Some(5.0));
        assert!(matches!(inverted, Err(Error::InvalidRule(_))));

        let nan = Condition::from_parts(Selector::LessThan, Some(f64::NAN), None);
        assert!(matches!(nan, Err(Error::InvalidRule(_))));
    }

    #[test]
    fn test_condition_parts_round_trip_through_columns() {
        let condition = Condition::OutOfRange {
            lower: -2.0,
            upper: 8.0,
        };
        let rebuilt =
            Condition::from_parts(condition.selector(), condition.lower(), condition.upper())
                .unwrap();
        assert_eq!(rebuilt, condition);
    }

    #[test]
    fn test_rule_description() {
        let r = rule(Condition::LessThan { lower: 10.0 }, RuleState::Active);
        assert_eq!(r.description(), "freezer: value < 10");
    }
}
