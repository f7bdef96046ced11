// src/runtime/declaration.rs
//! Exit declarations
//!
//! What a test says about termination: which codes are acceptable and how
//! many attempts it must make, or that it must not exit at all. A
//! declaration on the test itself takes precedence over one on its suite.

use crate::interception::registry::ExitAttempt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Acceptable exit codes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpectedCodes {
    Any,
    Set { codes: BTreeSet<i32> },
    /// Inclusive on both ends
    Range { start: i32, end: i32 },
}

impl ExpectedCodes {
    pub fn accepts(&self, code: i32) -> bool {
        match self {
            ExpectedCodes::Any => true,
            ExpectedCodes::Set { codes } => codes.contains(&code),
            ExpectedCodes::Range { start, end } => (*start..=*end).contains(&code),
        }
    }
}

impl fmt::Display for ExpectedCodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedCodes::Any => write!(f, "any exit code"),
            ExpectedCodes::Set { codes } if codes.len() == 1 => {
                write!(f, "exit code {}", codes.iter().next().copied().unwrap_or_default())
            }
            ExpectedCodes::Set { codes } => {
                let rendered: Vec<String> = codes.iter().map(i32::to_string).collect();
                write!(f, "exit code in [{}]", rendered.join(", "))
            }
            ExpectedCodes::Range { start, end } => write!(f, "exit code in {}..={}", start, end),
        }
    }
}

/// How many attempts an expecting test must make
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    ExactlyOne,
    #[default]
    AtLeastOne,
}

/// A test's declared termination behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExitDeclaration {
    /// The test must exit with an acceptable code
    Expect {
        codes: ExpectedCodes,
        cardinality: Cardinality,
    },
    /// The test must not exit
    Forbid,
}

impl ExitDeclaration {
    /// Expect an exit with any code
    pub fn any() -> Self {
        Self::expect(ExpectedCodes::Any)
    }

    /// Expect an exit with exactly `code`
    pub fn code(code: i32) -> Self {
        Self::codes([code])
    }

    /// Expect an exit with one of `codes`
    pub fn codes(codes: impl IntoIterator<Item = i32>) -> Self {
        Self::expect(ExpectedCodes::Set {
            codes: codes.into_iter().collect(),
        })
    }

    /// Expect an exit with a code in `start..=end` (bounds are reordered if reversed)
    pub fn range(start: i32, end: i32) -> Self {
        Self::expect(ExpectedCodes::Range {
            start: start.min(end),
            end: start.max(end),
        })
    }

    /// Require a single attempt
    pub fn exactly_once(self) -> Self {
        match self {
            ExitDeclaration::Expect { codes, .. } => ExitDeclaration::Expect {
                codes,
                cardinality: Cardinality::ExactlyOne,
            },
            ExitDeclaration::Forbid => ExitDeclaration::Forbid,
        }
    }

    /// The test must not exit
    pub fn forbid() -> Self {
        ExitDeclaration::Forbid
    }

    fn expect(codes: ExpectedCodes) -> Self {
        ExitDeclaration::Expect {
            codes,
            cardinality: Cardinality::AtLeastOne,
        }
    }

    /// Pick the test's own declaration, falling back to its suite's
    pub fn resolve(
        method: Option<&ExitDeclaration>,
        suite: Option<&ExitDeclaration>,
    ) -> Option<ExitDeclaration> {
        method.or(suite).cloned()
    }

    pub fn expects_exit(&self) -> bool {
        matches!(self, ExitDeclaration::Expect { .. })
    }

    /// Check captured attempts, returning a failure message on mismatch
    ///
    /// Every attempt must carry an acceptable code, not just the first.
    pub fn verify(&self, attempts: &[ExitAttempt]) -> Result<(), String> {
        match self {
            ExitDeclaration::Forbid => match attempts {
                [] => Ok(()),
                [only] => Err(format!("unexpected exit with code {}", only.code)),
                [first, ..] => Err(format!(
                    "unexpected exit with code {} ({} attempts, codes {})",
                    first.code,
                    attempts.len(),
                    render_codes(attempts)
                )),
            },
            ExitDeclaration::Expect { codes, cardinality } => {
                if attempts.is_empty() {
                    return Err("expected exit, none occurred".to_string());
                }

                if *cardinality == Cardinality::ExactlyOne && attempts.len() > 1 {
                    return Err(format!(
                        "expected exactly one exit attempt, got {} (codes {})",
                        attempts.len(),
                        render_codes(attempts)
                    ));
                }

                match attempts.iter().find(|a| !codes.accepts(a.code)) {
                    Some(wrong) => Err(format!("expected {}, got {}", codes, wrong.code)),
                    None => Ok(()),
                }
            }
        }
    }
}

impl fmt::Display for ExitDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitDeclaration::Forbid => write!(f, "no exit"),
            ExitDeclaration::Expect {
                codes,
                cardinality: Cardinality::ExactlyOne,
            } => write!(f, "{} (exactly once)", codes),
            ExitDeclaration::Expect { codes, .. } => write!(f, "{}", codes),
        }
    }
}

fn render_codes(attempts: &[ExitAttempt]) -> String {
    let codes: Vec<String> = attempts.iter().map(|a| a.code.to_string()).collect();
    format!("[{}]", codes.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempts(codes: &[i32]) -> Vec<ExitAttempt> {
        codes.iter().map(|&code| ExitAttempt { code }).collect()
    }

    #[test]
    fn test_single_code() {
        let declaration = ExitDeclaration::code(2);
        assert!(declaration.verify(&attempts(&[2])).is_ok());
        assert_eq!(
            declaration.verify(&attempts(&[3])).unwrap_err(),
            "expected exit code 2, got 3"
        );
        assert_eq!(
            declaration.verify(&[]).unwrap_err(),
            "expected exit, none occurred"
        );
    }

    #[test]
    fn test_code_set_and_range() {
        let set = ExitDeclaration::codes([2, 1]);
        assert!(set.verify(&attempts(&[1])).is_ok());
        assert_eq!(
            set.verify(&attempts(&[3])).unwrap_err(),
            "expected exit code in [1, 2], got 3"
        );

        let range = ExitDeclaration::range(6, 1);
        assert!(range.verify(&attempts(&[1])).is_ok());
        assert!(range.verify(&attempts(&[6])).is_ok());
        assert_eq!(
            range.verify(&attempts(&[7])).unwrap_err(),
            "expected exit code in 1..=6, got 7"
        );
    }

    #[test]
    fn test_cardinality() {
        let at_least_one = ExitDeclaration::code(2);
        assert!(at_least_one.verify(&attempts(&[2, 2])).is_ok());

        let exactly_one = ExitDeclaration::code(2).exactly_once();
        assert!(exactly_one.verify(&attempts(&[2])).is_ok());
        assert_eq!(
            exactly_one.verify(&attempts(&[2, 2])).unwrap_err(),
            "expected exactly one exit attempt, got 2 (codes [2, 2])"
        );
    }

    #[test]
    fn test_every_attempt_is_checked() {
        let declaration = ExitDeclaration::code(2);
        assert_eq!(
            declaration.verify(&attempts(&[2, 5])).unwrap_err(),
            "expected exit code 2, got 5"
        );
    }

    #[test]
    fn test_any_code() {
        let declaration = ExitDeclaration::any();
        assert!(declaration.verify(&attempts(&[-1])).is_ok());
        assert!(declaration.verify(&[]).is_err());
    }

    #[test]
    fn test_forbid() {
        let declaration = ExitDeclaration::forbid();
        assert!(declaration.verify(&[]).is_ok());
        assert_eq!(
            declaration.verify(&attempts(&[9])).unwrap_err(),
            "unexpected exit with code 9"
        );
        assert_eq!(
            declaration.verify(&attempts(&[9, 4])).unwrap_err(),
            "unexpected exit with code 9 (2 attempts, codes [9, 4])"
        );
        assert_eq!(declaration.exactly_once(), ExitDeclaration::Forbid);
    }

    #[test]
    fn test_method_overrides_suite() {
        let method = ExitDeclaration::code(1);
        let suite = ExitDeclaration::forbid();

        assert_eq!(
            ExitDeclaration::resolve(Some(&method), Some(&suite)),
            Some(method.clone())
        );
        assert_eq!(
            ExitDeclaration::resolve(None, Some(&suite)),
            Some(ExitDeclaration::Forbid)
        );
        assert_eq!(ExitDeclaration::resolve(None, None), None);
    }

    #[test]
    fn test_serialized_form() {
        let json = serde_json::to_value(ExitDeclaration::code(2).exactly_once()).unwrap();
        assert_eq!(json["mode"], "expect");
        assert_eq!(json["cardinality"], "exactly_one");
        assert_eq!(json["codes"]["kind"], "set");
        assert_eq!(json["codes"]["codes"], serde_json::json!([2]));

        let back: ExitDeclaration = serde_json::from_value(json).unwrap();
        assert_eq!(back, ExitDeclaration::code(2).exactly_once());
    }
}
