//! Verification-prompt catalog.
//!
//! A fixed set of pre-solved prompts compiled into both verifier and drafter
//! builds. Drafters detect them by pattern-matching the last user turn and
//! answer from the catalog instead of running their model; the verifier
//! grades any reply it collects for a matching prompt. Version skew between
//! builds is fine: an old drafter that misses a new prompt is graded wrong,
//! which is the intended semantics.

use serde::{Deserialize, Serialize};

/// How a drafter's reply is compared against the expected answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchMode {
    /// Normalised reply equals the expected string.
    Exact,
    /// Normalised reply contains the expected string.
    Contains,
    /// First numeric literal in the reply equals the expected value.
    Numeric,
}

/// One pre-solved prompt.
#[derive(Debug, Clone)]
pub struct VerificationPrompt {
    /// Shown to drafters as the prompt context on injected rounds.
    pub prompt: &'static str,
    /// Case-folded substring that identifies this prompt in a user turn.
    pub pattern: &'static str,
    pub expected: &'static str,
    pub mode: MatchMode,
}

/// The compiled-in catalog. Identical on every node of a deployment.
const CATALOG: &[VerificationPrompt] = &[
    VerificationPrompt {
        prompt: "What is 2+2?",
        pattern: "what is 2+2",
        expected: "4",
        mode: MatchMode::Numeric,
    },
    VerificationPrompt {
        prompt: "What is the capital of France?",
        pattern: "capital of france",
        expected: "paris",
        mode: MatchMode::Contains,
    },
    VerificationPrompt {
        prompt: "Spell the word cat backwards.",
        pattern: "spell the word cat backwards",
        expected: "tac",
        mode: MatchMode::Exact,
    },
    VerificationPrompt {
        prompt: "How many days are in a week?",
        pattern: "how many days are in a week",
        expected: "7",
        mode: MatchMode::Numeric,
    },
    VerificationPrompt {
        prompt: "What color is the sky on a clear day?",
        pattern: "color is the sky on a clear day",
        expected: "blue",
        mode: MatchMode::Contains,
    },
    VerificationPrompt {
        prompt: "What is 12 times 12?",
        pattern: "what is 12 times 12",
        expected: "144",
        mode: MatchMode::Numeric,
    },
];

pub struct Catalog;

impl Catalog {
    /// Classify a user turn. Returns the matching prompt, if any.
    pub fn classify(text: &str) -> Option<&'static VerificationPrompt> {
        let folded = text.to_lowercase();
        CATALOG.iter().find(|p| folded.contains(p.pattern))
    }

    /// Pick a prompt for an injected auction round.
    pub fn pick(index: usize) -> &'static VerificationPrompt {
        &CATALOG[index % CATALOG.len()]
    }

    pub fn len() -> usize {
        CATALOG.len()
    }

    /// Grade a drafter's reply against a catalog entry.
    pub fn grade(prompt: &VerificationPrompt, reply: &str) -> bool {
        let normalised = reply.trim().to_lowercase();
        match prompt.mode {
            MatchMode::Exact => normalised == prompt.expected,
            MatchMode::Contains => normalised.contains(prompt.expected),
            MatchMode::Numeric => match (first_number(&normalised), first_number(prompt.expected)) {
                (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
                _ => false,
            },
        }
    }

    /// The canonical answer an honest drafter publishes.
    pub fn canonical_answer(prompt: &VerificationPrompt) -> String {
        prompt.expected.to_string()
    }
}

/// First numeric literal in a string, if any. Handles signs and decimals.
fn first_number(s: &str) -> Option<f64> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_digit() || (c == '-' && matches!(bytes.get(i + 1), Some(b) if (*b as char).is_ascii_digit())) {
            let start = i;
            i += 1;
            let mut seen_dot = false;
            while i < bytes.len() {
                let c = bytes[i] as char;
                if c.is_ascii_digit() {
                    i += 1;
                } else if c == '.' && !seen_dot && matches!(bytes.get(i + 1), Some(b) if (*b as char).is_ascii_digit()) {
                    seen_dot = true;
                    i += 1;
                } else {
                    break;
                }
            }
            return s[start..i].parse().ok();
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_is_case_insensitive() {
        let p = Catalog::classify("WHAT IS 2+2?").unwrap();
        assert_eq!(p.expected, "4");
        assert!(Catalog::classify("tell me a story").is_none());
    }

    #[test]
    fn classify_matches_embedded_pattern() {
        // A natural user turn containing a catalog pattern still classifies.
        assert!(Catalog::classify("by the way, what is the capital of France again?").is_some());
    }

    #[test]
    fn grade_exact() {
        let p = &VerificationPrompt {
            prompt: "",
            pattern: "",
            expected: "tac",
            mode: MatchMode::Exact,
        };
        assert!(Catalog::grade(p, "  TAC "));
        assert!(!Catalog::grade(p, "the answer is tac"));
    }

    #[test]
    fn grade_contains() {
        let p = &VerificationPrompt {
            prompt: "",
            pattern: "",
            expected: "paris",
            mode: MatchMode::Contains,
        };
        assert!(Catalog::grade(p, "The capital is Paris."));
        assert!(!Catalog::grade(p, "London, obviously"));
    }

    #[test]
    fn grade_numeric_takes_first_literal() {
        let p = &VerificationPrompt {
            prompt: "",
            pattern: "",
            expected: "4",
            mode: MatchMode::Numeric,
        };
        assert!(Catalog::grade(p, "4"));
        assert!(Catalog::grade(p, "the answer is 4, trivially"));
        assert!(Catalog::grade(p, "4.0"));
        assert!(!Catalog::grade(p, "5 or so"));
        assert!(!Catalog::grade(p, "no idea"));
    }

    #[test]
    fn first_number_handles_negatives_and_decimals() {
        assert_eq!(first_number("minus -3.5 degrees"), Some(-3.5));
        assert_eq!(first_number("a1b2"), Some(1.0));
        assert_eq!(first_number("none"), None);
    }

    #[test]
    fn canonical_answer_passes_its_own_grading() {
        for i in 0..Catalog::len() {
            let p = Catalog::pick(i);
            assert!(
                Catalog::grade(p, &Catalog::canonical_answer(p)),
                "catalog entry {} fails self-grading",
                i
            );
            // Every catalog prompt must classify from its own prompt text.
            assert!(Catalog::classify(p.prompt).is_some());
        }
    }
}
