//! Deterministic fallback models.
//!
//! Seeded, repeatable token generation with no native dependencies. Used by
//! tests, by offline nodes, and as the reference oracle for the mesh
//! equality property: a verifier and a drafter built from the same seed
//! always agree, so drafts verify clean; different seeds diverge and force
//! corrections. Either way the committed stream is exactly what a purely
//! local run would produce.
//!
//! The next token depends only on the seed and the trailing
//! [`CHOICE_WINDOW`] tokens, which keeps a drafter working from the
//! truncated `prompt_context` window in lockstep with the verifier's full
//! context.

use super::drafter::DrafterModel;
use super::verifier::{ModelError, PrefixVerdict, VerifierModel};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Trailing tokens that feed the next-token choice.
const CHOICE_WINDOW: usize = 4;

const VOCABULARY: &[&str] = &[
    "the", "a", "of", "to", "and", "in", "is", "it", "that", "was", "for", "on", "are", "as",
    "with", "his", "they", "at", "be", "this", "have", "from", "or", "one", "had", "by", "word",
    "but", "not", "what", "all", "were", "we", "when", "your", "can", "said", "there", "use",
    "an", "each", "which", "she", "do", "how", "their", "if", "will", "up", "other", "about",
    "out", "many", "then", "them", "these", "so", "some", "her", "would", "make", "like", "him",
    "into", "time",
];

fn token_id(token: &str) -> u64 {
    let digest = crate::crypto::sha3(token.as_bytes());
    u64::from_le_bytes(digest[..8].try_into().unwrap())
}

#[derive(Debug, Clone)]
pub struct DeterministicVerifier {
    seed: u64,
}

impl DeterministicVerifier {
    pub fn with_seed(seed: u64) -> Self {
        Self { seed }
    }

    /// Top-k candidate set at the position following `context`, best first.
    fn candidates(&self, context: &[String], k: usize) -> Vec<&'static str> {
        let mut state = self.seed;
        let window_start = context.len().saturating_sub(CHOICE_WINDOW);
        for token in &context[window_start..] {
            state = state.wrapping_mul(0x100000001b3).wrapping_add(token_id(token));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(state);
        let base = rng.gen_range(0..VOCABULARY.len());
        (0..k.max(1).min(VOCABULARY.len()))
            .map(|j| VOCABULARY[(base + j) % VOCABULARY.len()])
            .collect()
    }
}

impl VerifierModel for DeterministicVerifier {
    fn tokenise(&self, text: &str) -> Vec<String> {
        text.split_whitespace().map(str::to_string).collect()
    }

    fn extend(&self, context: &[String], n: usize) -> Result<Vec<String>, ModelError> {
        let mut working = context.to_vec();
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let next = self.candidates(&working, 1)[0].to_string();
            working.push(next.clone());
            out.push(next);
        }
        Ok(out)
    }

    fn verify_prefix(
        &self,
        context: &[String],
        draft: &[String],
        fuzzy_top_k: usize,
    ) -> Result<PrefixVerdict, ModelError> {
        let mut working = context.to_vec();
        let mut accepted = Vec::new();
        for token in draft {
            let candidates = self.candidates(&working, fuzzy_top_k);
            let wanted = token_id(token);
            if candidates.iter().any(|c| token_id(c) == wanted) {
                working.push(token.clone());
                accepted.push(token.clone());
            } else {
                return Ok(PrefixVerdict::diverge_at(accepted, candidates[0].to_string()));
            }
        }
        Ok(PrefixVerdict::accept_all(accepted))
    }

    fn stop_tokens(&self) -> Vec<String> {
        vec!["</s>".to_string()]
    }

    fn id_for(&self, token: &str) -> u64 {
        token_id(token)
    }
}

/// Drafter sharing the verifier's choice function.
#[derive(Debug, Clone)]
pub struct DeterministicDrafter {
    core: DeterministicVerifier,
}

impl DeterministicDrafter {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            core: DeterministicVerifier::with_seed(seed),
        }
    }
}

impl DrafterModel for DeterministicDrafter {
    fn draft(&self, prompt_context: &str, k: usize) -> Vec<String> {
        let context = self.core.tokenise(prompt_context);
        self.core.extend(&context, k).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn extend_is_deterministic() {
        let a = DeterministicVerifier::with_seed(42);
        let b = DeterministicVerifier::with_seed(42);
        let context = ctx(&["hello", "world"]);
        assert_eq!(a.extend(&context, 8).unwrap(), b.extend(&context, 8).unwrap());
    }

    #[test]
    fn different_seeds_diverge() {
        let a = DeterministicVerifier::with_seed(1);
        let b = DeterministicVerifier::with_seed(2);
        let context = ctx(&["hello", "world"]);
        assert_ne!(a.extend(&context, 8).unwrap(), b.extend(&context, 8).unwrap());
    }

    #[test]
    fn choice_depends_only_on_trailing_window() {
        let model = DeterministicVerifier::with_seed(7);
        let long = ctx(&["x", "y", "z", "the", "a", "of", "to"]);
        let short = ctx(&["the", "a", "of", "to"]);
        assert_eq!(model.extend(&long, 1).unwrap(), model.extend(&short, 1).unwrap());
    }

    #[test]
    fn agreeing_drafter_verifies_clean() {
        let verifier = DeterministicVerifier::with_seed(42);
        let drafter = DeterministicDrafter::with_seed(42);
        let context = ctx(&["once", "upon", "a", "time"]);
        let draft = drafter.draft("once upon a time", 5);
        assert_eq!(draft.len(), 5);

        let verdict = verifier.verify_prefix(&context, &draft, 1).unwrap();
        assert_eq!(verdict.accepted, draft);
        assert!(verdict.correction.is_none());
    }

    #[test]
    fn diverging_drafter_gets_corrected_to_local_choice() {
        let verifier = DeterministicVerifier::with_seed(42);
        let drafter = DeterministicDrafter::with_seed(1337);
        let context = ctx(&["once", "upon", "a", "time"]);
        let draft = drafter.draft("once upon a time", 5);
        let local = verifier.extend(&context, 5).unwrap();
        let verdict = verifier.verify_prefix(&context, &draft, 1).unwrap();

        // Accepted prefix plus correction must equal the local run prefix.
        let mut merged = verdict.accepted.clone();
        if let Some(c) = verdict.correction.clone() {
            merged.push(c);
        }
        assert!(!merged.is_empty());
        assert_eq!(merged[..], local[..merged.len()]);
    }

    #[test]
    fn fuzzy_widens_acceptance() {
        let verifier = DeterministicVerifier::with_seed(42);
        let context = ctx(&["once", "upon", "a", "time"]);
        // Second-ranked candidate is rejected strictly but accepted at k=2.
        let second = verifier.candidates(&context, 2)[1].to_string();
        let strict = verifier.verify_prefix(&context, &[second.clone()], 1).unwrap();
        assert!(strict.accepted.is_empty());
        assert!(strict.correction.is_some());
        let fuzzy = verifier.verify_prefix(&context, &[second.clone()], 2).unwrap();
        assert_eq!(fuzzy.accepted, vec![second]);
        assert!(fuzzy.correction.is_none());
    }
}
