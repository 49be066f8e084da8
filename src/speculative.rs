//! Speculative generation loop.
//!
//! The state machine of one completion: extend locally, auction the context
//! tail to scouts on a throttle, verify whatever comes back, and stream
//! committed tokens to the façade. Remote drafts only decide which positions
//! are filled from which source; the committed stream is always the exact
//! prefix a purely local run of the verifier would have produced (for the
//! strict top-1 envelope; a wider fuzzy envelope admits draft tokens within
//! the verifier's top-k at each position).
//!
//! Verification prompts ride the same work stream. An injected round swaps
//! the broadcast context for a catalog prompt; a natural round is one where
//! the request's own last user turn matches the catalog. Either way the
//! collected draft is graded as a whole, feeds the reputation ledger, and is
//! never committed — the verifier always produces the user-visible tokens
//! itself.

use crate::auction::AuctionDriver;
use crate::catalog::{Catalog, VerificationPrompt};
use crate::config::MeshConfig;
use crate::error::MeshError;
use crate::facade::{CompletionEmitter, CompletionRequest, TerminalStatus};
use crate::model::{ModelError, VerifierHandle};
use crate::types::{last_user_message, ChatMessage, Role};
use rand::Rng;
use std::collections::HashSet;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// What a single auction round is for.
#[derive(Clone, Copy)]
enum Round {
    Normal,
    Verification(&'static VerificationPrompt),
}

/// Render prompt messages into the flat text the models consume.
pub fn render_prompt(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        out.push_str(role);
        out.push_str(": ");
        out.push_str(&message.content);
        out.push('\n');
    }
    out.push_str("assistant:");
    out
}

struct Session<'a> {
    verifier: VerifierHandle,
    emitter: &'a mut CompletionEmitter,
    context: Vec<String>,
    stop_ids: HashSet<u64>,
    max_tokens: usize,
    emitted: usize,
}

impl Session<'_> {
    /// Append one committed token and stream it out. Returns the terminal
    /// state reached by this token, if any.
    async fn commit(&mut self, token: String) -> Result<Option<TerminalStatus>, MeshError> {
        self.context.push(token.clone());
        self.emitter.emit(&token).await?;
        self.emitted += 1;
        if self.stop_ids.contains(&self.verifier.id_for(&token)) {
            return Ok(Some(TerminalStatus::Stop));
        }
        if self.emitted >= self.max_tokens {
            return Ok(Some(TerminalStatus::Length));
        }
        Ok(None)
    }

    fn context_tail(&self, window: usize) -> String {
        let start = self.context.len().saturating_sub(window);
        self.context[start..].join(" ")
    }
}

/// Drive one completion to a terminal state. Consumes the emitter; the
/// token stream closes when this returns.
pub async fn run_completion(
    verifier: VerifierHandle,
    mut auction: AuctionDriver,
    config: &MeshConfig,
    request: CompletionRequest,
    mut emitter: CompletionEmitter,
) -> TerminalStatus {
    let fingerprint = auction.fingerprint();
    let status = match drive(verifier, &mut auction, config, request, &mut emitter).await {
        Ok(terminal) => {
            debug!("request {} finished: {:?}", fingerprint, terminal);
            terminal
        }
        Err(e) => {
            info!("request {} failed: {}", fingerprint, e);
            TerminalStatus::Error(e)
        }
    };
    auction.finish();
    emitter.finish(status.clone());
    status
}

async fn drive(
    verifier: VerifierHandle,
    auction: &mut AuctionDriver,
    config: &MeshConfig,
    request: CompletionRequest,
    emitter: &mut CompletionEmitter,
) -> Result<TerminalStatus, MeshError> {
    let wall_deadline = Instant::now() + config.request_wall_budget();
    let prompt = render_prompt(&request.messages);

    let context = verifier
        .tokenise(prompt)
        .await
        .map_err(|e| MeshError::VerifierFatal(e.to_string()))?;

    let mut stop_ids: HashSet<u64> = verifier
        .stop_tokens()
        .iter()
        .map(|t| verifier.id_for(t))
        .collect();
    stop_ids.extend(request.stop_tokens.iter().map(|t| verifier.id_for(t)));

    let max_tokens = if request.max_tokens == 0 {
        config.max_tokens_per_request
    } else {
        request.max_tokens.min(config.max_tokens_per_request)
    };

    // A request whose own last user turn is a catalog prompt grades every
    // normal round it auctions.
    let natural_verification = last_user_message(&request.messages).and_then(Catalog::classify);

    let mut session = Session {
        verifier,
        emitter,
        context,
        stop_ids,
        max_tokens,
        emitted: 0,
    };

    let mut last_auction = Instant::now();
    let mut stall_rounds: u32 = 0;
    let mut cooldown_until: Option<Instant> = None;
    let mut emitter_status = None;

    let terminal = loop {
        if let Some(status) = emitter_status.take() {
            break status;
        }
        if session.emitter.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        if Instant::now() >= wall_deadline {
            return Err(MeshError::Timeout);
        }

        // Extending: one local token per iteration, always.
        let local = session
            .verifier
            .extend(session.context.clone(), 1)
            .await
            .map_err(fatal)?;
        match local.into_iter().next() {
            // The adapter signalled end-of-stream.
            None => break TerminalStatus::Stop,
            Some(token) => {
                if let Some(status) = session.commit(token).await? {
                    break status;
                }
            }
        }

        // Throttled auction: at most one round per interval, none while
        // cooling down or with nobody to ask.
        if let Some(until) = cooldown_until {
            if Instant::now() < until {
                continue;
            }
            cooldown_until = None;
            stall_rounds = 0;
            debug!("request {}: cooldown over, auctions resume", auction.fingerprint());
        }
        if last_auction.elapsed() < config.auction_interval() {
            continue;
        }
        last_auction = Instant::now();

        let round = if rand::thread_rng().gen_bool(config.verification_injection_rate) {
            let prompt = Catalog::pick(rand::thread_rng().gen_range(0..Catalog::len()));
            Round::Verification(prompt)
        } else if let Some(prompt) = natural_verification {
            Round::Verification(prompt)
        } else {
            Round::Normal
        };

        let tail = match round {
            Round::Verification(prompt) => prompt.prompt.to_string(),
            Round::Normal => session.context_tail(config.draft_context_window_tokens),
        };
        let (sequence, _reached) = auction.broadcast(&tail);
        let deadline = Instant::now() + config.auction_collect();
        let Some(draft) = auction.collect(sequence, deadline).await else {
            stall_rounds += 1;
            if stall_rounds >= config.stall_rounds_before_cooldown {
                info!(
                    "request {}: {} empty auction round(s), cooling down {:?}",
                    auction.fingerprint(),
                    stall_rounds,
                    config.cooldown()
                );
                cooldown_until = Some(Instant::now() + config.cooldown());
            }
            continue;
        };
        stall_rounds = 0;

        match round {
            Round::Verification(prompt) => {
                // Graded as a whole; never committed.
                let reply = draft.tokens.join(" ");
                let correct = Catalog::grade(prompt, &reply);
                match auction.grade(&draft.peer_id, correct) {
                    Ok(Some(ban)) => {
                        warn!("peer {} auto-banned: {}", draft.peer_id, ban.reason)
                    }
                    Ok(None) => trace!(
                        "graded verification answer from {}: correct={}",
                        draft.peer_id,
                        correct
                    ),
                    Err(e) => warn!("ledger update failed for {}: {}", draft.peer_id, e),
                }
            }
            Round::Normal => {
                if draft.tokens.is_empty() {
                    continue;
                }
                let verdict = session
                    .verifier
                    .verify_prefix(
                        session.context.clone(),
                        draft.tokens.clone(),
                        config.fuzzy_top_k,
                    )
                    .await
                    .map_err(fatal)?;
                trace!(
                    "draft from {}: {}/{} accepted, corrected={}",
                    draft.peer_id,
                    verdict.accepted.len(),
                    draft.tokens.len(),
                    verdict.correction.is_some()
                );
                for token in verdict.accepted {
                    if let Some(status) = session.commit(token).await? {
                        emitter_status = Some(status);
                        break;
                    }
                }
                if emitter_status.is_none() {
                    if let Some(correction) = verdict.correction {
                        if let Some(status) = session.commit(correction).await? {
                            emitter_status = Some(status);
                        }
                    }
                }
            }
        }
    };

    Ok(terminal)
}

fn fatal(e: ModelError) -> MeshError {
    MeshError::VerifierFatal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_prompt_shapes_transcript() {
        let messages = vec![ChatMessage::system("be brief"), ChatMessage::user("Say hi.")];
        let text = render_prompt(&messages);
        assert!(text.starts_with("system: be brief\n"));
        assert!(text.contains("user: Say hi.\n"));
        assert!(text.ends_with("assistant:"));
    }
}
