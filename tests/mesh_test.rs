//! Two-node mesh tests over localhost sockets.
//!
//! A verifier node and a drafter node run in-process on ephemeral ports.
//! The deterministic models make the output independently predictable: the
//! mesh stream must equal a pure-local run of the verifier whatever the
//! drafter contributes.

use shard::model::{DeterministicVerifier, VerifierModel};
use shard::speculative::render_prompt;
use shard::types::ChatMessage;
use shard::{CompletionRequest, MeshConfig, Node, NodeOptions, NodeRole, TerminalStatus};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn loopback(node: &Node) -> SocketAddr {
    SocketAddr::new([127, 0, 0, 1].into(), node.local_addr().port())
}

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "shard_test_{}_{}_{}",
        tag,
        std::process::id(),
        rand::random::<u32>()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn base_config(tag: &str) -> MeshConfig {
    MeshConfig {
        data_dir: temp_dir(tag),
        verification_injection_rate: 0.0,
        // Tight cadence keeps the tests quick.
        auction_interval_ms: 5,
        auction_collect_ms: 30,
        reconnect_interval_seconds: 1,
        ..Default::default()
    }
}

async fn start_verifier(tag: &str, seed: u64) -> Arc<Node> {
    Node::start(
        NodeOptions {
            config: base_config(tag),
            role: NodeRole::verifier(),
            verifier_model: format!("deterministic:{}", seed),
            drafter_model: "deterministic".into(),
        },
        0,
    )
    .await
    .unwrap()
}

async fn start_drafter(tag: &str, seed: u64, bootstrap: SocketAddr) -> Arc<Node> {
    let mut config = base_config(tag);
    config.bootstrap = vec![bootstrap];
    Node::start(
        NodeOptions {
            config,
            role: NodeRole::drafter(),
            verifier_model: "deterministic".into(),
            drafter_model: format!("deterministic:{}", seed),
        },
        0,
    )
    .await
    .unwrap()
}

async fn wait_for_peers(node: &Node, want: usize) {
    for _ in 0..100 {
        if node.registry().stats().total >= want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("peer never connected");
}

fn local_oracle(seed: u64, messages: &[ChatMessage], n: usize) -> Vec<String> {
    let model = DeterministicVerifier::with_seed(seed);
    let context = model.tokenise(&render_prompt(messages));
    model.extend(&context, n).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mesh_stream_equals_local_run_with_agreeing_drafter() {
    let verifier = start_verifier("agree_v", 42).await;
    let drafter = start_drafter("agree_d", 42, loopback(&verifier)).await;
    wait_for_peers(&verifier, 1).await;

    let messages = vec![ChatMessage::user("Once upon a time")];
    let mut request = CompletionRequest::new(messages.clone());
    request.max_tokens = 24;

    let handle = verifier.complete(request).unwrap();
    let (tokens, status) = handle.collect().await;

    assert_eq!(status, TerminalStatus::Length);
    assert_eq!(tokens, local_oracle(42, &messages, 24));

    drafter.shutdown().await;
    verifier.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mesh_stream_equals_local_run_with_diverging_drafter() {
    let verifier = start_verifier("diverge_v", 42).await;
    // A drafter on a different seed proposes garbage; corrections keep the
    // stream on the verifier's own path.
    let drafter = start_drafter("diverge_d", 1337, loopback(&verifier)).await;
    wait_for_peers(&verifier, 1).await;

    let messages = vec![ChatMessage::user("The weather today is")];
    let mut request = CompletionRequest::new(messages.clone());
    request.max_tokens = 24;

    let handle = verifier.complete(request).unwrap();
    let (tokens, status) = handle.collect().await;

    assert_eq!(status, TerminalStatus::Length);
    assert_eq!(tokens, local_oracle(42, &messages, 24));

    drafter.shutdown().await;
    verifier.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn injected_verification_prompts_build_reputation_for_honest_drafter() {
    let mut config = base_config("inject_v");
    // Every auction round carries a verification prompt.
    config.verification_injection_rate = 1.0;
    let verifier = Node::start(
        NodeOptions {
            config,
            role: NodeRole::verifier(),
            verifier_model: "deterministic:42".into(),
            drafter_model: "deterministic".into(),
        },
        0,
    )
    .await
    .unwrap();
    let drafter = start_drafter("inject_d", 42, loopback(&verifier)).await;
    wait_for_peers(&verifier, 1).await;

    let mut request = CompletionRequest::new(vec![ChatMessage::user("Tell me a story")]);
    request.max_tokens = 40;
    let handle = verifier.complete(request).unwrap();
    let (tokens, status) = handle.collect().await;
    assert_eq!(status, TerminalStatus::Length);
    assert_eq!(tokens.len(), 40);

    // The honest drafter answers from its catalog; every graded attempt is
    // correct and nobody gets banned.
    let scout = drafter.self_id();
    let mut graded = None;
    for _ in 0..100 {
        if let Some(record) = verifier.ledger().get(&scout).unwrap() {
            if record.attempts > 0 {
                graded = Some(record);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let record = graded.expect("no verification attempt was ever graded");
    assert_eq!(record.correct, record.attempts);
    assert!(!verifier.ledger().is_banned(&scout));

    drafter.shutdown().await;
    verifier.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn drafter_worker_stays_silent_when_colocated() {
    // The drafter's co-location probe points at a live local listener with a
    // threshold no loopback connect can miss, so the worker must recuse
    // itself and never publish a result.
    let verifier = start_verifier("coloc_v", 42).await;

    let mut config = base_config("coloc_d");
    config.bootstrap = vec![loopback(&verifier)];
    config.verifier_endpoint = Some(loopback(&verifier));
    config.colocation_probe_ms = 1000;
    let drafter = Node::start(
        NodeOptions {
            config,
            role: NodeRole::drafter(),
            verifier_model: "deterministic".into(),
            drafter_model: "deterministic:42".into(),
        },
        0,
    )
    .await
    .unwrap();
    wait_for_peers(&verifier, 1).await;
    // Let the probe settle on its verdict before any work arrives.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let messages = vec![ChatMessage::user("Quiet please")];
    let mut request = CompletionRequest::new(messages.clone());
    request.max_tokens = 12;
    let handle = verifier.complete(request).unwrap();
    let (tokens, _status) = handle.collect().await;

    // Generation is unaffected; it just ran purely locally.
    assert_eq!(tokens, local_oracle(42, &messages, 12));
    // And the recused drafter never graded or drafted anything.
    assert!(verifier.ledger().get(&drafter.self_id()).unwrap().is_none());

    drafter.shutdown().await;
    verifier.shutdown().await;
}
