//! Compaction scenarios

mod common;

use common::{build_harness_with, harness_config, MockStep};
use switchboard::context::estimate_tokens;
use switchboard::session::transcript::TranscriptKind;
use switchboard::tools::ToolRegistry;

/// S5: a transcript prefilled past 1.25x the window gets compacted before
/// the model call; the estimate drops below the threshold and the last
/// user/assistant turns survive verbatim.
#[tokio::test]
async fn oversized_transcript_compacts_before_the_call() {
    let mut config = harness_config(&["p1"]);
    config.limits.context_window_tokens = 4000;
    let harness = build_harness_with(
        Vec::new(),
        &["p1"],
        config,
        ToolRegistry::with_builtins(),
    )
    .await;
    let key = harness.session_key("u1");

    // Prefill well past the 1.2x trigger (tokens ≈ chars / 4)
    harness.sessions.get_or_create(&key).unwrap();
    let filler = "alpha beta gamma delta epsilon ".repeat(32);
    {
        let mut transcript = harness.sessions.open_transcript(&key).unwrap();
        for i in 0..12 {
            transcript
                .append(TranscriptKind::UserMessage {
                    text: format!("{filler} question {i}"),
                    from: None,
                    attachments: Vec::new(),
                })
                .unwrap();
            transcript
                .append(TranscriptKind::AssistantMessage {
                    text: format!("{filler} answer {i}"),
                })
                .unwrap();
        }
    }
    let before = estimate_tokens(&harness.sessions.read_transcript(&key).unwrap());
    assert!(before as f64 >= 4000.0 * 1.2, "prefill too small: {before}");

    harness
        .scheduler
        .enqueue(&key, harness.dm_envelope("u1", "trigger"))
        .unwrap();
    harness.wait_idle(&key).await;

    let events = harness.sessions.read_transcript(&key).unwrap();
    let after = estimate_tokens(&events);
    assert!(after < before, "estimate did not drop: {before} -> {after}");
    assert!(
        (after as f64) < 4000.0 * 1.2,
        "estimate still above the trigger: {after}"
    );

    // Markers replaced the head
    assert!(events
        .iter()
        .any(|e| matches!(e.kind, TranscriptKind::CompactionMarker { .. })));

    // The last assistant turn and the last user turn survived verbatim
    let texts: Vec<&str> = events
        .iter()
        .filter_map(|e| match &e.kind {
            TranscriptKind::UserMessage { text, .. }
            | TranscriptKind::AssistantMessage { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert!(texts.iter().any(|t| t.ends_with("answer 11")));
    assert!(texts.iter().any(|t| *t == "trigger"));

    // Sequence numbers stay strictly ordered after the rewrite
    switchboard::session::transcript::check_order(&events).unwrap();
}

/// Below the threshold nothing is compacted.
#[tokio::test]
async fn small_transcript_is_left_alone() {
    let harness = build_harness_with(
        Vec::new(),
        &["p1"],
        harness_config(&["p1"]),
        ToolRegistry::with_builtins(),
    )
    .await;
    let key = harness.session_key("u1");

    harness
        .scheduler
        .enqueue(&key, harness.dm_envelope("u1", "small talk"))
        .unwrap();
    harness.wait_idle(&key).await;

    let events = harness.sessions.read_transcript(&key).unwrap();
    assert!(!events
        .iter()
        .any(|e| matches!(e.kind, TranscriptKind::CompactionMarker { .. })));
}
