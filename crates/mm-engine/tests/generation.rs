mod common;

use common::*;
use mm_engine::{EngineError, GenerationConfig, Session, SessionState, StopReason};

fn session(runtime: ScriptedRuntime, config: GenerationConfig) -> Session<ScriptedRuntime> {
    Session::new(runtime, config)
}

#[test]
fn test_max_length_stops_session() {
    let runtime = ScriptedRuntime::new(64, &[HELLO, SPACE, WORLD, SPACE, HELLO]);
    let mut s = session(runtime, GenerationConfig::default().with_max_length(5));

    assert_eq!(s.prefill_text("Hello").unwrap(), 2);
    assert_eq!(*s.state(), SessionState::Prefilled);

    let mut chunks = Vec::new();
    for _ in 0..5 {
        chunks.push(s.step().unwrap().unwrap());
    }
    assert_eq!(chunks, vec!["Hello", " ", "world", " ", "Hello"]);
    assert_eq!(s.generated_text(), "Hello world Hello");
    assert_eq!(s.n_generated(), 5);
    assert_eq!(*s.state(), SessionState::Stopped(StopReason::MaxLength));

    let err = s.step().unwrap_err();
    assert!(matches!(
        err,
        EngineError::SessionState {
            operation: "step",
            state: SessionState::Stopped(StopReason::MaxLength)
        }
    ));

    // Prefill plus one forward per step after the first.
    let rt = s.runtime();
    assert_eq!(rt.forward_calls, 5);
    let step_positions: Vec<usize> = rt.batches[1..].iter().map(|b| b.positions()[0]).collect();
    assert_eq!(step_positions, vec![2, 3, 4, 5]);
    assert_eq!(s.n_past(), 6);
}

#[test]
fn test_single_step_batches_feed_previous_token() {
    let runtime = ScriptedRuntime::new(64, &[HELLO, WORLD, SPACE]);
    let mut s = session(runtime, GenerationConfig::default().with_max_length(3));
    s.prefill_text("Hello").unwrap();
    for _ in 0..3 {
        s.step().unwrap();
    }
    let rt = s.runtime();
    let fed: Vec<_> = rt.batches[1..]
        .iter()
        .map(|b| {
            assert_eq!(b.len(), 1);
            assert!(b.wants_logits(0));
            b.tokens().unwrap()[0]
        })
        .collect();
    assert_eq!(fed, vec![HELLO, WORLD]);
}

#[test]
fn test_decode_failure_is_fatal_until_reset() {
    let runtime = ScriptedRuntime::new(64, &[HELLO, SPACE, WORLD]).failing_on(3);
    let mut s = session(runtime, GenerationConfig::default());
    s.prefill_text("Hello").unwrap();

    assert_eq!(s.step().unwrap(), Some("Hello".to_string()));
    assert_eq!(s.step().unwrap(), Some(" ".to_string()));
    let err = s.step().unwrap_err();
    assert!(matches!(
        err,
        EngineError::DecodeFailure {
            seq_id: 0,
            position: 3,
            ..
        }
    ));
    assert_eq!(*s.state(), SessionState::Stopped(StopReason::DecodeFailure));
    // The failed slot never counted.
    assert_eq!(s.n_past(), 3);

    assert!(matches!(s.step(), Err(EngineError::SessionState { .. })));
    assert!(matches!(s.step(), Err(EngineError::SessionState { .. })));

    s.reset();
    assert_eq!(*s.state(), SessionState::Idle);
    assert_eq!(s.n_past(), 0);
    assert_eq!(s.generated_text(), "");
    assert_eq!(s.runtime().cleared, vec![0, 0]);

    s.prefill_text("Hello").unwrap();
    assert_eq!(s.runtime().batches.last().unwrap().positions(), &[0, 1]);
    assert!(s.step().unwrap().is_some());
}

#[test]
fn test_missing_logits_is_decode_failure() {
    let mut runtime = ScriptedRuntime::new(64, &[]);
    runtime.drop_outputs = true;
    let mut s = session(runtime, GenerationConfig::default());
    let err = s.prefill_text("Hello").unwrap_err();
    assert!(matches!(err, EngineError::DecodeFailure { position: 0, .. }));
    assert_eq!(*s.state(), SessionState::Stopped(StopReason::DecodeFailure));
    assert_eq!(s.n_past(), 0);
}

#[test]
fn test_capacity_exceeded_mid_generation() {
    let runtime = ScriptedRuntime::new(4, &[HELLO, WORLD]);
    let mut s = session(runtime, GenerationConfig::default());
    assert_eq!(s.prefill_text("Hello world").unwrap(), 4);
    assert_eq!(s.n_past(), 4);

    // The first token comes from the prefill logits; the second needs a slot.
    assert!(s.step().unwrap().is_some());
    let err = s.step().unwrap_err();
    assert!(matches!(
        err,
        EngineError::CapacityExceeded {
            seq_id: 0,
            n_past: 4,
            n_slots: 1,
            n_ctx: 4
        }
    ));
    assert_eq!(*s.state(), SessionState::Stopped(StopReason::CapacityExceeded));
    assert_eq!(s.n_past(), 4);
    assert_eq!(s.runtime().forward_calls, 1);
}

#[test]
fn test_prompt_larger_than_context() {
    let runtime = ScriptedRuntime::new(2, &[]);
    let mut s = session(runtime, GenerationConfig::default());
    let err = s.prefill_text("Hello world").unwrap_err();
    assert!(matches!(err, EngineError::CapacityExceeded { n_slots: 4, .. }));
    assert_eq!(*s.state(), SessionState::Stopped(StopReason::CapacityExceeded));
    assert_eq!(s.runtime().forward_calls, 0);
}

#[test]
fn test_chunked_text_prefill() {
    let runtime = ScriptedRuntime::new(64, &[HELLO]);
    let mut s = session(runtime, GenerationConfig::default().with_n_batch(3));
    assert_eq!(s.prefill_text("Hello world").unwrap(), 4);

    let rt = s.runtime();
    assert_eq!(rt.batches.len(), 2);
    assert_eq!(rt.batches[0].tokens().unwrap(), &[BOS, HELLO, SPACE]);
    assert_eq!(rt.batches[0].n_outputs(), 0);
    assert_eq!(rt.batches[1].tokens().unwrap(), &[WORLD]);
    assert_eq!(rt.batches[1].positions(), &[3]);
    assert!(rt.batches[1].wants_logits(0));
    assert_eq!(s.n_past(), 4);
    assert_eq!(s.step().unwrap(), Some("Hello".to_string()));
}

#[test]
fn test_end_of_generation() {
    let runtime = ScriptedRuntime::new(64, &[HELLO, EOS]);
    let mut s = session(runtime, GenerationConfig::default());
    s.prefill_text("Hello").unwrap();
    assert_eq!(s.step().unwrap(), Some("Hello".to_string()));
    assert_eq!(s.step().unwrap(), None);
    assert_eq!(s.stop_reason(), Some(&StopReason::EndOfGeneration));
    assert_eq!(s.n_generated(), 1);
    assert!(s.step().is_err());
}

#[test]
fn test_end_of_turn_token_ends_generation() {
    let runtime = ScriptedRuntime::new(64, &[IM_END]);
    let mut s = session(runtime, GenerationConfig::default());
    s.prefill_text("Hello").unwrap();
    assert_eq!(s.step().unwrap(), None);
    assert_eq!(s.stop_reason(), Some(&StopReason::EndOfGeneration));
    assert_eq!(s.generated_text(), "");
}

#[test]
fn test_stop_string_across_tokens() {
    let runtime = ScriptedRuntime::new(64, &[HELLO, HASH, HASH2, WORLD]);
    let config = GenerationConfig::default().with_stop_strings(["###"]);
    let mut s = session(runtime, config);
    s.prefill_text("Hello").unwrap();

    assert_eq!(s.step().unwrap(), Some("Hello".to_string()));
    assert_eq!(s.step().unwrap(), Some("#".to_string()));
    assert_eq!(*s.state(), SessionState::Generating);
    assert_eq!(s.step().unwrap(), Some("##".to_string()));
    assert_eq!(
        *s.state(),
        SessionState::Stopped(StopReason::StopString("###".to_string()))
    );
    assert_eq!(s.generated_text(), "Hello###");
    assert!(s.step().is_err());
}

#[test]
fn test_multibyte_character_streams_whole() {
    let runtime = ScriptedRuntime::new(64, &[BYTE_E4, BYTE_BD, BYTE_A0, HELLO]);
    let mut s = session(runtime, GenerationConfig::default().with_max_length(4));
    s.prefill_text("Hello").unwrap();

    let chunks: Vec<String> = (0..4).map(|_| s.step().unwrap().unwrap()).collect();
    assert_eq!(chunks, vec!["", "", "你", "Hello"]);
    assert_eq!(s.generated_text(), "你Hello");
    assert_eq!(s.n_generated(), 4);
}

#[test]
fn test_malformed_stream_is_fatal() {
    let runtime = ScriptedRuntime::new(64, &[BYTE_80; 5]);
    let mut s = session(runtime, GenerationConfig::default());
    s.prefill_text("Hello").unwrap();
    for _ in 0..4 {
        assert_eq!(s.step().unwrap(), Some(String::new()));
    }
    let err = s.step().unwrap_err();
    assert!(matches!(
        err,
        EngineError::MalformedTokenStream {
            token_id: BYTE_80,
            pending: 5
        }
    ));
    assert_eq!(
        *s.state(),
        SessionState::Stopped(StopReason::MalformedTokenStream)
    );
}

#[test]
fn test_pending_bytes_dropped_at_stop() {
    let runtime = ScriptedRuntime::new(64, &[HELLO, BYTE_E4]);
    let mut s = session(runtime, GenerationConfig::default().with_max_length(2));
    s.prefill_text("Hello").unwrap();
    assert_eq!(s.step().unwrap(), Some("Hello".to_string()));
    assert_eq!(s.step().unwrap(), Some(String::new()));
    assert_eq!(*s.state(), SessionState::Stopped(StopReason::MaxLength));
    assert_eq!(s.generated_text(), "Hello");
}

#[test]
fn test_zero_max_length() {
    let runtime = ScriptedRuntime::new(64, &[HELLO]);
    let mut s = session(runtime, GenerationConfig::default().with_max_length(0));
    s.prefill_text("Hello").unwrap();
    assert_eq!(s.step().unwrap(), None);
    assert_eq!(s.stop_reason(), Some(&StopReason::MaxLength));
}

#[test]
fn test_state_guards() {
    let runtime = ScriptedRuntime::new(64, &[HELLO]);
    let mut s = session(runtime, GenerationConfig::default());

    assert!(matches!(
        s.step(),
        Err(EngineError::SessionState {
            state: SessionState::Idle,
            ..
        })
    ));

    s.prefill_text("Hello").unwrap();
    assert!(matches!(
        s.prefill_text("Hello"),
        Err(EngineError::SessionState {
            operation: "prefill_text",
            state: SessionState::Prefilled
        })
    ));
}

#[test]
fn test_empty_prompt_still_has_bos() {
    // BOS is always added, so an empty prompt still prefills one token.
    let runtime = ScriptedRuntime::new(64, &[HELLO]);
    let mut s = session(runtime, GenerationConfig::default());
    assert_eq!(s.prefill_text("").unwrap(), 1);
}

#[test]
fn test_reset_mid_generation_and_end() {
    let runtime = ScriptedRuntime::new(64, &[HELLO, SPACE, WORLD, HELLO]);
    let mut s = session(runtime, GenerationConfig::default().with_seq_id(7));
    s.prefill_text("Hello world").unwrap();
    s.step().unwrap();
    s.step().unwrap();
    assert_eq!(*s.state(), SessionState::Generating);

    s.reset();
    assert_eq!(*s.state(), SessionState::Idle);
    assert_eq!(s.n_generated(), 0);
    s.prefill_text("Hello").unwrap();
    assert_eq!(s.runtime().batches.last().unwrap().seq_ids(0), &[7]);

    let runtime = s.end();
    assert_eq!(runtime.cleared, vec![7, 7, 7]);
}
