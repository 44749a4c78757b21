mod common;

use common::*;
use mm_engine::{
    EngineError, GenerationConfig, ImageEmbed, ImageStride, Session, SessionState, StopReason,
};
use base64::prelude::*;
use mm_engine::prompt::{IMG_BASE64_TAG_BEGIN, IMG_BASE64_TAG_END};
use mm_model::{
    write_embed_block, EmbedDType, ImageEncoder, ImageSource, ModelError, PrecomputedEmbeds,
};

fn image(n_positions: usize) -> ImageEmbed {
    ImageEmbed::new(vec![-0.5; n_positions * N_EMBD], n_positions, N_EMBD).unwrap()
}

#[test]
fn test_multimodal_prefill_layout() {
    let runtime = ScriptedRuntime::new(2048, &[HELLO, WORLD]);
    let mut s = Session::new(runtime, GenerationConfig::default());

    let n_eval = s.prefill_multimodal("Hello", &image(64), "world").unwrap();
    // BOS + Hello, 64 image positions, world.
    assert_eq!(n_eval, 67);
    assert_eq!(s.n_past(), 67);
    assert_eq!(*s.state(), SessionState::Prefilled);

    let rt = s.runtime();
    assert_eq!(rt.batches.len(), 1);
    let batch = &rt.batches[0];
    assert_eq!(batch.len(), 67);
    assert_eq!(batch.positions(), (0..67).collect::<Vec<_>>().as_slice());
    assert_eq!(batch.n_outputs(), 1);
    assert!(batch.wants_logits(66));

    let (data, dim) = batch.embeddings().unwrap();
    assert_eq!(dim, N_EMBD);
    assert_eq!(data.len(), 67 * N_EMBD);
    assert_eq!(batch.slot_embedding(0).unwrap(), &[BOS as f32; N_EMBD]);
    assert_eq!(batch.slot_embedding(1).unwrap(), &[HELLO as f32; N_EMBD]);
    assert_eq!(batch.slot_embedding(2).unwrap(), &[-0.5; N_EMBD]);
    assert_eq!(batch.slot_embedding(65).unwrap(), &[-0.5; N_EMBD]);
    assert_eq!(batch.slot_embedding(66).unwrap(), &[WORLD as f32; N_EMBD]);

    let layout = batch.image_layout().unwrap();
    assert_eq!(layout.start, 2);
    assert_eq!(layout.n_positions, 64);
    assert_eq!(layout.step, 2);

    assert_eq!(s.step().unwrap(), Some("Hello".to_string()));
    assert_eq!(s.step().unwrap(), Some("world".to_string()));
    let last = s.runtime().batches.last().unwrap();
    assert_eq!(last.positions(), &[67]);
    assert_eq!(last.tokens().unwrap(), &[HELLO]);
}

#[test]
fn test_default_stride_rejects_small_block() {
    let runtime = ScriptedRuntime::new(2048, &[]);
    let mut s = Session::new(runtime, GenerationConfig::default());
    let err = s.prefill_multimodal("Hello", &image(16), "world").unwrap_err();
    assert!(matches!(err, EngineError::DimensionMismatch { .. }));
    // Nothing reached the model; the session can still be prefilled.
    assert_eq!(*s.state(), SessionState::Idle);
    assert_eq!(s.runtime().forward_calls, 0);
}

#[test]
fn test_explicit_stride() {
    let runtime = ScriptedRuntime::new(2048, &[HELLO]);
    let config = GenerationConfig::default().with_image_stride(ImageStride::Explicit(4));
    let mut s = Session::new(runtime, config);
    assert_eq!(s.prefill_multimodal("Hello", &image(16), "world").unwrap(), 19);
    assert_eq!(s.runtime().batches[0].image_token_step(), Some(4));
}

#[test]
fn test_image_width_mismatch() {
    let runtime = ScriptedRuntime::new(2048, &[]);
    let config = GenerationConfig::default().with_image_stride(ImageStride::Explicit(1));
    let mut s = Session::new(runtime, config);
    let wide = ImageEmbed::new(vec![0.0; 2 * 8], 2, 8).unwrap();
    let err = s.prefill_multimodal("Hello", &wide, "world").unwrap_err();
    assert!(matches!(
        err,
        EngineError::DimensionMismatch {
            expected: 4,
            got: 8,
            ..
        }
    ));
}

#[test]
fn test_fused_prompt_over_capacity() {
    let runtime = ScriptedRuntime::new(32, &[]);
    let mut s = Session::new(runtime, GenerationConfig::default());
    let err = s.prefill_multimodal("Hello", &image(64), "world").unwrap_err();
    assert!(matches!(
        err,
        EngineError::CapacityExceeded {
            n_slots: 67,
            n_ctx: 32,
            ..
        }
    ));
    assert_eq!(*s.state(), SessionState::Stopped(StopReason::CapacityExceeded));
    assert_eq!(s.runtime().forward_calls, 0);
}

#[test]
fn test_prefill_failure_is_fatal() {
    let runtime = ScriptedRuntime::new(2048, &[]).failing_on(1);
    let mut s = Session::new(runtime, GenerationConfig::default());
    let err = s.prefill_multimodal("Hello", &image(32), "world").unwrap_err();
    assert!(matches!(err, EngineError::DecodeFailure { position: 0, .. }));
    assert_eq!(*s.state(), SessionState::Stopped(StopReason::DecodeFailure));
    assert!(matches!(
        s.prefill_multimodal("Hello", &image(32), "world"),
        Err(EngineError::SessionState { .. })
    ));
}

#[test]
fn test_chat_prompt_with_placeholder() {
    let runtime = ScriptedRuntime::new(2048, &[HELLO]);
    let config = GenerationConfig::default().with_image_stride(ImageStride::Explicit(1));
    let mut s = Session::new(runtime, config);
    // "Hello" before the image gets BOS, "world" after it does not.
    assert_eq!(s.prefill_chat("Hello<image>world", &image(3)).unwrap(), 6);
    let batch = &s.runtime().batches[0];
    assert_eq!(batch.slot_embedding(5).unwrap(), &[WORLD as f32; N_EMBD]);
}

#[test]
fn test_precomputed_embeds_feed_session() {
    let block = write_embed_block(&image(32), EmbedDType::F16);
    let embed = PrecomputedEmbeds
        .embed_image(ImageSource::Bytes(&block))
        .unwrap();
    assert_eq!(embed.n_positions(), 32);

    let runtime = ScriptedRuntime::new(2048, &[WORLD, EOS]);
    let mut s = Session::new(runtime, GenerationConfig::default());
    assert_eq!(s.prefill_multimodal("Hello", &embed, "world").unwrap(), 35);
    assert_eq!(s.step().unwrap(), Some("world".to_string()));
    assert_eq!(s.step().unwrap(), None);
    assert_eq!(s.stop_reason(), Some(&StopReason::EndOfGeneration));
}

fn inline_tag(bytes: &[u8]) -> String {
    format!(
        "{}{}{}",
        IMG_BASE64_TAG_BEGIN,
        BASE64_STANDARD.encode(bytes),
        IMG_BASE64_TAG_END
    )
}

#[test]
fn test_inline_image_prompt() {
    let block = write_embed_block(&image(3), EmbedDType::F32);
    let prompt = format!("Hello{}<image>world", inline_tag(&block));

    let runtime = ScriptedRuntime::new(2048, &[HELLO]);
    let config = GenerationConfig::default().with_image_stride(ImageStride::Explicit(1));
    let mut s = Session::new(runtime, config);
    assert_eq!(s.prefill_inline_image(&prompt, &PrecomputedEmbeds).unwrap(), 6);

    let batch = &s.runtime().batches[0];
    assert_eq!(batch.slot_embedding(1).unwrap(), &[HELLO as f32; N_EMBD]);
    assert_eq!(batch.slot_embedding(2).unwrap(), &[-0.5; N_EMBD]);
    assert_eq!(batch.slot_embedding(5).unwrap(), &[WORLD as f32; N_EMBD]);
    assert_eq!(s.step().unwrap(), Some("Hello".to_string()));
}

#[test]
fn test_inline_image_errors_leave_session_idle() {
    let runtime = ScriptedRuntime::new(2048, &[]);
    let mut s = Session::new(runtime, GenerationConfig::default());

    let err = s.prefill_inline_image("Hello<image>world", &PrecomputedEmbeds).unwrap_err();
    assert!(matches!(err, EngineError::InvalidImageTag { .. }));

    let unterminated = format!("Hello{}aGVsbG8=", IMG_BASE64_TAG_BEGIN);
    let err = s.prefill_inline_image(&unterminated, &PrecomputedEmbeds).unwrap_err();
    assert!(matches!(err, EngineError::InvalidImageTag { .. }));

    // Valid base64, but not an embedding block.
    let jpeg = format!("Hello{}world", inline_tag(&[0xFF, 0xD8, 0xFF, 0xE0]));
    let err = s.prefill_inline_image(&jpeg, &PrecomputedEmbeds).unwrap_err();
    assert!(matches!(err, EngineError::Model(ModelError::InvalidMagic(_))));

    assert_eq!(*s.state(), SessionState::Idle);
    assert_eq!(s.runtime().forward_calls, 0);
}
