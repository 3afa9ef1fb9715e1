//! Retrospective reflection tests
//!
//! Full turns through the five hooks: slate injection, citation rewards,
//! batched weight updates, dimension guards, and graceful degradation.

use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use reverie_core::memory::Document;
use reverie_core::provider::{ChatMessage, LanguageModel, MessageRole, ModelOutput};
use reverie_core::sampling::sample_top_m;
use reverie_core::store::VectorStore;
use reverie_e2e_tests::harness::StoreHarness;
use reverie_e2e_tests::mocks::{MemorySessionStore, MockEmbedder, ScriptedModel};
use reverie_middleware::{MemorySession, MiddlewareError, MiddlewareOptions, ReflectiveMemory};

const DIM: usize = 32;

struct Fixture {
    _harness: StoreHarness,
    store: Arc<VectorStore>,
    sessions: Arc<MemorySessionStore>,
    model: Arc<ScriptedModel>,
    memory: ReflectiveMemory,
}

/// A middleware over a store seeded with three memories, a scripted
/// generator, and a seeded sampler
async fn fixture(responses: Vec<&str>, configure: impl FnOnce(&mut MiddlewareOptions)) -> Fixture {
    let embedder = Arc::new(MockEmbedder::new(DIM));
    let harness = StoreHarness::new(embedder.clone());
    let store = Arc::new(harness.open().await);
    store
        .add(vec![
            Document::new("User likes hiking in the mountains").with_id("mem-hiking"),
            Document::new("User owns a cat named Milo").with_id("mem-cat"),
            Document::new("User works as a data engineer").with_id("mem-work"),
        ])
        .await
        .unwrap();

    let sessions = MemorySessionStore::new();
    let model = ScriptedModel::new(responses);

    let mut options = MiddlewareOptions {
        embedder: Some(embedder),
        embedding_dimension: Some(DIM),
        top_k: 3,
        top_m: 3,
        batch_size: 4,
        seed: Some(7),
        ..MiddlewareOptions::default()
    };
    configure(&mut options);

    let memory = ReflectiveMemory::new(
        Arc::clone(&store),
        sessions.clone(),
        model.clone(),
        options,
    )
    .unwrap();

    Fixture {
        _harness: harness,
        store,
        sessions,
        model,
        memory,
    }
}

/// Drive one full turn through all five hooks
async fn run_turn(
    fixture: &Fixture,
    session: &mut MemorySession,
    user_text: &str,
    is_session_end: bool,
) -> ModelOutput {
    let messages = vec![ChatMessage::user(user_text)];
    fixture
        .memory
        .before_model(session, &messages)
        .await
        .unwrap();
    let model = Arc::clone(&fixture.model);
    let output = fixture
        .memory
        .wrap_model_call(session, messages.clone(), move |augmented| async move {
            model.generate(&augmented).await
        })
        .await
        .unwrap();
    fixture
        .memory
        .after_model(session, is_session_end)
        .await
        .unwrap();
    let turn_messages = vec![
        messages[0].clone(),
        ChatMessage::assistant(output.as_text()),
    ];
    fixture
        .memory
        .after_agent(session, &turn_messages, is_session_end)
        .await
        .unwrap();
    output
}

// ============================================================================
// SAMPLING
// ============================================================================

#[tokio::test]
async fn near_zero_temperature_always_selects_argmax() {
    let scores = vec![0.9, 0.7, 0.5, 0.3];
    for seed in 0..50 {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let result = sample_top_m(&scores, 1, 0.0001, &mut rng);
        assert_eq!(result.selected_indices, vec![0], "trial {seed}");
    }
}

// ============================================================================
// CITATION REWARDS
// ============================================================================

#[tokio::test]
async fn no_cite_marks_every_slate_memory_negative() {
    let fixture = fixture(vec!["I do not recall. [NO_CITE]"], |_| {}).await;
    let mut session = fixture.memory.session("u1");
    fixture.memory.before_agent(&mut session).await.unwrap();

    let messages = vec![ChatMessage::user("What do I like doing outdoors?")];
    fixture
        .memory
        .before_model(&mut session, &messages)
        .await
        .unwrap();
    let model = Arc::clone(&fixture.model);
    fixture
        .memory
        .wrap_model_call(&mut session, messages, move |augmented| async move {
            model.generate(&augmented).await
        })
        .await
        .unwrap();

    // All three slate memories earned -1 before the update consumed them
    let turn = session.turn().unwrap();
    let citations = &turn.citations;
    assert_eq!(citations.len(), 3);
    assert!(citations.iter().all(|c| !c.cited && c.reward == -1.0));

    fixture.memory.after_model(&mut session, false).await.unwrap();
    assert!(session.turn().is_none());

    let accumulator = session.accumulator().unwrap();
    assert_eq!(accumulator.samples.len(), 1);
    assert_eq!(accumulator.samples[0].citation_rewards, vec![-1.0, -1.0, -1.0]);
}

#[tokio::test]
async fn no_cite_over_a_larger_pool_moves_the_weights() {
    let embedder = Arc::new(MockEmbedder::new(DIM));
    let harness = StoreHarness::new(embedder.clone());
    let store = Arc::new(harness.open().await);
    store
        .add(vec![
            Document::new("User likes hiking in the mountains").with_id("m0"),
            Document::new("User owns a cat named Milo").with_id("m1"),
            Document::new("User works as a data engineer").with_id("m2"),
            Document::new("User grew up in Porto").with_id("m3"),
        ])
        .await
        .unwrap();
    let model = ScriptedModel::new(vec!["I do not recall. [NO_CITE]"]);
    let memory = ReflectiveMemory::new(
        Arc::clone(&store),
        MemorySessionStore::new(),
        model.clone(),
        MiddlewareOptions {
            embedder: Some(embedder),
            embedding_dimension: Some(DIM),
            top_k: 4,
            top_m: 2,
            batch_size: 1,
            seed: Some(7),
            ..MiddlewareOptions::default()
        },
    )
    .unwrap();

    let mut session = memory.session("u1");
    memory.before_agent(&mut session).await.unwrap();
    let initial = session.weights().unwrap().w_query.clone();

    let messages = vec![ChatMessage::user("what do you know about me?")];
    memory.before_model(&mut session, &messages).await.unwrap();
    let model_for_call = Arc::clone(&model);
    memory
        .wrap_model_call(&mut session, messages, move |augmented| async move {
            model_for_call.generate(&augmented).await
        })
        .await
        .unwrap();
    memory.after_model(&mut session, false).await.unwrap();

    // Advantage -1 - 0.5 is nonzero and the slate is a strict subset, so
    // the applied batch shifts the transform
    let weights = session.weights().unwrap();
    assert_eq!(weights.updated_batches, 1);
    assert!(!weights.w_query.approx_eq(&initial, 1e-9));
}

#[tokio::test]
async fn cited_indices_earn_positive_rewards() {
    let fixture = fixture(vec!["You like hiking and you have a cat. [0, 2]"], |_| {}).await;
    let mut session = fixture.memory.session("u1");
    fixture.memory.before_agent(&mut session).await.unwrap();

    let messages = vec![ChatMessage::user("Tell me about myself")];
    fixture
        .memory
        .before_model(&mut session, &messages)
        .await
        .unwrap();
    let model = Arc::clone(&fixture.model);
    fixture
        .memory
        .wrap_model_call(&mut session, messages, move |augmented| async move {
            model.generate(&augmented).await
        })
        .await
        .unwrap();

    let citations = &session.turn().unwrap().citations;
    assert_eq!(citations.len(), 3);
    assert!(citations[0].cited && citations[0].reward == 1.0);
    assert!(!citations[1].cited && citations[1].reward == -1.0);
    assert!(citations[2].cited && citations[2].reward == 1.0);
}

#[tokio::test]
async fn malformed_citation_contributes_no_gradient() {
    let fixture = fixture(vec!["An answer with no marker at all"], |_| {}).await;
    let mut session = fixture.memory.session("u1");
    fixture.memory.before_agent(&mut session).await.unwrap();

    run_turn(&fixture, &mut session, "anything on file?", false).await;

    let accumulator = session.accumulator().unwrap();
    assert!(accumulator.samples.is_empty());
    assert_eq!(accumulator.grad_w_query.l2_norm(), 0.0);
}

// ============================================================================
// BATCHED UPDATES
// ============================================================================

#[tokio::test]
async fn fourth_sample_applies_the_batch() {
    let fixture = fixture(
        vec![
            "Answer one. [0]",
            "Answer two. [NO_CITE]",
            "Answer three. [1, 2]",
            "Answer four. [0]",
        ],
        |_| {},
    )
    .await;
    let mut session = fixture.memory.session("u1");
    fixture.memory.before_agent(&mut session).await.unwrap();
    let initial_w_query = session.weights().unwrap().w_query.clone();

    for turn in 0..3 {
        run_turn(&fixture, &mut session, &format!("question {turn}"), false).await;
        assert_eq!(session.accumulator().unwrap().samples.len(), turn + 1);
        assert_eq!(session.weights().unwrap().updated_batches, 0);
    }

    run_turn(&fixture, &mut session, "question 3", false).await;

    let weights = session.weights().unwrap();
    assert_eq!(weights.updated_batches, 1);
    assert!(!weights.w_query.approx_eq(&initial_w_query, 1e-9));

    let accumulator = session.accumulator().unwrap();
    assert!(accumulator.samples.is_empty());
    assert_eq!(accumulator.last_batch_index, 1);
    assert!(accumulator.grad_w_query.approx_eq(
        &reverie_core::linalg::Matrix::zeros(DIM, DIM),
        0.0
    ));

    // Updated weights reached the session store
    let namespace: Vec<String> = vec!["rmm".into(), "u1".into(), "weights".into()];
    assert!(fixture.sessions.peek(&namespace, "reranker").is_some());
}

#[tokio::test]
async fn session_end_flushes_a_partial_batch() {
    let fixture = fixture(vec!["Answer. [0]"], |options| {
        options.batch_size = 10;
    })
    .await;
    let mut session = fixture.memory.session("u1");
    fixture.memory.before_agent(&mut session).await.unwrap();

    run_turn(&fixture, &mut session, "only question", true).await;

    let weights = session.weights().unwrap();
    assert_eq!(weights.updated_batches, 1);
    assert_eq!(session.accumulator().unwrap().last_batch_index, 1);
}

#[tokio::test]
async fn updated_weights_survive_into_the_next_session() {
    let fixture = fixture(vec!["Answer. [0]"], |options| {
        options.batch_size = 1;
    })
    .await;
    let mut session = fixture.memory.session("u1");
    fixture.memory.before_agent(&mut session).await.unwrap();
    run_turn(&fixture, &mut session, "question", false).await;
    assert_eq!(session.weights().unwrap().updated_batches, 1);

    let mut next = fixture.memory.session("u1");
    fixture.memory.before_agent(&mut next).await.unwrap();
    assert_eq!(next.weights().unwrap().updated_batches, 1);
}

// ============================================================================
// INJECTION
// ============================================================================

#[tokio::test]
async fn slate_is_injected_as_ephemeral_user_message() {
    let fixture = fixture(vec!["Answer. [0]"], |_| {}).await;
    let mut session = fixture.memory.session("u1");
    fixture.memory.before_agent(&mut session).await.unwrap();

    assert_eq!(fixture.store.len(), 3);
    run_turn(&fixture, &mut session, "what are my hobbies?", false).await;

    let calls = fixture.model.calls();
    assert_eq!(calls.len(), 1);
    let seen = &calls[0];
    // Original message plus exactly one injected block
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].content, "what are my hobbies?");
    assert_eq!(seen[1].role, MessageRole::User);
    assert!(seen[1].content.contains("<memories>"));
    assert!(seen[1].content.contains("Memory [0]:"));

    // The durable buffer kept the dialogue, not the injected block
    assert!(session
        .buffer()
        .messages
        .iter()
        .all(|m| !m.content.contains("<memories>")));
}

#[tokio::test]
async fn empty_store_means_clean_passthrough() {
    let embedder = Arc::new(MockEmbedder::new(DIM));
    let harness = StoreHarness::new(embedder.clone());
    let store = Arc::new(harness.open().await);
    let model = ScriptedModel::new(vec!["Nothing on file."]);
    let memory = ReflectiveMemory::new(
        Arc::clone(&store),
        MemorySessionStore::new(),
        model.clone(),
        MiddlewareOptions {
            embedder: Some(embedder),
            embedding_dimension: Some(DIM),
            seed: Some(7),
            ..MiddlewareOptions::default()
        },
    )
    .unwrap();

    let mut session = memory.session("u1");
    memory.before_agent(&mut session).await.unwrap();
    let messages = vec![ChatMessage::user("hello")];
    memory.before_model(&mut session, &messages).await.unwrap();
    let model_for_call = Arc::clone(&model);
    memory
        .wrap_model_call(&mut session, messages, move |augmented| async move {
            model_for_call.generate(&augmented).await
        })
        .await
        .unwrap();

    // No slate to inject, so the generator saw the conversation untouched
    assert_eq!(fixture_calls_len(&model, 0), 1);
}

fn fixture_calls_len(model: &Arc<ScriptedModel>, call: usize) -> usize {
    model.calls()[call].len()
}

#[tokio::test]
async fn disabled_middleware_is_a_noop() {
    let fixture = fixture(vec!["plain answer"], |options| {
        options.enabled = false;
    })
    .await;
    let mut session = fixture.memory.session("u1");
    fixture.memory.before_agent(&mut session).await.unwrap();

    run_turn(&fixture, &mut session, "anything?", true).await;

    // One call, nothing injected, nothing persisted, nothing buffered
    assert_eq!(fixture.model.calls()[0].len(), 1);
    assert!(fixture.sessions.is_empty());
    assert!(session.buffer().messages.is_empty());
    assert_eq!(session.turn_counter(), 0);
}

// ============================================================================
// DIMENSION GUARD
// ============================================================================

#[tokio::test]
async fn dimension_mismatch_is_fatal_and_names_both_sizes() {
    let store_embedder = Arc::new(MockEmbedder::new(512));
    let harness = StoreHarness::new(store_embedder.clone());
    let store = Arc::new(harness.open().await);
    let model = ScriptedModel::new(Vec::<String>::new());

    let memory = ReflectiveMemory::new(
        Arc::clone(&store),
        MemorySessionStore::new(),
        model,
        MiddlewareOptions {
            embedder: Some(Arc::new(MockEmbedder::new(512))),
            embedding_dimension: Some(1536),
            seed: Some(7),
            ..MiddlewareOptions::default()
        },
    )
    .unwrap();

    let mut session = memory.session("u1");
    memory.before_agent(&mut session).await.unwrap();

    let records_before = store.stats().records_appended;
    let err = memory
        .before_model(&mut session, &[ChatMessage::user("hi")])
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("1536"), "got: {message}");
    assert!(message.contains("512"), "got: {message}");
    assert!(matches!(err, MiddlewareError::Config(_)));

    // The store was not touched
    assert_eq!(store.stats().records_appended, records_before);
}

#[tokio::test]
async fn paired_option_misconfiguration_fails_construction() {
    let embedder = Arc::new(MockEmbedder::new(DIM));
    let harness = StoreHarness::new(embedder.clone());
    let store = Arc::new(harness.open().await);

    let err = ReflectiveMemory::new(
        Arc::clone(&store),
        MemorySessionStore::new(),
        ScriptedModel::new(Vec::<String>::new()),
        MiddlewareOptions {
            embedder: Some(embedder),
            embedding_dimension: None,
            ..MiddlewareOptions::default()
        },
    )
    .unwrap_err();
    assert_eq!(err, reverie_middleware::ConfigError::MissingDimension);

    let err = ReflectiveMemory::new(
        store,
        MemorySessionStore::new(),
        ScriptedModel::new(Vec::<String>::new()),
        MiddlewareOptions {
            embedder: None,
            embedding_dimension: Some(DIM),
            ..MiddlewareOptions::default()
        },
    )
    .unwrap_err();
    assert_eq!(err, reverie_middleware::ConfigError::MissingEmbedder);
}

#[tokio::test]
async fn oversized_slate_fails_construction() {
    let embedder = Arc::new(MockEmbedder::new(DIM));
    let harness = StoreHarness::new(embedder.clone());
    let store = Arc::new(harness.open().await);

    let err = ReflectiveMemory::new(
        store,
        MemorySessionStore::new(),
        ScriptedModel::new(Vec::<String>::new()),
        MiddlewareOptions {
            embedder: Some(embedder),
            embedding_dimension: Some(DIM),
            top_k: 5,
            top_m: 9,
            ..MiddlewareOptions::default()
        },
    )
    .unwrap_err();
    assert!(matches!(
        err,
        reverie_middleware::ConfigError::InvalidSlate { top_m: 9, top_k: 5 }
    ));
}

// ============================================================================
// DEGRADATION
// ============================================================================

#[tokio::test]
async fn flaky_session_store_never_blocks_the_turn() {
    use reverie_e2e_tests::mocks::FailingSessionStore;

    let embedder = Arc::new(MockEmbedder::new(DIM));
    let harness = StoreHarness::new(embedder.clone());
    let store = Arc::new(harness.open().await);
    store
        .add(vec![Document::new("User likes tea").with_id("m1")])
        .await
        .unwrap();
    let model = ScriptedModel::new(vec!["You like tea. [0]"]);

    let memory = ReflectiveMemory::new(
        Arc::clone(&store),
        Arc::new(FailingSessionStore),
        model.clone(),
        MiddlewareOptions {
            embedder: Some(embedder),
            embedding_dimension: Some(DIM),
            seed: Some(7),
            batch_size: 1,
            ..MiddlewareOptions::default()
        },
    )
    .unwrap();

    let mut session = memory.session("u1");
    // Loads fail soft; weights initialize in memory
    memory.before_agent(&mut session).await.unwrap();
    assert!(session.weights().is_some());

    let messages = vec![ChatMessage::user("what do I drink?")];
    memory.before_model(&mut session, &messages).await.unwrap();
    let model_for_call = Arc::clone(&model);
    let output = memory
        .wrap_model_call(&mut session, messages, move |augmented| async move {
            model_for_call.generate(&augmented).await
        })
        .await
        .unwrap();
    assert_eq!(output.as_text(), "You like tea. [0]");

    // Saves fail soft; the update still applied in memory
    memory.after_model(&mut session, false).await.unwrap();
    assert_eq!(session.weights().unwrap().updated_batches, 1);
}
