//! End-to-end pipeline scenarios: ingress → raw store → CDC → derived state.

use std::time::Duration;

use tracepipe_engine::acceptance_rate;
use tracepipe_store::{Bucket, MetricKey, Scope};
use tracepipe_streams::streams;
use tracepipe_testing::{EventFixture, PipelineWorld, wait_until};
use tracepipe_types::{Acceptance, SessionStatus, Stage};

const SETTLE: Duration = Duration::from_secs(5);

fn tokens_total(world: &PipelineWorld, session: &str) -> i64 {
    let metrics = world.pipeline.metrics();
    let store = metrics.lock().unwrap();
    store
        .counter(&MetricKey::new(
            Scope::Session,
            "tokens_total",
            &[("session", session)],
            Bucket::all(),
        ))
        .unwrap()
}

fn turn_count(world: &PipelineWorld, key: &str) -> usize {
    let conversations = world.pipeline.conversations();
    let store = conversations.lock().unwrap();
    store.turns(key).unwrap().len()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_three_events() {
    let world = PipelineWorld::new();
    let mut fx = EventFixture::new("s-1");

    world.pipeline.publish(&fx.session_start()).unwrap();
    world.pipeline.publish(&fx.user_prompt(12)).unwrap();
    world.pipeline.publish(&fx.assistant_response(30, 800)).unwrap();

    let running = world.start();
    let key = fx.session_key();

    let settled = wait_until(SETTLE, || {
        world.pipeline.counters().records_processed >= 3
    })
    .await;
    assert!(settled, "pipeline did not process 3 records in time");
    running.stop().await;

    // One raw batch holding all three events, in order
    let raw = world.pipeline.raw();
    let raw = raw.lock().unwrap();
    assert_eq!(raw.batch_count().unwrap(), 1);
    let events = raw.read(raw.last_batch_id().unwrap().unwrap()).unwrap();
    assert_eq!(events.len(), 3);
    drop(raw);

    assert_eq!(world.cdc_len(), 3);

    let conversations = world.pipeline.conversations();
    let store = conversations.lock().unwrap();
    let session = store.session(&key).unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Open);

    let turns = store.turns(&key).unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].accepted, Acceptance::Unknown);
    assert!(turns[0].completed_at.is_some());
    drop(store);

    assert_eq!(tokens_total(&world, "s-1"), 30);

    // Invariant 4: events_total matches the records processed
    let metrics = world.pipeline.metrics();
    let store = metrics.lock().unwrap();
    assert_eq!(store.counter_sum("events_total").unwrap(), 3);
    drop(store);

    // Chain of custody is intact
    let health = world.pipeline.health().unwrap();
    assert_eq!(health.ingress_enqueued, 3);
    assert_eq!(health.raw_persisted, 3);
    assert!(!health.chain_broken);

    let counters = world.pipeline.counters();
    assert_eq!(counters.events_read, 3);
    assert_eq!(counters.batches_committed, 1);
    assert_eq!(counters.cdc_published, 3);
    assert_eq!(counters.dlq_total, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_suggestion_marks_turn() {
    let world = PipelineWorld::new();
    let mut fx = EventFixture::new("s-1");

    world.pipeline.publish(&fx.user_prompt(5)).unwrap();
    world.pipeline.publish(&fx.assistant_response(10, 300)).unwrap();
    world.pipeline.publish(&fx.file_edit("rejected")).unwrap();

    let running = world.start();
    let key = fx.session_key();

    let settled = wait_until(SETTLE, || {
        world.pipeline.counters().records_processed >= 3
    })
    .await;
    assert!(settled);
    running.stop().await;

    let conversations = world.pipeline.conversations();
    let store = conversations.lock().unwrap();
    let turns = store.turns(&key).unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].accepted, Acceptance::Rejected);
    drop(store);

    let metrics = world.pipeline.metrics();
    let store = metrics.lock().unwrap();
    let rate = acceptance_rate(&store, Scope::Session, &[("session", "s-1")])
        .unwrap()
        .unwrap();
    assert_eq!(rate, 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_delivery_counts_once() {
    let world = PipelineWorld::new();
    let mut fx = EventFixture::new("s-1");

    let events = vec![
        fx.session_start(),
        fx.user_prompt(12),
        fx.assistant_response(30, 800),
    ];

    let running = world.start();
    let key = fx.session_key();

    for event in &events {
        world.pipeline.publish(event).unwrap();
    }
    assert!(
        wait_until(SETTLE, || world.pipeline.counters().records_processed >= 3).await,
        "first batch did not commit"
    );
    let batches_first_round = world.pipeline.counters().batches_committed;

    // Same three events again, identical event_ids
    for event in &events {
        world.pipeline.publish(event).unwrap();
    }
    assert!(
        wait_until(SETTLE, || {
            world.pipeline.counters().records_processed >= 6
        })
        .await,
        "duplicate batch did not process"
    );
    running.stop().await;

    // Fast path does not deduplicate: the duplicates were committed again
    let raw = world.pipeline.raw();
    let raw = raw.lock().unwrap();
    assert!(raw.batch_count().unwrap() > batches_first_round);
    let mut persisted = 0;
    for batch_id in 1..=raw.last_batch_id().unwrap().unwrap() {
        persisted += raw.meta(batch_id).unwrap().unwrap().event_count;
    }
    assert_eq!(persisted, 6);
    drop(raw);

    // Derived state does: one session, one turn, tokens counted once
    let conversations = world.pipeline.conversations();
    assert_eq!(conversations.lock().unwrap().session_count().unwrap(), 1);
    assert_eq!(turn_count(&world, &key), 1);
    assert_eq!(tokens_total(&world, "s-1"), 30);

    let metrics = world.pipeline.metrics();
    assert_eq!(metrics.lock().unwrap().counter_sum("events_total").unwrap(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poison_event_reaches_dlq() {
    // r_max = 1: the first failed delivery deadletters immediately
    let world = PipelineWorld::with_config(|config| config.fast_path.r_max = 1);
    let mut fx = EventFixture::new("s-1");

    world.pipeline.publish(&fx.poison()).unwrap();
    world.pipeline.publish(&fx.user_prompt(7)).unwrap();

    let running = world.start();

    let settled = wait_until(SETTLE, || world.pipeline.counters().dlq_total >= 1).await;
    assert!(settled, "poison event never reached the dlq");
    assert!(
        wait_until(SETTLE, || world.pipeline.counters().records_processed >= 1).await,
        "healthy event stalled behind poison"
    );
    running.stop().await;

    let dlq = world.dlq_records();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].stage, Stage::FastPath);
    assert_eq!(dlq[0].error_kind, "schema");

    // Poison entry was acknowledged; the group made progress
    assert_eq!(world.ingress_pending(), 0);

    // cc_ingress_enqueued == cc_raw_persisted + cc_dlq_total{fast_path}
    let health = world.pipeline.health().unwrap();
    assert_eq!(health.ingress_enqueued, 2);
    assert_eq!(health.raw_persisted, 1);
    assert_eq!(health.dlq_fast_path, 1);
    assert!(!health.chain_broken);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn poison_event_retries_before_deadletter() {
    let world = PipelineWorld::with_config(|config| config.fast_path.r_max = 2);
    let mut fx = EventFixture::new("s-1");

    world.pipeline.publish(&fx.poison()).unwrap();
    let running = world.start();

    // First delivery leaves the entry pending rather than deadlettering
    assert!(
        wait_until(SETTLE, || world.pipeline.counters().events_read >= 1).await
    );
    assert_eq!(world.pipeline.counters().dlq_total, 0);
    assert_eq!(world.ingress_pending(), 1);

    // Second delivery arrives via pending-entry recovery, then deadletters
    let settled = wait_until(SETTLE, || world.pipeline.counters().dlq_total >= 1).await;
    assert!(settled, "poison entry was never reclaimed and deadlettered");
    running.stop().await;

    assert_eq!(world.ingress_pending(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cdc_redelivery_is_idempotent() {
    let world = PipelineWorld::new();
    let mut fx = EventFixture::new("s-1");

    world.pipeline.publish(&fx.user_prompt(5)).unwrap();
    world.pipeline.publish(&fx.assistant_response(20, 100)).unwrap();

    let running = world.start();
    let key = fx.session_key();

    assert!(
        wait_until(SETTLE, || world.pipeline.counters().records_processed >= 2).await
    );

    // Re-append the already-processed CDC records verbatim
    let bodies: Vec<String> = {
        let streams_db = world.pipeline.streams();
        let db = streams_db.lock().unwrap();
        db.scan(streams::CDC)
            .unwrap()
            .into_iter()
            .map(|e| e.body)
            .collect()
    };
    {
        let streams_db = world.pipeline.streams();
        let mut db = streams_db.lock().unwrap();
        for body in &bodies {
            db.append(streams::CDC, body, None).unwrap();
        }
    }

    assert!(
        wait_until(SETTLE, || {
            world.pipeline.counters().records_processed >= 4
        })
        .await,
        "redelivered records were not consumed"
    );
    running.stop().await;

    // Invariant 2: no change in conversations or metrics
    assert_eq!(turn_count(&world, &key), 1);
    assert_eq!(tokens_total(&world, "s-1"), 20);

    let metrics = world.pipeline.metrics();
    assert_eq!(metrics.lock().unwrap().counter_sum("events_total").unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unacked_batch_is_reclaimed() {
    let world = PipelineWorld::new();
    let mut fx = EventFixture::new("s-1");

    let events = vec![fx.user_prompt(3), fx.assistant_response(30, 50)];

    // A consumer in the fast-path group read the entries, persisted them,
    // and died before acknowledging
    for event in &events {
        world.pipeline.publish(event).unwrap();
    }
    {
        let raw = world.pipeline.raw();
        raw.lock().unwrap().append(&events).unwrap();
    }
    {
        let streams_db = world.pipeline.streams();
        let mut db = streams_db.lock().unwrap();
        let delivered = db
            .read_group(
                streams::INGRESS,
                tracepipe_runtime::FAST_PATH_GROUP,
                "dead-consumer",
                10,
            )
            .unwrap();
        assert_eq!(delivered.len(), 2);
    }

    let running = world.start();
    let key = fx.session_key();

    // Pending-entry recovery re-reads and re-commits within 2 x T_STUCK
    let settled = wait_until(SETTLE, || {
        world.pipeline.counters().batches_committed >= 1 && world.ingress_pending() == 0
    })
    .await;
    assert!(settled, "stuck entries were never reclaimed");
    assert!(
        wait_until(SETTLE, || world.pipeline.counters().records_processed >= 2).await
    );
    running.stop().await;

    // Raw store holds both commits; derived state applied exactly once
    let raw = world.pipeline.raw();
    assert_eq!(raw.lock().unwrap().batch_count().unwrap(), 2);
    assert_eq!(turn_count(&world, &key), 1);
    assert_eq!(tokens_total(&world, "s-1"), 30);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tool_latency_lands_in_histogram() {
    let world = PipelineWorld::new();
    let mut fx = EventFixture::new("s-1");

    world.pipeline.publish(&fx.user_prompt(2)).unwrap();
    world.pipeline.publish(&fx.tool_pre("Edit", 12)).unwrap();
    world.pipeline.publish(&fx.tool_post("Edit", true, 40)).unwrap();

    let running = world.start();
    let key = fx.session_key();

    assert!(
        wait_until(SETTLE, || world.pipeline.counters().records_processed >= 3).await
    );
    running.stop().await;

    let metrics = world.pipeline.metrics();
    let store = metrics.lock().unwrap();
    let buckets = store
        .histogram(&MetricKey::new(
            Scope::Tool,
            "tool_latency_ms",
            &[("tool_name", "Edit")],
            Bucket::all(),
        ))
        .unwrap();
    assert_eq!(buckets, vec![(64, 1)]);
    drop(store);

    // Both tool events were recorded on the open turn
    let conversations = world.pipeline.conversations();
    let store = conversations.lock().unwrap();
    let turns = store.turns(&key).unwrap();
    assert_eq!(turns[0].tool_uses.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cdc_replay_reproduces_derived_state() {
    use std::sync::{Arc, Mutex};
    use tracepipe_engine::{Builder, ConversationBuilder, MetricsAggregator};
    use tracepipe_store::{ConversationStore, MetricsStore};
    use tracepipe_types::CdcRecord;

    let world = PipelineWorld::new();
    let mut fx = EventFixture::new("s-1");

    world.pipeline.publish(&fx.session_start()).unwrap();
    world.pipeline.publish(&fx.user_prompt(9)).unwrap();
    world.pipeline.publish(&fx.tool_post("Bash", true, 12)).unwrap();
    world.pipeline.publish(&fx.assistant_response(50, 200)).unwrap();
    world.pipeline.publish(&fx.file_edit("accepted")).unwrap();

    let running = world.start();
    let key = fx.session_key();

    assert!(
        wait_until(SETTLE, || world.pipeline.counters().records_processed >= 5).await
    );
    running.stop().await;

    // Replay the whole CDC stream against empty derived stores
    let records: Vec<CdcRecord> = {
        let streams_db = world.pipeline.streams();
        let db = streams_db.lock().unwrap();
        db.scan(streams::CDC)
            .unwrap()
            .iter()
            .map(|entry| entry.decode().unwrap())
            .collect()
    };

    let conversations = Arc::new(Mutex::new(ConversationStore::open_in_memory().unwrap()));
    let metrics = Arc::new(Mutex::new(MetricsStore::open_in_memory().unwrap()));
    let builders: Vec<Box<dyn Builder>> = vec![
        Box::new(ConversationBuilder::new(
            conversations.clone(),
            world.pipeline.raw(),
        )),
        Box::new(MetricsAggregator::new(metrics.clone(), world.pipeline.raw())),
    ];
    for record in &records {
        for builder in &builders {
            assert!(builder.apply(record).is_success());
        }
    }

    // The replayed stores match the live ones
    let live = world.pipeline.conversations();
    let live = live.lock().unwrap();
    let replayed = conversations.lock().unwrap();
    let live_turns = live.turns(&key).unwrap();
    let replayed_turns = replayed.turns(&key).unwrap();
    assert_eq!(live_turns.len(), replayed_turns.len());
    for (a, b) in live_turns.iter().zip(&replayed_turns) {
        assert_eq!(a.prompt_event_id, b.prompt_event_id);
        assert_eq!(a.response_event_id, b.response_event_id);
        assert_eq!(a.accepted, b.accepted);
        assert_eq!(a.tool_uses, b.tool_uses);
    }
    assert_eq!(
        live.session(&key).unwrap().unwrap().status,
        replayed.session(&key).unwrap().unwrap().status
    );
    drop(live);
    drop(replayed);

    let live_metrics = world.pipeline.metrics();
    let replayed_tokens = metrics
        .lock()
        .unwrap()
        .counter(&MetricKey::new(
            Scope::Session,
            "tokens_total",
            &[("session", "s-1")],
            Bucket::all(),
        ))
        .unwrap();
    let live_tokens = live_metrics
        .lock()
        .unwrap()
        .counter(&MetricKey::new(
            Scope::Session,
            "tokens_total",
            &[("session", "s-1")],
            Bucket::all(),
        ))
        .unwrap();
    assert_eq!(replayed_tokens, live_tokens);
    assert_eq!(
        metrics.lock().unwrap().counter_sum("events_total").unwrap(),
        5
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cdc_fallback_sweep_republishes() {
    let world = PipelineWorld::new();
    let mut fx = EventFixture::new("s-1");

    // A batch committed to the raw store whose CDC publish never happened
    let events = vec![fx.user_prompt(4), fx.assistant_response(15, 60)];
    let batch_id = {
        let raw = world.pipeline.raw();
        let mut raw = raw.lock().unwrap();
        let id = raw.append(&events).unwrap();
        raw.record_cdc_unpublished(id).unwrap();
        id
    };
    assert!(batch_id > 0);
    assert_eq!(world.cdc_len(), 0);

    let running = world.start();
    let key = fx.session_key();

    let settled = wait_until(SETTLE, || {
        world.pipeline.counters().records_processed >= 2
    })
    .await;
    assert!(settled, "swept cdc records were not processed");
    running.stop().await;

    assert_eq!(world.cdc_len(), 2);
    assert_eq!(turn_count(&world, &key), 1);
    assert_eq!(tokens_total(&world, "s-1"), 15);

    let raw = world.pipeline.raw();
    assert!(raw.lock().unwrap().cdc_unpublished(10).unwrap().is_empty());
}
