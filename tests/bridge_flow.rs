mod common;

use common::{config, harness, Harness, FEES};
use gasbag::events::{EventPoller, EventTracker, PollOutcome};
use gasbag::ledger::{Ledger, Operation};
use gasbag::types::{ChargeKind, PromptStatus};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn poller(h: &Harness) -> EventPoller {
    let bridge = h.services.bridge().unwrap();
    EventPoller::new(
        EventTracker::new(h.services.config.prompt_event_type(), Arc::new(bridge)),
        h.ledger.clone() as Arc<dyn Ledger>,
        h.services.db.clone(),
        h.services.config.page_size,
        Duration::from_millis(10),
    )
}

async fn agent_server(answer: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/message"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "text": answer, "user": "agent", "action": null }
        ])))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn answers_prompt_and_charges_agent() {
    let h = harness(config());
    let server = agent_server("42").await;
    let agent = h.agent("a1", Some(&server.uri()), Some(1_000_000_000)).await;

    h.ledger.push_event(
        &h.services.config.prompt_event_type(),
        &agent.owner_address,
        json!({ "prompt_id": "0xp1", "question": "What is six times seven?" }),
    );

    let outcome = poller(&h).poll_once().await.unwrap();
    assert!(matches!(outcome, PollOutcome::Advanced { handled: 1, .. }));
    assert_eq!(h.ledger.answer("0xp1").as_deref(), Some("42"));

    let db = h.services.db.lock().await;
    let prompt = db.get_prompt("0xp1").unwrap().unwrap();
    assert_eq!(prompt.status, PromptStatus::Answered);
    assert_eq!(prompt.response.as_deref(), Some("42"));

    let charges = db.charges_for_agent("a1").unwrap();
    assert_eq!(charges.len(), 1);
    let charge = &charges[0];
    assert_eq!(charge.kind, ChargeKind::Inference);
    assert!(charge.success);
    assert!(charge.amount > 0);
    assert_eq!(h.ledger.received_by(FEES), charge.amount);
    assert_eq!(h.balance(&agent), 1_000_000_000 - charge.amount);
}

#[tokio::test]
async fn replayed_prompt_is_not_asked_again() {
    let h = harness(config());
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/message"))
        .and(body_partial_json(json!({ "question": "once?" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "text": "yes" }])))
        .expect(1)
        .mount(&server)
        .await;
    let agent = h.agent("a1", Some(&server.uri()), Some(1_000_000_000)).await;

    h.ledger.push_event(
        &h.services.config.prompt_event_type(),
        &agent.owner_address,
        json!({ "prompt_id": "0xp1", "question": "once?" }),
    );
    poller(&h).poll_once().await.unwrap();

    // Operator reset forces the batch to be delivered again.
    let event_type = h.services.config.prompt_event_type();
    assert!(h.services.db.lock().await.cursor_reset(&event_type).unwrap());
    let outcome = poller(&h).poll_once().await.unwrap();
    assert!(matches!(outcome, PollOutcome::Advanced { handled: 1, .. }));

    let charges = h.services.db.lock().await.charges_for_agent("a1").unwrap();
    assert_eq!(charges.len(), 1);
}

#[tokio::test]
async fn failed_inference_is_recorded_and_skipped() {
    let h = harness(config());
    let broken = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/message"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model crashed"))
        .mount(&broken)
        .await;
    let healthy = agent_server("fine").await;

    let down = h.agent("down", Some(&broken.uri()), None).await;
    let up = h.agent("up", Some(&healthy.uri()), None).await;
    let event_type = h.services.config.prompt_event_type();
    h.ledger.push_event(&event_type, &down.owner_address, json!({ "prompt_id": "0xp1", "question": "a" }));
    let last = h.ledger.push_event(&event_type, &up.owner_address, json!({ "prompt_id": "0xp2", "question": "b" }));

    let outcome = poller(&h).poll_once().await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Advanced {
            cursor: last.clone(),
            handled: 2,
            has_more: false
        }
    );

    let db = h.services.db.lock().await;
    let failed = db.get_prompt("0xp1").unwrap().unwrap();
    assert_eq!(failed.status, PromptStatus::Failed);
    assert_eq!(failed.attempts, 1);
    assert!(failed.last_error.unwrap().contains("model crashed"));
    assert_eq!(db.get_prompt("0xp2").unwrap().unwrap().status, PromptStatus::Answered);
    assert_eq!(db.cursor_get(&event_type).unwrap(), Some(last));
    assert_eq!(h.ledger.answer("0xp1"), None);
}

#[tokio::test]
async fn unknown_requester_fails_without_charge() {
    let h = harness(config());
    h.ledger.push_event(
        &h.services.config.prompt_event_type(),
        "0xnobody",
        json!({ "prompt_id": "0xp1", "question": "anyone?" }),
    );

    let outcome = poller(&h).poll_once().await.unwrap();
    assert!(matches!(outcome, PollOutcome::Advanced { .. }));

    let db = h.services.db.lock().await;
    let prompt = db.get_prompt("0xp1").unwrap().unwrap();
    assert_eq!(prompt.status, PromptStatus::Failed);
    assert!(db.recent_charges(10).unwrap().is_empty());
}

#[tokio::test]
async fn external_callback_receives_question_and_answer() {
    let h = harness(config());
    let server = agent_server("sunny").await;
    let agent = h.agent("a1", Some(&server.uri()), None).await;

    h.ledger.push_event(
        &h.services.config.prompt_event_type(),
        &agent.owner_address,
        json!({
            "prompt_id": "0xp1",
            "question": "weather?",
            "callback": "0xabc::oracle::receive",
        }),
    );
    poller(&h).poll_once().await.unwrap();

    let applied = h.ledger.applied();
    let Operation::Call(call) = &applied.last().unwrap().operation else {
        panic!("expected a callback call, got {:?}", applied);
    };
    assert_eq!(call.package, "0xabc");
    assert_eq!(call.module, "oracle");
    assert_eq!(call.function, "receive");
    assert_eq!(call.arguments, vec![json!("weather?"), json!("sunny")]);
    assert_eq!(h.ledger.answer("0xp1"), None);
}

#[tokio::test]
async fn unprovisioned_agent_answers_for_free() {
    let h = harness(config());
    let server = agent_server("hello").await;
    let agent = h.agent("a1", Some(&server.uri()), None).await;

    h.ledger.push_event(
        &h.services.config.prompt_event_type(),
        &agent.owner_address,
        json!({ "prompt_id": "0xp1", "question": "hi" }),
    );
    poller(&h).poll_once().await.unwrap();

    assert_eq!(h.ledger.answer("0xp1").as_deref(), Some("hello"));
    assert!(h.services.db.lock().await.recent_charges(10).unwrap().is_empty());
    assert_eq!(h.ledger.received_by(FEES), 0);
}

#[tokio::test]
async fn malformed_event_does_not_block_the_stream() {
    let h = harness(config());
    let event_type = h.services.config.prompt_event_type();
    let bad = h.ledger.push_event(&event_type, "0xuser", json!({ "unexpected": true }));

    let outcome = poller(&h).poll_once().await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Advanced {
            cursor: bad,
            handled: 1,
            has_more: false
        }
    );
    assert_eq!(h.services.db.lock().await.prompt_count().unwrap(), 0);
}
