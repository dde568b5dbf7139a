//! JSON-RPC ledger client.

use crate::ledger::transaction::SignedTransaction;
use crate::ledger::{AgentAccount, ExecutionResult, ExecutionStatus, Ledger};
use crate::types::{EventPage, EventPosition, LedgerEvent};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Error fragments a node returns when an input object was already consumed.
const CONFLICT_MARKERS: &[&str] = &[
    "ObjectVersionUnavailableForConsumption",
    "not available for consumption",
    "ObjectLockConflict",
    "equivocated",
];

/// Ledger node reached over JSON-RPC 2.0.
#[derive(Debug)]
pub struct JsonRpcLedger {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventPageResponse {
    data: Vec<LedgerEvent>,
    next_cursor: Option<EventPosition>,
    #[serde(default)]
    has_next_page: bool,
}

#[derive(Debug, Deserialize)]
struct ObjectResponse {
    data: Option<ObjectData>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectData {
    object_id: String,
    #[serde(with = "crate::types::string_u64")]
    version: u64,
    content: Option<ObjectContent>,
}

#[derive(Debug, Deserialize)]
struct ObjectContent {
    #[serde(default)]
    fields: Value,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    digest: String,
    effects: Option<Effects>,
    #[serde(default)]
    events: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Effects {
    status: EffectsStatus,
}

#[derive(Debug, Deserialize)]
struct EffectsStatus {
    status: String,
    error: Option<String>,
}

/// Outcome of a single RPC round trip.
enum Call<T> {
    Ok(T),
    Rejected(RpcError),
}

impl JsonRpcLedger {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Call<T>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("RPC {} (id {})", method, id);

        let resp = self
            .http
            .post(&self.url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }))
            .send()
            .await
            .with_context(|| format!("{method} request failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("{} failed ({}): {}", method, status, body);
        }

        let body: RpcResponse<T> = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse {method} response"))?;

        match (body.result, body.error) {
            (_, Some(err)) => Ok(Call::Rejected(err)),
            (Some(result), None) => Ok(Call::Ok(result)),
            (None, None) => bail!("{method} returned neither result nor error"),
        }
    }

    async fn call_ok<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        match self.call(method, params).await? {
            Call::Ok(result) => Ok(result),
            Call::Rejected(err) => bail!("{} rejected ({}): {}", method, err.code, err.message),
        }
    }
}

#[async_trait]
impl Ledger for JsonRpcLedger {
    async fn query_events(
        &self,
        event_type: &str,
        after: Option<&EventPosition>,
        limit: usize,
    ) -> Result<EventPage> {
        let page: EventPageResponse = self
            .call_ok(
                "suix_queryEvents",
                json!([{ "MoveEventType": event_type }, after, limit, false]),
            )
            .await?;

        Ok(EventPage {
            events: page.data,
            next_cursor: page.next_cursor,
            has_next_page: page.has_next_page,
        })
    }

    async fn agent_account(&self, object_id: &str) -> Result<AgentAccount> {
        let resp: ObjectResponse = self
            .call_ok(
                "sui_getObject",
                json!([object_id, { "showContent": true }]),
            )
            .await?;

        let data = match (resp.data, resp.error) {
            (Some(data), _) => data,
            (None, err) => bail!("Object {} unavailable: {}", object_id, err.unwrap_or_default()),
        };
        let fields = data.content.map(|c| c.fields).unwrap_or_default();

        Ok(AgentAccount {
            object_id: data.object_id,
            version: data.version,
            balance: parse_balance(&fields["balance"])
                .with_context(|| format!("Object {object_id} has no readable balance"))?,
            configuration: parse_bytes(&fields["configuration"]),
            memory_pointer: parse_option_string(&fields["memory_pointer"]),
            admin_cap_id: parse_option_string(&fields["admin_cap"]),
        })
    }

    async fn execute(&self, tx: &SignedTransaction) -> Result<ExecutionResult> {
        let params = json!([
            tx.tx_bytes_base64(),
            tx.signatures,
            { "showEffects": true, "showEvents": true },
            "WaitForLocalExecution",
        ]);

        match self
            .call::<ExecuteResponse>("sui_executeTransactionBlock", params)
            .await?
        {
            Call::Ok(resp) => {
                let status = match resp.effects {
                    Some(effects) if effects.status.status == "success" => ExecutionStatus::Success,
                    Some(effects) => classify(effects.status.error.unwrap_or_default()),
                    None => ExecutionStatus::Failure {
                        error: "execution result carried no effects".into(),
                    },
                };
                Ok(ExecutionResult {
                    digest: resp.digest,
                    status,
                    events: resp.events,
                })
            }
            Call::Rejected(err) if is_conflict(&err.message) => Ok(ExecutionResult {
                digest: tx.digest(),
                status: ExecutionStatus::Conflict { error: err.message },
                events: Vec::new(),
            }),
            Call::Rejected(err) => bail!(
                "sui_executeTransactionBlock rejected ({}): {}",
                err.code,
                err.message
            ),
        }
    }
}

fn is_conflict(message: &str) -> bool {
    CONFLICT_MARKERS.iter().any(|m| message.contains(m))
}

fn classify(error: String) -> ExecutionStatus {
    if is_conflict(&error) {
        ExecutionStatus::Conflict { error }
    } else {
        ExecutionStatus::Failure { error }
    }
}

fn parse_balance(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        // Balance<T> wrapper
        Value::Object(map) => map.get("value").and_then(parse_balance),
        _ => None,
    }
}

fn parse_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
            .collect(),
        Value::String(s) => hex::decode(s.trim_start_matches("0x")).unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn parse_option_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        // Option<T> rendered as { vec: [] } or { vec: [x] }
        Value::Object(map) => map
            .get("vec")
            .and_then(|v| v.as_array())
            .and_then(|v| v.first())
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| map.get("id").and_then(|v| v.as_str()).map(str::to_string)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn signed() -> SignedTransaction {
        SignedTransaction {
            tx_bytes: b"{}".to_vec(),
            signatures: vec!["sig-a".into(), "sig-b".into()],
        }
    }

    #[tokio::test]
    async fn query_events_parses_page() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "suix_queryEvents",
                "params": [{ "MoveEventType": "0xp::prompt::PromptCreated" }, { "txDigest": "ABC", "eventSeq": "0" }, 25, false],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {
                    "data": [{
                        "id": { "txDigest": "ABC", "eventSeq": "1" },
                        "type": "0xp::prompt::PromptCreated",
                        "sender": "0xuser",
                        "parsedJson": { "prompt_id": "0xprompt" },
                        "timestampMs": "1700000000000"
                    }],
                    "nextCursor": { "txDigest": "ABC", "eventSeq": "1" },
                    "hasNextPage": true
                }
            })))
            .mount(&server)
            .await;

        let ledger = JsonRpcLedger::new(&server.uri());
        let page = ledger
            .query_events(
                "0xp::prompt::PromptCreated",
                Some(&EventPosition::new("ABC", 0)),
                25,
            )
            .await
            .unwrap();

        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].id, EventPosition::new("ABC", 1));
        assert_eq!(page.events[0].timestamp_ms, Some(1_700_000_000_000));
        assert!(page.has_next_page);
    }

    #[tokio::test]
    async fn agent_account_reads_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": { "data": {
                    "objectId": "0xacct",
                    "version": "12",
                    "content": { "fields": {
                        "balance": "500000",
                        "configuration": [1, 2, 3],
                        "memory_pointer": { "vec": ["bafyhash"] },
                        "admin_cap": "0xcap"
                    }}
                }}
            })))
            .mount(&server)
            .await;

        let account = JsonRpcLedger::new(&server.uri())
            .agent_account("0xacct")
            .await
            .unwrap();
        assert_eq!(account.version, 12);
        assert_eq!(account.balance, 500_000);
        assert_eq!(account.configuration, vec![1, 2, 3]);
        assert_eq!(account.memory_pointer.as_deref(), Some("bafyhash"));
        assert_eq!(account.admin_cap_id.as_deref(), Some("0xcap"));
    }

    #[tokio::test]
    async fn execute_reports_failure_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {
                    "digest": "D1",
                    "effects": { "status": { "status": "failure", "error": "MoveAbort(agent, 1)" } }
                }
            })))
            .mount(&server)
            .await;

        let result = JsonRpcLedger::new(&server.uri())
            .execute(&signed())
            .await
            .unwrap();
        assert_eq!(result.digest, "D1");
        assert!(!result.is_success());
        assert!(matches!(result.status, ExecutionStatus::Failure { .. }));
    }

    #[tokio::test]
    async fn stale_version_rejection_is_a_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {
                    "code": -32002,
                    "message": "Transaction validator signing failed: ObjectVersionUnavailableForConsumption"
                }
            })))
            .mount(&server)
            .await;

        let result = JsonRpcLedger::new(&server.uri())
            .execute(&signed())
            .await
            .unwrap();
        assert!(matches!(result.status, ExecutionStatus::Conflict { .. }));
    }

    #[tokio::test]
    async fn other_rejections_are_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": { "code": -32602, "message": "Invalid user signature" }
            })))
            .mount(&server)
            .await;

        assert!(JsonRpcLedger::new(&server.uri())
            .execute(&signed())
            .await
            .is_err());
    }
}
