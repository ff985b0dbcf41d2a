//! Thin HTTP/1.1 surface over the core. One request per connection,
//! JSON in and out; anything smarter belongs behind a reverse proxy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};

use crate::chain::poller::ScanService;
use crate::clock::Clock;
use crate::config::Config;
use crate::evidence::EvidenceStore;
use crate::executor::ActionExecutor;
use crate::logging::{json_log, log_error, obj, v_str, Domain};
use crate::metrics::Metrics;
use crate::model::{ActionType, Finding, FindingCategory, Severity};
use crate::rules::ChainContext;
use crate::scoring::pipeline::ScoringService;
use crate::storage::Store;
use crate::transparency::{verify_log_file, TransparencyLog};

const MAX_HEAD_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub struct ApiState {
    pub config: Config,
    pub store: Arc<Mutex<Store>>,
    pub metrics: Arc<Metrics>,
    pub tlog: Arc<TransparencyLog>,
    pub evidence: Option<Arc<EvidenceStore>>,
    pub scan: Arc<ScanService>,
    pub scoring: Arc<ScoringService>,
    pub executor: Arc<Mutex<ActionExecutor>>,
    pub clock: Arc<dyn Clock>,
    pub started: Instant,
}

struct Request {
    method: String,
    path: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

struct Response {
    status: u16,
    content_type: &'static str,
    body: String,
}

impl Response {
    fn json(status: u16, value: Value) -> Self {
        Self { status, content_type: "application/json", body: value.to_string() }
    }

    fn error(status: u16, message: &str) -> Self {
        Self::json(status, json!({ "error": message }))
    }

    fn text(status: u16, body: String) -> Self {
        Self { status, content_type: "text/plain; version=0.0.4", body }
    }
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "200 OK",
        400 => "400 Bad Request",
        401 => "401 Unauthorized",
        403 => "403 Forbidden",
        404 => "404 Not Found",
        405 => "405 Method Not Allowed",
        413 => "413 Payload Too Large",
        _ => "500 Internal Server Error",
    }
}

pub async fn serve(
    state: Arc<ApiState>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    json_log(
        Domain::Api,
        "listening",
        obj(&[("addr", v_str(&listener.local_addr()?.to_string()))]),
    );
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(state, stream).await {
                        log_error(Domain::Api, "connection_failed", &err.to_string());
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(state: Arc<ApiState>, mut stream: TcpStream) -> Result<()> {
    let request = match read_request(&mut stream).await {
        Ok(request) => request,
        Err(err) => {
            write_response(&mut stream, Response::error(400, &err.to_string())).await?;
            return Ok(());
        }
    };
    let response = dispatch(&state, &request).await;
    json_log(
        Domain::Api,
        "request",
        obj(&[
            ("method", v_str(&request.method)),
            ("path", v_str(&request.path)),
            ("status", json!(response.status)),
        ]),
    );
    write_response(&mut stream, response).await
}

async fn read_request(stream: &mut TcpStream) -> Result<Request> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("connection closed mid-request");
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_BYTES {
            anyhow::bail!("request head too large");
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_uppercase();
    let target = parts.next().unwrap_or("/").to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let (path, query) = match target.split_once('?') {
        Some((path, raw)) => (path.to_string(), parse_query(raw)),
        None => (target, HashMap::new()),
    };

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        anyhow::bail!("request body too large");
    }
    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Request { method, path, query, headers, body })
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_query(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn write_response(stream: &mut TcpStream, response: Response) -> Result<()> {
    let payload = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_line(response.status),
        response.content_type,
        response.body.len(),
        response.body
    );
    stream.write_all(payload.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

fn authorized(state: &ApiState, request: &Request) -> bool {
    match &state.config.api_key {
        None => true,
        Some(key) => request
            .headers
            .get("x-api-key")
            .map(|provided| provided == key)
            .unwrap_or(false),
    }
}

fn body_json(request: &Request) -> Result<Value, Response> {
    if request.body.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_slice(&request.body)
        .map_err(|err| Response::error(400, &format!("invalid json body: {}", err)))
}

async fn dispatch(state: &ApiState, request: &Request) -> Response {
    let segments: Vec<&str> = request.path.trim_matches('/').split('/').collect();

    // health is the only unauthenticated endpoint
    if request.method == "GET" && request.path == "/healthz" {
        return Response::json(
            200,
            json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
                "uptime": state.started.elapsed().as_secs(),
            }),
        );
    }
    if !authorized(state, request) {
        return Response::error(401, "missing or invalid api key");
    }

    match (request.method.as_str(), segments.as_slice()) {
        ("GET", ["metrics"]) => Response::text(200, state.metrics.render()),

        ("GET", ["v1", "agents"]) => match state.store.lock().await.list_agents() {
            Ok(agents) => {
                let rows: Vec<Value> = agents
                    .iter()
                    .map(|a| {
                        json!({
                            "agentId": a.agent_id,
                            "status": a.status,
                            "latestRisk": a.latest_risk,
                            "activeAlertCount": a.active_alert_count,
                        })
                    })
                    .collect();
                Response::json(200, json!({ "agents": rows }))
            }
            Err(err) => Response::error(500, &err.to_string()),
        },

        ("GET", ["v1", "agents", agent_id, "risk"]) => {
            match state.store.lock().await.latest_risk_report(agent_id) {
                Ok(Some(report)) => {
                    Response::json(200, serde_json::to_value(report).unwrap_or(Value::Null))
                }
                Ok(None) => Response::error(404, "no risk report for agent"),
                Err(err) => Response::error(500, &err.to_string()),
            }
        }

        ("GET", ["v1", "agents", agent_id, "alerts"]) => {
            let active_only = request
                .query
                .get("activeOnly")
                .map(|v| v == "true")
                .unwrap_or(true);
            match state.store.lock().await.alerts_for_agent(agent_id, active_only) {
                Ok(alerts) => Response::json(200, json!({ "alerts": alerts })),
                Err(err) => Response::error(500, &err.to_string()),
            }
        }

        ("POST", ["v1", "receipts", "ingest"]) => handle_ingest(state, request).await,

        ("GET", ["v1", "transparency", "leaves"]) => {
            let Some(date) = request.query.get("date") else {
                return Response::error(400, "date query parameter required (YYYY-MM-DD)");
            };
            match state.tlog.read_leaves(date) {
                Ok(leaves) => Response::json(
                    200,
                    json!({ "count": leaves.len(), "leaves": leaves }),
                ),
                Err(err) => Response::error(500, &err.to_string()),
            }
        }

        ("GET", ["v1", "transparency", "status"]) => handle_transparency_status(state).await,

        ("POST", ["scan"]) => handle_scan(state, request).await,

        ("POST", ["actions", "open-dispute"]) => {
            handle_action(state, request, ActionType::OpenDispute).await
        }
        ("POST", ["actions", "submit-evidence"]) => {
            handle_action(state, request, ActionType::SubmitEvidence).await
        }

        ("GET", ["v1", "evidence"]) => handle_evidence_query(state, request).await,

        _ => Response::error(404, "unknown route"),
    }
}

async fn handle_ingest(state: &ApiState, request: &Request) -> Response {
    let body = match body_json(request) {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let Some(agent_id) = body.get("agentId").and_then(Value::as_str) else {
        return Response::error(400, "agentId required");
    };
    let Some(manifest) = body.get("manifest").and_then(Value::as_object) else {
        return Response::error(400, "manifest object required");
    };
    let Some(path) = manifest.get("path").and_then(Value::as_str) else {
        return Response::error(400, "manifest.path required");
    };
    let Some(run_dir) = manifest.get("runDir").and_then(Value::as_str) else {
        return Response::error(400, "manifest.runDir required");
    };
    let expected = manifest.get("sha256").and_then(Value::as_str);
    let receipt_id = manifest.get("receiptId").and_then(Value::as_str);

    match state
        .scoring
        .ingest_manifest(
            agent_id,
            std::path::Path::new(path),
            std::path::Path::new(run_dir),
            expected,
            receipt_id,
        )
        .await
    {
        Ok((report, outcome)) => Response::json(
            200,
            json!({
                "verification": report,
                "report": outcome.report,
                "alerts": outcome.alerts,
            }),
        ),
        Err(err) => Response::error(500, &err.to_string()),
    }
}

async fn handle_transparency_status(state: &ApiState) -> Response {
    let now = state.clock.now_seconds();
    let mut latest_date: Option<String> = None;
    let mut total = 0usize;
    let mut valid = 0usize;
    let mut invalid = 0usize;
    for days_back in 0..7u64 {
        let date = crate::clock::date_stem(now.saturating_sub(days_back * 86_400));
        let path = state.tlog.leaf_file_for_date(&date);
        if !path.exists() {
            continue;
        }
        if latest_date.is_none() {
            latest_date = Some(date.clone());
        }
        match verify_log_file(&path, &state.tlog.verifying_key()) {
            Ok(summary) => {
                total += summary.total_leaves;
                valid += summary.valid_leaves;
                invalid += summary.invalid_leaves;
            }
            Err(err) => {
                log_error(Domain::Transparency, "status_verify_failed", &err.to_string());
            }
        }
    }
    Response::json(
        200,
        json!({
            "latestDate": latest_date,
            "last7Days": { "totalLeaves": total, "validLeaves": valid, "invalidLeaves": invalid },
            "publicKey": state.tlog.public_key_base64(),
        }),
    )
}

async fn handle_scan(state: &ApiState, request: &Request) -> Response {
    let body = match body_json(request) {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let rule_ids: Option<Vec<String>> = body.get("ruleIds").and_then(Value::as_array).map(|ids| {
        ids.iter()
            .filter_map(Value::as_str)
            .map(|s| s.to_string())
            .collect()
    });
    let lookback = body.get("lookbackBlocks").and_then(Value::as_u64);

    match state.scan.scan(rule_ids).await {
        Ok(report) => Response::json(
            200,
            json!({
                "findings": report.results.iter().flat_map(|r| r.findings.iter()).collect::<Vec<_>>(),
                "errors": report
                    .results
                    .iter()
                    .filter_map(|r| r.error.as_ref().map(|e| json!({ "ruleId": r.rule_id, "error": e })))
                    .collect::<Vec<_>>(),
                "metadata": {
                    "rulesRun": report.rules_run,
                    "rulesFailed": report.rules_failed,
                    "totalFindings": report.total_findings,
                    "durationMs": report.duration_ms,
                    "lookbackBlocks": lookback,
                },
            }),
        ),
        Err(err) => Response::error(500, &err.to_string()),
    }
}

async fn handle_action(state: &ApiState, request: &Request, action: ActionType) -> Response {
    if state.config.dry_run {
        return Response::error(403, "actions are disabled (dry run)");
    }
    let body = match body_json(request) {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let Some(receipt_id) = body.get("receiptId").and_then(Value::as_str) else {
        return Response::error(400, "receiptId required");
    };

    // the receipt must exist on chain before any action is attempted
    let ctx = match crate::chain::context::LiveChainContext::pin(
        Arc::clone(&state.scan.provider),
        state.scan.contracts.clone(),
        state.scan.challenge_window_seconds,
        match state.scan.provider.block_number().await {
            Ok(tip) => tip.saturating_sub(state.scan.confirmations).max(1),
            Err(err) => return Response::error(500, &err.to_string()),
        },
    )
    .await
    {
        Ok(ctx) => ctx,
        Err(err) => return Response::error(500, &err.to_string()),
    };
    let receipt = match ctx.receipts_in_challenge_window().await {
        Ok(receipts) => receipts
            .into_iter()
            .find(|r| r.receipt_id.eq_ignore_ascii_case(receipt_id)),
        Err(err) => return Response::error(500, &err.to_string()),
    };
    let Some(receipt) = receipt else {
        return Response::error(404, "receipt not found on chain");
    };

    let finding = Finding::new(
        "MANUAL_DISPATCH",
        &format!("Operator action: {}", action.as_str()),
        "Action requested through the HTTP surface",
        Severity::High,
        FindingCategory::Receipt,
        ctx.current_block(),
        state.clock.now_millis(),
        action,
    )
    .with_receipt(&receipt.receipt_id)
    .with_solver(&receipt.solver_id);

    // Hold the executor for the whole check-then-execute sequence so a
    // concurrent request cannot slip an action in between.
    let mut executor = state.executor.lock().await;
    if let Some(entry) = executor.ledger().get(receipt_id) {
        // idempotent replay: report the action that already happened
        return Response::json(
            200,
            json!({
                "success": true,
                "txHash": entry.tx_hash,
                "message": format!(
                    "{} already recorded for receipt",
                    entry.action_type.as_str()
                ),
            }),
        );
    }
    let results = executor.execute_actions(&[finding]).await;
    drop(executor);

    match results.first() {
        Some(result) if result.success => Response::json(
            200,
            json!({
                "success": true,
                "txHash": result.tx_hash,
                "message": format!("{} submitted", action.as_str()),
            }),
        ),
        Some(result) => Response::error(
            500,
            result.error.as_deref().unwrap_or("action failed"),
        ),
        // with the ledger checked above, a one-finding batch only comes
        // back empty when the batch limit is zero: actions are disabled
        None => Response::error(403, "actions are disabled (action batch limit is 0)"),
    }
}

async fn handle_evidence_query(state: &ApiState, request: &Request) -> Response {
    let Some(evidence) = &state.evidence else {
        return Response::error(404, "evidence store disabled");
    };
    let query = crate::evidence::EvidenceQuery {
        record_type: request.query.get("type").cloned(),
        chain_id: request.query.get("chainId").and_then(|v| v.parse().ok()),
        receipt_id: request.query.get("receiptId").cloned(),
        rule_id: request.query.get("ruleId").cloned(),
        severity: request
            .query
            .get("severity")
            .and_then(|v| crate::model::Severity::parse(v)),
        start_date: request.query.get("startDate").cloned(),
        end_date: request.query.get("endDate").cloned(),
        offset: request.query.get("offset").and_then(|v| v.parse().ok()).unwrap_or(0),
        limit: request.query.get("limit").and_then(|v| v.parse().ok()),
    };
    match evidence.query(&query) {
        Ok(lines) => Response::json(200, json!({ "count": lines.len(), "records": lines })),
        Err(err) => Response::error(500, &err.to_string()),
    }
}
