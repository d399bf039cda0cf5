//! End-to-end samples: start here to learn the API by example.
//!
//! Each test drives a function through the in-process `Executor`, which
//! plays the orchestrator, or through the adapter entry point.
use async_trait::async_trait;
use rust_dfn::adapters::NO_RETRY_HEADER;
use rust_dfn::{
    AdapterRequest, AdapterResponse, Client, EventSender, ExecutionOutcome, Executor, FrameworkAdapter,
    FunctionRegistry, InvocationPayload, StepError, StepKind,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
mod common;
use common::*;

fn no_waits(report: &rust_dfn::StepReport) -> Result<Value, StepError> {
    Err(StepError::non_retriable(format!("unexpected {} step {}", report.kind, report.name)))
}

/// Hello world: one step, driven to completion.
#[tokio::test]
async fn sample_hello_world() {
    let registry = FunctionRegistry::builder()
        .register("hello", |ctx, input| async move {
            let name: String = input.event_data()?;
            let greeting: String = ctx
                .run("greet", move || async move { Ok::<_, StepError>(format!("Hello, {name}!")) })
                .await?;
            Ok(json!(greeting))
        })
        .build();
    let client = client(registry);

    let run = Executor::drive_to_completion(&client, "hello", RUN_ID, event(json!("World")), no_waits).await;
    assert_eq!(run.output(), Ok(&json!("Hello, World!")));
    assert_eq!(run.history.len(), 1);
    // Plan, run `greet`, complete.
    assert_eq!(run.passes.len(), 3);
}

/// Memoization: every step callback runs exactly once across all passes.
#[tokio::test]
async fn sample_steps_execute_once() {
    let counts: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
    let c = counts.clone();
    let registry = FunctionRegistry::builder()
        .register("pipeline", move |ctx, _input| {
            let c = c.clone();
            async move {
                let tick = |name: &'static str, v: i64| {
                    let c = c.clone();
                    move || async move {
                        *c.lock().unwrap().entry(name.to_string()).or_default() += 1;
                        Ok::<_, StepError>(v)
                    }
                };
                let a: i64 = ctx.run("load", tick("load", 2)).await?;
                let (b, d) = futures::join!(ctx.run("double", tick("double", a * 2)), ctx.run("square", tick("square", a * a)));
                let (b, d): (i64, i64) = (b?, d?);
                ctx.sleep("cool-off", Duration::from_secs(5)).await?;
                let total: i64 = ctx.run("sum", tick("sum", b + d)).await?;
                Ok(json!(total))
            }
        })
        .build();
    let client = client(registry);

    let run = Executor::drive_to_completion(&client, "pipeline", RUN_ID, event(json!({})), |r| {
        assert_eq!(r.kind, StepKind::Sleep);
        Ok(Value::Null)
    })
    .await;
    assert_eq!(run.output(), Ok(&json!(8)));
    let counts = counts.lock().unwrap().clone();
    for name in ["load", "double", "square", "sum"] {
        assert_eq!(counts.get(name), Some(&1), "step {name} ran {:?} times", counts.get(name));
    }
    assert_eq!(run.history.len(), 5);
}

/// Retries: a flaky step succeeds on its third attempt.
#[tokio::test]
async fn sample_step_retries_until_success() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let a = attempts.clone();
    let registry = FunctionRegistry::builder()
        .register("flaky", move |ctx, _input| {
            let a = a.clone();
            async move {
                let v: String = ctx
                    .run("call-api", move || async move {
                        let n = a.fetch_add(1, Ordering::SeqCst);
                        if n < 2 {
                            return Err(StepError::new(format!("503 on try {n}")));
                        }
                        Ok("ok".to_string())
                    })
                    .await?;
                Ok(json!(v))
            }
        })
        .build();
    let client = client(registry);
    let run = Executor::drive_to_completion(&client, "flaky", RUN_ID, event(json!({})), no_waits).await;
    assert_eq!(run.output(), Ok(&json!("ok")));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let retried = run
        .passes
        .iter()
        .filter(|o| matches!(o, ExecutionOutcome::StepRan(r) if r.error.is_some()))
        .count();
    assert_eq!(retried, 2);
}

/// Exhausted retries hand the error to the handler, which may recover.
#[tokio::test]
async fn sample_exhausted_step_error_is_catchable() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let a = attempts.clone();
    let registry = FunctionRegistry::builder()
        .register("fallback", move |ctx, _input| {
            let a = a.clone();
            async move {
                let primary: Result<String, StepError> = ctx
                    .run("primary", move || async move {
                        a.fetch_add(1, Ordering::SeqCst);
                        Err::<String, _>(StepError::new("primary unavailable"))
                    })
                    .await;
                let chosen = match primary {
                    Ok(v) => v,
                    Err(e) => {
                        ctx.run("secondary", move || async move { Ok::<_, StepError>(format!("secondary after: {}", e.message)) })
                            .await?
                    }
                };
                Ok(json!(chosen))
            }
        })
        .build();
    let client = client(registry);
    let run = Executor::drive_to_completion(&client, "fallback", RUN_ID, event(json!({})), no_waits).await;
    assert_eq!(run.output(), Ok(&json!("secondary after: primary unavailable")));
    assert_eq!(attempts.load(Ordering::SeqCst), 4, "default budget is four attempts");
    assert!(run.history[0].error.is_some());
}

/// Event waits and invokes are settled by the resolver.
#[tokio::test]
async fn sample_wait_for_event_and_invoke() {
    let registry = FunctionRegistry::builder()
        .register("approve", |ctx, _input| async move {
            let approval: Option<Value> = ctx
                .wait_for_event(
                    "approval",
                    rust_dfn::WaitForEventOptions {
                        event: "invoice/approved".into(),
                        timeout: Duration::from_secs(3600),
                        if_expr: None,
                    },
                )
                .await?;
            let Some(approval) = approval else {
                return Ok(json!({ "status": "timed-out" }));
            };
            let receipt: String = ctx
                .invoke(
                    "pay",
                    rust_dfn::InvokeOptions {
                        function_id: "payments".into(),
                        data: approval["data"].clone(),
                        timeout: Some(Duration::from_secs(60)),
                    },
                )
                .await?;
            Ok(json!({ "status": "paid", "receipt": receipt }))
        })
        .build();
    let client = client(registry);

    let run = Executor::drive_to_completion(&client, "approve", RUN_ID, event(json!({})), |r| match r.kind {
        StepKind::WaitForEvent => Ok(json!({ "name": "invoice/approved", "data": { "amount": 10 } })),
        StepKind::Invoke => {
            assert_eq!(r.opts.as_ref().unwrap()["payload"]["data"], json!({ "amount": 10 }));
            assert_eq!(r.opts.as_ref().unwrap()["timeoutMs"], 60000);
            Ok(json!("rcpt-1"))
        }
        _ => Err(StepError::non_retriable("unexpected")),
    })
    .await;
    assert_eq!(run.output(), Ok(&json!({ "status": "paid", "receipt": "rcpt-1" })));

    let timed_out = Executor::drive_to_completion(&client, "approve", "run-2", event(json!({})), |_r| Ok(Value::Null)).await;
    assert_eq!(timed_out.output(), Ok(&json!({ "status": "timed-out" })));
}

struct MemorySender {
    sent: Mutex<Vec<Value>>,
}

#[async_trait]
impl EventSender for MemorySender {
    async fn send(&self, events: Vec<Value>) -> Result<Vec<String>, StepError> {
        let mut sent = self.sent.lock().unwrap();
        let ids = events.iter().enumerate().map(|(i, _)| format!("evt-{}", sent.len() + i)).collect();
        sent.extend(events);
        Ok(ids)
    }
}

/// Sending events is a step: emitted once, ids memoized.
#[tokio::test]
async fn sample_send_event() {
    let sender = Arc::new(MemorySender { sent: Mutex::new(Vec::new()) });
    let registry = FunctionRegistry::builder()
        .register("notify", |ctx, _input| async move {
            let ids = ctx
                .send_event("fan-out", vec![json!({ "name": "user/notify", "data": { "id": 1 } })])
                .await?;
            let again = ctx
                .send_event("fan-out", vec![json!({ "name": "user/notify", "data": { "id": 2 } })])
                .await?;
            Ok(json!({ "first": ids, "second": again }))
        })
        .build();
    let client = Client::builder().registry(registry).event_sender(sender.clone()).build();

    let run = Executor::drive_to_completion(&client, "notify", RUN_ID, event(json!({})), no_waits).await;
    assert_eq!(run.output(), Ok(&json!({ "first": ["evt-0"], "second": ["evt-1"] })));
    assert_eq!(sender.sent.lock().unwrap().len(), 2);

    // Without a sender the step fails for good.
    let bare = client_without_sender();
    let run = Executor::drive_to_completion(&bare, "notify", RUN_ID, event(json!({})), no_waits).await;
    let err = run.output().unwrap_err();
    assert!(err.message.contains("no event sender"));
}

fn client_without_sender() -> Client {
    client(
        FunctionRegistry::builder()
            .register("notify", |ctx, _input| async move {
                let ids = ctx.send_event("fan-out", vec![json!({ "name": "x" })]).await?;
                Ok(json!(ids))
            })
            .build(),
    )
}

// ---------------- adapters

fn adapter_client() -> Client {
    client(
        FunctionRegistry::builder()
            .register("add", |ctx, input| async move {
                let n: i64 = input.event_data()?;
                let doubled: i64 = ctx.run("double", move || async move { Ok::<_, StepError>(n * 2) }).await?;
                if doubled > 100 {
                    return Err(StepError::non_retriable("too large"));
                }
                Ok(json!(doubled))
            })
            .build(),
    )
}

fn body(resp: &AdapterResponse) -> Value {
    serde_json::from_slice(&resp.body).unwrap()
}

/// The adapter contract: status codes and retry header.
#[tokio::test]
async fn sample_adapter_status_codes() {
    let client = adapter_client();

    let first = InvocationPayload::new(RUN_ID, event(json!(4)));
    let resp = client.serve(AdapterRequest::post("add", &first).unwrap()).await;
    assert_eq!(resp.status, 206);
    assert_eq!(body(&resp)["status"], "steps");
    assert_eq!(body(&resp)["steps"][0]["name"], "double");
    assert!(resp.header(NO_RETRY_HEADER).is_none());

    let done = first.clone().with_steps(memo(&[("double", json!(8))]));
    let resp = client.serve(AdapterRequest::post("add", &done).unwrap()).await;
    assert_eq!(resp.status, 200);
    assert_eq!(body(&resp), json!({ "status": "completed", "data": 8 }));

    let too_big = InvocationPayload::new(RUN_ID, event(json!(60))).with_steps(memo(&[("double", json!(120))]));
    let resp = client.serve(AdapterRequest::post("add", &too_big).unwrap()).await;
    assert_eq!(resp.status, 500);
    assert_eq!(resp.header(NO_RETRY_HEADER), Some("true"));
    assert_eq!(body(&resp)["error"]["message"], "too large");
}

#[tokio::test]
async fn sample_adapter_rejects_bad_requests() {
    let client = adapter_client();
    let ok = AdapterRequest::post("add", &InvocationPayload::new(RUN_ID, event(json!(1)))).unwrap();

    let mut get = ok.clone();
    get.method = "GET".into();
    let resp = client.serve(get).await;
    assert_eq!(resp.status, 405);
    assert_eq!(resp.header("allow"), Some("POST"));

    let mut missing = ok.clone();
    missing.query.clear();
    assert_eq!(client.serve(missing).await.status, 400);

    let mut unknown = ok.clone();
    unknown.query.insert("fnId".into(), "nope".into());
    let resp = client.serve(unknown).await;
    assert_eq!(resp.status, 404);
    assert_eq!(resp.header(NO_RETRY_HEADER), Some("true"));

    let mut garbage = ok;
    garbage.body = b"{ definitely not json".to_vec();
    let resp = client.serve(garbage).await;
    assert_eq!(resp.status, 400);
    assert_eq!(body(&resp)["code"], "INVALID_PAYLOAD");
}

/// A toy framework: requests and responses are plain tuples.
struct TupleAdapter;

impl FrameworkAdapter for TupleAdapter {
    type Request = (String, String, Vec<u8>);
    type Response = (u16, Vec<u8>);

    fn to_request(&self, (method, fn_id, body): Self::Request) -> AdapterRequest {
        let mut query = HashMap::new();
        query.insert("fnId".to_string(), fn_id);
        AdapterRequest {
            method,
            headers: HashMap::new(),
            body,
            query,
        }
    }

    fn from_response(&self, resp: AdapterResponse) -> Self::Response {
        (resp.status, resp.body)
    }
}

#[tokio::test]
async fn sample_custom_framework_adapter() {
    let client = adapter_client();
    let payload = InvocationPayload::new(RUN_ID, event(json!(5))).with_steps(memo(&[("double", json!(10))]));
    let (status, body) = TupleAdapter
        .dispatch(
            &client,
            ("POST".into(), "add".into(), serde_json::to_vec(&payload).unwrap()),
        )
        .await;
    assert_eq!(status, 200);
    let v: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["data"], 10);
}

// ---------------- logging

mod capture {
    use std::fmt::Debug;
    use std::sync::{Arc, Mutex};
    use tracing::field::{Field, Visit};
    use tracing_subscriber::Layer;
    use tracing_subscriber::layer::Context;

    /// Collects the `log` field of handler log records.
    pub struct Capture(pub Arc<Mutex<Vec<String>>>);

    struct LogField(Option<String>);

    impl Visit for LogField {
        fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
            if field.name() == "log" {
                self.0 = Some(format!("{value:?}"));
            }
        }
    }

    impl<S: tracing::Subscriber> Layer<S> for Capture {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            let mut v = LogField(None);
            event.record(&mut v);
            if let Some(msg) = v.0 {
                self.0.lock().unwrap().push(msg);
            }
        }
    }
}

/// Handler logs are not repeated while memoized steps replay.
#[tokio::test]
async fn sample_logs_are_not_repeated_on_replay() {
    use tracing_subscriber::layer::SubscriberExt;

    let lines: Arc<Mutex<Vec<String>>> = Arc::default();
    let subscriber = tracing_subscriber::registry().with(capture::Capture(lines.clone()));
    let _guard = tracing::subscriber::set_default(subscriber);

    let registry = FunctionRegistry::builder()
        .register("chatty", |ctx, _input| async move {
            let log = ctx.logger();
            log.info("starting");
            let a: i64 = ctx.run("a", || async { Ok::<_, StepError>(1) }).await?;
            log.info(format!("a = {a}"));
            let b: i64 = ctx.run("b", || async { Ok::<_, StepError>(2) }).await?;
            log.warn(format!("done: {}", a + b));
            Ok(json!(a + b))
        })
        .build();
    let client = client(registry);

    client.execute("chatty", payload(vec![])).await;
    assert_eq!(lines.lock().unwrap().drain(..).collect::<Vec<_>>(), vec!["starting"]);

    client.execute("chatty", payload(memo(&[("a", json!(1))]))).await;
    assert_eq!(lines.lock().unwrap().drain(..).collect::<Vec<_>>(), vec!["a = 1"]);

    client
        .execute("chatty", payload(memo(&[("a", json!(1)), ("b", json!(2))])))
        .await;
    assert_eq!(lines.lock().unwrap().drain(..).collect::<Vec<_>>(), vec!["done: 3"]);
}
