use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use super::*;
use crate::engine::testing::{MockVisionModel, StaticImageFetcher};
use crate::engine::GenerationParams;
use crate::models::RequestBody;
use crate::session::{CasOutcome, CompareSetStore, FileStore, RetryPolicy};

const SEQ_HEADER: &str = "X-Amzn-SageMaker-Session-Id";
const END_HEADER: &str = "X-Amzn-SageMaker-Closed-Session-Id";

struct Fixture {
    handler: CustomHandler,
    _temp_dir: TempDir,
}

/// 可切换为写入失败的存储
struct FlakyStore {
    inner: FileStore,
    fail_writes: AtomicBool,
}

impl CompareSetStore for FlakyStore {
    fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
        self.inner.get(key)
    }

    fn compare_set(
        &self,
        key: &str,
        expected: Option<&str>,
        desired: &str,
    ) -> std::result::Result<CasOutcome, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only volume",
            )));
        }
        self.inner.compare_set(key, expected, desired)
    }
}

async fn build_handler(settings: HandlerSettings, store: Arc<dyn CompareSetStore>) -> CustomHandler {
    let registry = Arc::new(SessionRegistry::new(store, RetryPolicy::unbounded()));
    let engine = InferenceApi::new(
        Arc::new(MockVisionModel::new("A cat on a sofa.")),
        Arc::new(StaticImageFetcher),
        GenerationParams::default(),
    );
    let mut handler = CustomHandler::new(settings, engine, registry);
    handler.initialize().await.unwrap();
    handler
}

async fn create_test_handler(capacity: usize) -> Fixture {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(FileStore::open(temp_dir.path().join("model_store")).unwrap());
    let settings = HandlerSettings {
        max_sessions_per_worker: capacity,
        ..HandlerSettings::default()
    };
    Fixture {
        handler: build_handler(settings, store).await,
        _temp_dir: temp_dir,
    }
}

fn missing_image_start(sequence_id: &str, request_id: &str) -> BatchItem {
    item(
        sequence_id,
        true,
        request_id,
        json!({"type": "start_session", "path": StaticImageFetcher::MISSING_URL}),
    )
}

fn item(sequence_id: &str, start: bool, request_id: &str, body: Value) -> BatchItem {
    BatchItem {
        sequence_id: sequence_id.to_string(),
        sequence_start: start,
        request_id: request_id.to_string(),
        body: RequestBody::from(body),
    }
}

fn start_item(sequence_id: &str, request_id: &str) -> BatchItem {
    item(
        sequence_id,
        true,
        request_id,
        json!({"type": "start_session", "path": "https://example/img.jpg"}),
    )
}

fn prompt_item(sequence_id: &str, request_id: &str, text: &str) -> BatchItem {
    item(
        sequence_id,
        false,
        request_id,
        json!({"type": "send_text_prompt", "session_id": sequence_id, "prompt_text": text}),
    )
}

fn close_item(sequence_id: &str, request_id: &str) -> BatchItem {
    item(
        sequence_id,
        false,
        request_id,
        json!({"type": "close_session", "session_id": sequence_id}),
    )
}

async fn handle_one(handler: &mut CustomHandler, batch_item: BatchItem) -> BatchResponse {
    let mut responses = handler.handle(vec![batch_item]).await;
    assert_eq!(responses.len(), 1);
    responses.remove(0)
}

#[tokio::test]
async fn test_full_session_lifecycle() {
    let mut fx = create_test_handler(1).await;
    let handler = &mut fx.handler;

    let opened = handle_one(handler, start_item("S", "r1")).await;
    assert!(opened.is_success());
    assert_eq!(opened.body, json!({"session_id": "S"}));
    let header = opened.header(SEQ_HEADER).unwrap();
    assert!(header.starts_with("S; Expires="));
    assert!(header.ends_with('Z'));
    assert_eq!(handler.active_session(), Some("S"));
    assert_eq!(handler.registry().snapshot().unwrap(), vec!["S"]);

    let answered = handle_one(handler, prompt_item("S", "r2", "describe the picture")).await;
    assert!(answered.is_success());
    assert_eq!(answered.body["response_text"], "A cat on a sofa.");
    assert_eq!(answered.header(SEQ_HEADER), Some("S"));

    let closed = handle_one(handler, close_item("S", "r3")).await;
    assert!(closed.is_success());
    assert_eq!(closed.body, json!({"success": true}));
    assert_eq!(closed.header(END_HEADER), Some("S"));

    assert_eq!(handler.active_session(), None);
    assert!(handler.registry().snapshot().unwrap().is_empty());
    assert!(handler.engine().session("S").is_none());
    // 收到结束标记且没有未完成请求后记录被清除
    assert!(!handler.sequences().contains("S"));
}

#[tokio::test]
async fn test_expiry_header_is_parseable() {
    let mut fx = create_test_handler(1).await;
    let before = Utc::now();
    let opened = handle_one(&mut fx.handler, start_item("S", "r1")).await;

    let header = opened.header(SEQ_HEADER).unwrap();
    let expires = header.strip_prefix("S; Expires=").unwrap();
    let parsed = chrono::NaiveDateTime::parse_from_str(expires, EXPIRY_FORMAT)
        .unwrap()
        .and_utc();
    let delta = parsed - before;
    assert!(delta >= chrono::Duration::minutes(19));
    assert!(delta <= chrono::Duration::minutes(21));
}

#[tokio::test]
async fn test_opening_second_session_evicts_first() {
    let mut fx = create_test_handler(1).await;
    let handler = &mut fx.handler;

    assert!(handle_one(handler, start_item("A", "r1")).await.is_success());
    assert!(handle_one(handler, start_item("B", "r2")).await.is_success());

    assert_eq!(handler.active_session(), Some("B"));
    assert_eq!(handler.active_sessions(), vec!["B"]);
    assert_eq!(handler.registry().snapshot().unwrap(), vec!["B"]);
    assert!(handler.engine().session("A").is_none());
    assert!(handler.engine().session("B").is_some());

    // 被淘汰会话的后续请求得到会话不存在
    let orphan = handle_one(handler, prompt_item("A", "r3", "hello")).await;
    assert_eq!(orphan.status, axum::http::StatusCode::NOT_FOUND);
    assert_eq!(orphan.body["error"]["type"], "session_not_found");
    assert_eq!(orphan.header(SEQ_HEADER), Some("A"));
}

#[tokio::test]
async fn test_larger_capacity_evicts_least_recently_used() {
    let mut fx = create_test_handler(2).await;
    let handler = &mut fx.handler;

    handle_one(handler, start_item("A", "r1")).await;
    tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    handle_one(handler, start_item("B", "r2")).await;
    tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    // A 最近被使用，B 成为淘汰对象
    handle_one(handler, prompt_item("A", "r3", "hi")).await;
    handle_one(handler, start_item("C", "r4")).await;

    assert_eq!(handler.active_sessions(), vec!["A", "C"]);
    assert_eq!(handler.registry().snapshot().unwrap(), vec!["A", "C"]);
    assert!(handler.engine().session("B").is_none());
}

#[tokio::test]
async fn test_closing_other_session_keeps_active() {
    let mut fx = create_test_handler(1).await;
    let handler = &mut fx.handler;
    handle_one(handler, start_item("A", "r1")).await;

    handler.close_session("B").await.unwrap();

    assert_eq!(handler.active_session(), Some("A"));
    assert_eq!(handler.registry().snapshot().unwrap(), vec!["A"]);
}

#[tokio::test]
async fn test_orphan_continuation_is_rejected_without_record() {
    let mut fx = create_test_handler(1).await;
    let handler = &mut fx.handler;

    let response = handle_one(handler, prompt_item("ghost", "r1", "hello")).await;

    assert_eq!(response.status, axum::http::StatusCode::BAD_REQUEST);
    assert_eq!(response.body["error"]["type"], "protocol_violation");
    // 失败时同样回写 sequence id
    assert_eq!(response.header(SEQ_HEADER), Some("ghost"));
    assert!(!handler.sequences().contains("ghost"));
}

#[tokio::test]
async fn test_batch_items_fail_independently() {
    let mut fx = create_test_handler(2).await;
    let handler = &mut fx.handler;

    let responses = handler
        .handle(vec![
            item("X", true, "r1", Value::String("{not json".to_string())),
            start_item("Y", "r2"),
            item("Z", true, "r3", json!({"type": "rotate_image"})),
        ])
        .await;

    assert_eq!(responses.len(), 3);
    assert_eq!(responses[0].status, axum::http::StatusCode::BAD_REQUEST);
    assert_eq!(responses[0].body["error"]["type"], "decode_error");
    assert_eq!(responses[0].header(SEQ_HEADER), Some("X"));
    assert!(responses[1].is_success());
    assert_eq!(responses[1].body["session_id"], "Y");
    assert_eq!(responses[2].status, axum::http::StatusCode::BAD_REQUEST);
    assert_eq!(responses[2].body["error"]["type"], "unsupported_type");
    assert_eq!(handler.active_sessions(), vec!["Y"]);
}

#[tokio::test]
async fn test_redelivered_request_is_acknowledged() {
    let mut fx = create_test_handler(1).await;
    let handler = &mut fx.handler;
    handle_one(handler, start_item("S", "r1")).await;

    // 同一 request id 在一批内先后出现：第二次只确认
    let responses = handler
        .handle(vec![
            prompt_item("S", "r2", "hello"),
            prompt_item("S", "r2", "hello"),
        ])
        .await;

    assert!(responses[0].body["response_text"].is_string());
    assert_eq!(
        responses[1].body,
        json!({"type": "continue", "session_id": "S"})
    );
    let record = handler.sequences().get("S").unwrap();
    assert_eq!(record.num_requests, 0);
    assert!(record.has_seen("r2"));
}

#[tokio::test]
async fn test_session_id_mismatch_is_protocol_violation() {
    let mut fx = create_test_handler(1).await;
    let handler = &mut fx.handler;
    handle_one(handler, start_item("S", "r1")).await;

    let response = handle_one(
        handler,
        item(
            "S",
            false,
            "r2",
            json!({"type": "close_session", "session_id": "other"}),
        ),
    )
    .await;

    assert_eq!(response.body["error"]["type"], "protocol_violation");
    assert!(response.header(END_HEADER).is_none());
    assert_eq!(handler.active_session(), Some("S"));
    assert!(!handler.sequences().get("S").unwrap().has_seen("r2"));
}

#[tokio::test]
async fn test_client_session_id_is_replaced_by_sequence_id() {
    let mut fx = create_test_handler(1).await;
    let response = handle_one(
        &mut fx.handler,
        item(
            "S",
            true,
            "r1",
            json!({"type": "start_session", "path": "https://example/img.jpg", "session_id": "mine"}),
        ),
    )
    .await;

    assert_eq!(response.body["session_id"], "S");
    assert!(fx.handler.engine().session("mine").is_none());
}

#[tokio::test]
async fn test_failed_start_is_rolled_back() {
    let mut fx = create_test_handler(1).await;
    let handler = &mut fx.handler;

    let response = handle_one(handler, missing_image_start("S", "r1")).await;

    assert_eq!(response.status, axum::http::StatusCode::BAD_GATEWAY);
    assert_eq!(response.body["error"]["type"], "resource_fetch_error");
    assert_eq!(handler.active_session(), None);
    assert!(handler.registry().snapshot().unwrap().is_empty());
}

#[tokio::test]
async fn test_start_with_bytes_body() {
    let mut fx = create_test_handler(1).await;
    let response = handle_one(
        &mut fx.handler,
        BatchItem {
            sequence_id: "S".to_string(),
            sequence_start: true,
            request_id: "r1".to_string(),
            body: RequestBody::from(bytes::Bytes::from_static(
                br#"{"type":"start_session","path":"https://example/img.jpg"}"#,
            )),
        },
    )
    .await;
    assert!(response.is_success());
    assert_eq!(response.body["session_id"], "S");
}

#[tokio::test]
async fn test_uninitialized_handler_rejects_prompts() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(FileStore::open(temp_dir.path().join("model_store")).unwrap());
    let registry = Arc::new(SessionRegistry::new(store, RetryPolicy::unbounded()));
    let engine = InferenceApi::new(
        Arc::new(MockVisionModel::new("ok")),
        Arc::new(StaticImageFetcher),
        GenerationParams::default(),
    );
    let mut handler = CustomHandler::new(HandlerSettings::default(), engine, registry);
    assert!(!handler.is_initialized());

    handle_one(&mut handler, start_item("S", "r1")).await;
    let response = handle_one(&mut handler, prompt_item("S", "r2", "hi")).await;
    assert_eq!(response.status, axum::http::StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_failed_restart_drops_previous_image() {
    let mut fx = create_test_handler(1).await;
    let handler = &mut fx.handler;
    assert!(handle_one(handler, start_item("S", "r1")).await.is_success());

    let response = handle_one(handler, missing_image_start("S", "r2")).await;

    assert_eq!(response.body["error"]["type"], "resource_fetch_error");
    assert!(handler.engine().session("S").is_none());
    assert_eq!(handler.engine().session_count(), 0);
    assert!(handler.registry().snapshot().unwrap().is_empty());

    assert!(handle_one(handler, start_item("T", "r3")).await.is_success());
    assert_eq!(handler.engine().session_count(), 1);
}

#[tokio::test]
async fn test_failed_starts_leave_no_records() {
    let mut fx = create_test_handler(1).await;
    let handler = &mut fx.handler;

    for i in 0..50 {
        let seq = format!("fetch-{}", i);
        let response = handle_one(handler, missing_image_start(&seq, "r1")).await;
        assert_eq!(response.status, axum::http::StatusCode::BAD_GATEWAY);
    }
    for i in 0..50 {
        let seq = format!("malformed-{}", i);
        let response = handle_one(
            handler,
            item(&seq, true, "r1", Value::String("{not json".to_string())),
        )
        .await;
        assert_eq!(response.status, axum::http::StatusCode::BAD_REQUEST);
    }

    assert_eq!(handler.sequences().len(), 0);
    assert_eq!(handler.active_session(), None);
}

#[tokio::test]
async fn test_evicted_record_is_pruned_once_idle() {
    let mut fx = create_test_handler(1).await;
    let handler = &mut fx.handler;
    handle_one(handler, start_item("A", "r1")).await;
    handle_one(handler, start_item("B", "r2")).await;
    // A 被淘汰后记录仍在，直到空闲超过过期时间
    assert!(handler.sequences().contains("A"));

    let cutoff = Utc::now() + chrono::Duration::seconds(1);
    let slots = &handler.slots;
    let pruned = handler
        .sequences
        .prune_idle(cutoff, |sequence_id| slots.contains(sequence_id));

    assert_eq!(pruned, 1);
    assert!(!handler.sequences().contains("A"));
    assert!(handler.sequences().contains("B"));
}

#[tokio::test]
async fn test_oversized_expiry_is_clamped() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(FileStore::open(temp_dir.path().join("model_store")).unwrap());
    let settings = HandlerSettings {
        session_expiry_minutes: i64::MAX,
        ..HandlerSettings::default()
    };
    let mut handler = build_handler(settings, store).await;

    let opened = handle_one(&mut handler, start_item("S", "r1")).await;

    assert!(opened.is_success());
    let header = opened.header(SEQ_HEADER).unwrap();
    let expires = header.strip_prefix("S; Expires=").unwrap();
    let parsed = chrono::NaiveDateTime::parse_from_str(expires, EXPIRY_FORMAT)
        .unwrap()
        .and_utc();
    assert!(parsed > Utc::now() + chrono::Duration::days(364));
}

#[tokio::test]
async fn test_store_failure_during_eviction_is_reported() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(FlakyStore {
        inner: FileStore::open(temp_dir.path().join("model_store")).unwrap(),
        fail_writes: AtomicBool::new(false),
    });
    let mut handler = build_handler(HandlerSettings::default(), store.clone()).await;
    assert!(handle_one(&mut handler, start_item("A", "r1")).await.is_success());

    store.fail_writes.store(true, Ordering::SeqCst);
    let response = handle_one(&mut handler, start_item("B", "r2")).await;

    assert_eq!(
        response.status,
        axum::http::StatusCode::INTERNAL_SERVER_ERROR
    );
    assert_eq!(response.body["error"]["type"], "store_error");
    assert!(handler.engine().session("B").is_none());
    assert!(!handler.sequences().contains("B"));
    assert_eq!(handler.registry().snapshot().unwrap(), vec!["A"]);
}
