use axum::body::Body;
use axum::http::{Request, StatusCode};
use braid_db::{create_pool, run_migrations, DbRuntimeSettings, EventStore};
use braid_event::EventDraft;
use braid_server::config::Config;
use braid_server::federation::{destinations, run_sender};
use braid_server::{app, build_engine, AppState, Engine};
use braid_vm::Vm;
use ed25519_dalek::SigningKey;
use serde_json::{json, Value};
use tower::ServiceExt;

const SERVER: &str = "braid.example";
const ROOM: &str = "!plaza:braid.example";
const ALICE: &str = "@alice:braid.example";
const CAROL: &str = "@carol:remote.example";

fn store() -> EventStore {
    let pool = create_pool(
        ":memory:",
        DbRuntimeSettings {
            busy_timeout_ms: 5_000,
            pool_max_size: 1,
        },
    )
    .unwrap();
    run_migrations(&pool.get().unwrap()).unwrap();
    EventStore::new(pool)
}

fn engine(store: EventStore) -> Engine {
    let mut config = Config::default();
    config.vm.server_name = SERVER.to_string();
    config.server.federation_queue = 8;
    build_engine(&config, store, SigningKey::from_bytes(&[9u8; 32])).unwrap()
}

async fn open_room(vm: &Vm) {
    let mut eval = vm.eval();
    let (_, outcome) = vm
        .inject(
            &mut eval,
            EventDraft::new(ROOM, "m.room.create", ALICE)
                .state_key("")
                .content(json!({ "room_version": "10", "creator": ALICE })),
        )
        .await
        .unwrap();
    assert!(outcome.is_accept());

    let mut eval = vm.eval();
    let (_, outcome) = vm
        .inject(
            &mut eval,
            EventDraft::new(ROOM, "m.room.member", ALICE)
                .state_key(ALICE)
                .content(json!({ "membership": "join" })),
        )
        .await
        .unwrap();
    assert!(outcome.is_accept());
}

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn health_check_returns_ok() {
    let engine = engine(store());
    let (status, body) = get_json(app(AppState { vm: engine.vm }), "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn sequence_route_reports_counters() {
    let engine = engine(store());
    open_room(&engine.vm).await;

    let (status, body) = get_json(app(AppState { vm: engine.vm }), "/_braid/vm/sequence").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["committed"], 2);
    assert_eq!(body["retired"], 2);
    assert_eq!(body["pending"], 0);
}

#[tokio::test]
async fn locally_authored_events_are_queued() {
    let mut engine = engine(store());
    open_room(&engine.vm).await;

    let first = engine.outbound.try_recv().unwrap();
    let second = engine.outbound.try_recv().unwrap();
    assert_eq!((first.sequence, second.sequence), (1, 2));
    assert_eq!(first.room_id, ROOM);
    assert!(engine.outbound.try_recv().is_err());
}

#[tokio::test]
async fn remote_and_unannounced_events_are_not_queued() {
    let mut engine = engine(store());
    open_room(&engine.vm).await;
    while engine.outbound.try_recv().is_ok() {}

    let head = engine.vm.store().room_head(ROOM).unwrap();
    let carol_in = EventDraft::new(ROOM, "m.room.member", CAROL)
        .state_key(CAROL)
        .depth(3)
        .prev_events([head[0].event_id.as_str()])
        .content(json!({ "membership": "join" }))
        .into_pdu()
        .unwrap();
    let mut eval = engine.vm.eval();
    let outcome = engine.vm.execute(&mut eval, &carol_in).await.unwrap();
    assert!(outcome.is_accept());

    let mut quiet = engine.vm.eval();
    quiet.opts.notify_servers = false;
    let (_, outcome) = engine
        .vm
        .inject(
            &mut quiet,
            EventDraft::new(ROOM, "m.room.message", ALICE)
                .content(json!({ "msgtype": "m.text", "body": "not announced" })),
        )
        .await
        .unwrap();
    assert!(outcome.is_accept());

    assert!(engine.outbound.try_recv().is_err());
    assert_eq!(
        destinations(engine.vm.store(), ROOM, SERVER).unwrap(),
        ["remote.example"]
    );
}

#[tokio::test]
async fn sender_drains_the_queue_and_stops() {
    let store = store();
    let Engine { vm, outbound } = engine(store.clone());
    open_room(&vm).await;

    drop(vm);
    let processed = run_sender(store, SERVER.to_string(), outbound).await;
    assert_eq!(processed, 2);
}
