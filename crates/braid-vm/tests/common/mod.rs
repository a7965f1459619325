#![allow(dead_code)]

use std::sync::Arc;

use braid_db::{create_pool, run_migrations, DbRuntimeSettings, EventStore};
use braid_event::{Event, EventDraft};
use braid_vm::{Vm, VmConfig};
use serde_json::json;

pub const SERVER: &str = "braid.example";
pub const ROOM: &str = "!commons:braid.example";
pub const ALICE: &str = "@alice:braid.example";
pub const BOB: &str = "@bob:braid.example";

pub fn store() -> EventStore {
    let pool = create_pool(
        ":memory:",
        DbRuntimeSettings {
            busy_timeout_ms: 5_000,
            pool_max_size: 1,
        },
    )
    .expect("pool should build");
    {
        let conn = pool.get().expect("connection");
        run_migrations(&conn).expect("migrations should run");
    }
    EventStore::new(pool)
}

pub fn config() -> VmConfig {
    VmConfig {
        server_name: SERVER.to_string(),
        ..VmConfig::default()
    }
}

pub fn vm() -> Arc<Vm> {
    Arc::new(Vm::new(config(), store()).expect("vm should start"))
}

pub fn create() -> Event {
    EventDraft::new(ROOM, "m.room.create", ALICE)
        .state_key("")
        .depth(1)
        .content(json!({ "room_version": "10", "creator": ALICE }))
        .into_pdu()
        .unwrap()
}

pub fn join(user: &str, depth: i64, prev: &Event) -> Event {
    EventDraft::new(ROOM, "m.room.member", user)
        .state_key(user)
        .depth(depth)
        .prev_events([prev.event_id().unwrap()])
        .content(json!({ "membership": "join" }))
        .into_pdu()
        .unwrap()
}

pub fn message(sender: &str, depth: i64, prev: &Event, body: &str) -> Event {
    EventDraft::new(ROOM, "m.room.message", sender)
        .depth(depth)
        .prev_events([prev.event_id().unwrap()])
        .content(json!({ "msgtype": "m.text", "body": body }))
        .into_pdu()
        .unwrap()
}

pub fn topic(sender: &str, depth: i64, prev: &Event, text: &str) -> Event {
    EventDraft::new(ROOM, "m.room.topic", sender)
        .state_key("")
        .depth(depth)
        .prev_events([prev.event_id().unwrap()])
        .content(json!({ "topic": text }))
        .into_pdu()
        .unwrap()
}

/// Admits `events` one after another, asserting each is accepted.
pub async fn admit_all(vm: &Vm, events: &[&Event]) {
    for event in events {
        let mut eval = vm.eval();
        let outcome = vm.execute(&mut eval, event).await.expect("admission");
        assert!(outcome.is_accept(), "{outcome:?} for {}", event.summary());
    }
}
