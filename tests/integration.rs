//! End-to-end tests for the RPC surface against a real (in-memory)
//! database and registry, exercising the fused session view a dashboard
//! client would actually see.

use std::sync::{Arc, Mutex as StdMutex};

use agentboard::bus::EventBus;
use agentboard::db::{self, migrate};
use agentboard::models::{AgentSession, AgentType, Session, SessionSource, SessionStatus};
use agentboard::registry::Registry;
use agentboard::rpc::{handle, RpcContext};
use rusqlite::Connection;
use serde_json::json;

fn test_context() -> RpcContext {
    let mut conn = Connection::open_in_memory().expect("open in-memory db");
    migrate(&mut conn).expect("migrate");
    let registry = Arc::new(Registry::new(Arc::new(EventBus::new(16))));
    RpcContext::new(registry, Arc::new(StdMutex::new(conn)))
}

fn sample_session(id: &str, tmux_target: &str, status: SessionStatus) -> Session {
    Session {
        id: id.to_string(),
        name: "claude".to_string(),
        tmux_target: tmux_target.to_string(),
        project_path: Some("/home/user/project".to_string()),
        status,
        last_activity: "2026-01-01T00:00:00Z".to_string(),
        created_at: "2026-01-01T00:00:00Z".to_string(),
        source: SessionSource::Managed,
        host: None,
        remote: false,
        start_command: Some("claude".to_string()),
        agent_type: AgentType::Claude,
    }
}

#[test]
fn health_get_reports_ok_and_uptime() {
    let ctx = test_context();
    let result = handle("health.get", json!({}), &ctx).unwrap();
    assert_eq!(result["status"], "ok");
    assert!(result["uptimeSeconds"].is_number());
}

#[test]
fn server_info_reports_app_name_and_version() {
    let ctx = test_context();
    let result = handle("server.info", json!({}), &ctx).unwrap();
    assert_eq!(result["appName"], agentboard::APP_NAME);
}

#[test]
fn sessions_list_is_empty_before_any_scan() {
    let ctx = test_context();
    let result = handle("sessions.list", json!({}), &ctx).unwrap();
    assert_eq!(result.as_array().unwrap().len(), 0);
}

#[test]
fn sessions_list_fuses_registry_with_agent_session_rows() {
    let ctx = test_context();
    ctx.registry.update_session(
        sample_session("main:@1", "main:@1", SessionStatus::Working),
        "2026-01-01T00:00:00Z",
    );

    {
        let conn = ctx.conn.lock().unwrap();
        let mut row = AgentSession::new(
            "sess-abc123",
            AgentType::Claude,
            "/home/user/.claude/projects/p/sess-abc123.jsonl",
            "2026-01-01T00:00:00Z",
        );
        row.current_window = Some("main:@1".to_string());
        row.display_name = Some("fix the flaky test".to_string());
        db::upsert_agent_session(&conn, &row).unwrap();
    }

    let result = handle("sessions.list", json!({}), &ctx).unwrap();
    let sessions = result.as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["agentSessionId"], "sess-abc123");
    assert_eq!(sessions[0]["agentSessionName"], "fix the flaky test");
    assert_eq!(sessions[0]["status"], "working");
}

#[test]
fn session_preview_returns_not_found_for_unknown_session() {
    let ctx = test_context();
    let err = handle("session.preview", json!({"sessionId": "nope"}), &ctx).unwrap_err();
    assert_eq!(err.code, "NOT_FOUND");
}

#[test]
fn session_preview_returns_the_persisted_row() {
    let ctx = test_context();
    {
        let conn = ctx.conn.lock().unwrap();
        let row = AgentSession::new(
            "sess-xyz",
            AgentType::Codex,
            "/home/user/.codex/sessions/sess-xyz.jsonl",
            "2026-01-01T00:00:00Z",
        );
        db::upsert_agent_session(&conn, &row).unwrap();
    }
    let result = handle("session.preview", json!({"sessionId": "sess-xyz"}), &ctx).unwrap();
    assert_eq!(result["sessionId"], "sess-xyz");
    assert_eq!(result["agentType"], "codex");
}

#[test]
fn settings_round_trip_requires_admin_to_write() {
    let ctx = test_context();
    let err = handle(
        "settings.set",
        json!({"key": "tmux_mouse_mode", "value": "on"}),
        &ctx,
    )
    .unwrap_err();
    assert_eq!(err.code, "FORBIDDEN");

    let got = handle("settings.get", json!({"key": "tmux_mouse_mode"}), &ctx).unwrap();
    assert!(got["value"].is_null());
}

#[test]
fn settings_round_trip_succeeds_as_admin() {
    let mut ctx = test_context();
    ctx.is_admin = true;
    handle(
        "settings.set",
        json!({"key": "tmux_mouse_mode", "value": "on"}),
        &ctx,
    )
    .unwrap();
    let got = handle("settings.get", json!({"key": "tmux_mouse_mode"}), &ctx).unwrap();
    assert_eq!(got["value"], "on");
}

#[test]
fn session_pin_flips_the_flag_and_reports_not_found_otherwise() {
    let ctx = test_context();
    let missing = handle(
        "session.pin",
        json!({"sessionId": "ghost", "isPinned": true}),
        &ctx,
    )
    .unwrap_err();
    assert_eq!(missing.code, "NOT_FOUND");

    {
        let conn = ctx.conn.lock().unwrap();
        let row = AgentSession::new(
            "sess-pin",
            AgentType::Claude,
            "/tmp/sess-pin.jsonl",
            "2026-01-01T00:00:00Z",
        );
        db::upsert_agent_session(&conn, &row).unwrap();
    }

    let result = handle(
        "session.pin",
        json!({"sessionId": "sess-pin", "isPinned": true}),
        &ctx,
    )
    .unwrap();
    assert_eq!(result["isPinned"], true);

    let conn = ctx.conn.lock().unwrap();
    let row = db::get_agent_session(&conn, "sess-pin").unwrap().unwrap();
    assert!(row.is_pinned);
}

#[test]
fn unknown_method_is_unsupported() {
    let ctx = test_context();
    let err = handle("widgets.list", json!({}), &ctx).unwrap_err();
    assert_eq!(err.code, "UNSUPPORTED");
}

#[test]
fn invalid_params_reports_missing_field() {
    let ctx = test_context();
    let err = handle("session.preview", json!({"wrongField": 1}), &ctx).unwrap_err();
    assert_eq!(err.code, "INVALID_PARAMS");
}

#[test]
fn registry_replace_preserves_created_at_across_ticks() {
    let ctx = test_context();
    ctx.registry.replace_sessions(
        vec![sample_session("main:@1", "main:@1", SessionStatus::Waiting)],
        "2026-01-01T00:00:00Z",
    );
    let first = ctx.registry.get("main:@1").unwrap();

    ctx.registry.replace_sessions(
        vec![sample_session("main:@1", "main:@1", SessionStatus::Working)],
        "2026-01-01T00:05:00Z",
    );
    let second = ctx.registry.get("main:@1").unwrap();

    assert_eq!(first.created_at, second.created_at);
    assert_eq!(second.status, SessionStatus::Working);
}

#[test]
fn registry_remove_drops_the_session_from_the_next_snapshot() {
    let ctx = test_context();
    ctx.registry.update_session(
        sample_session("main:@2", "main:@2", SessionStatus::Waiting),
        "2026-01-01T00:00:00Z",
    );
    assert_eq!(ctx.registry.snapshot().len(), 1);

    ctx.registry.remove("main:@2", "2026-01-01T00:01:00Z");
    assert_eq!(ctx.registry.snapshot().len(), 0);
}
