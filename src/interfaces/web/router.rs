use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::handlers::subroutines;

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/agents/{agent}/subroutines",
            get(subroutines::list_subroutines_endpoint)
                .post(subroutines::create_subroutine_endpoint),
        )
        .route(
            "/api/agents/{agent}/subroutines/{name}",
            get(subroutines::get_subroutine_endpoint)
                .patch(subroutines::update_subroutine_endpoint)
                .delete(subroutines::delete_subroutine_endpoint),
        )
        .route(
            "/api/agents/{agent}/subroutines/{name}/start",
            post(subroutines::start_subroutine_endpoint),
        )
        .route(
            "/api/agents/{agent}/subroutines/{name}/stop",
            post(subroutines::stop_subroutine_endpoint),
        )
        .route(
            "/api/agents/{agent}/subroutines/{name}/trigger",
            post(subroutines::trigger_subroutine_endpoint),
        )
        .route(
            "/api/subroutines/active",
            get(subroutines::active_subroutines_endpoint),
        )
        .route("/api/logs", get(super::sse_logs_endpoint))
        .layer(middleware::from_fn(security_headers))
        .layer(build_localhost_cors(state.api_port))
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'self'"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::subroutine::TriggerRegistry;
    use crate::core::subroutine::tests::support::{ScriptedBackend, executor_for, finish, text};
    use crate::core::transcript::{ChatRecord, TranscriptStore};
    use axum::http::StatusCode;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::util::ServiceExt;

    struct TestApp {
        _dir: tempfile::TempDir,
        state: AppState,
        backend: Arc<ScriptedBackend>,
    }

    async fn test_app(backend: ScriptedBackend) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path().join("chats"));
        let backend = Arc::new(backend);
        let executor = executor_for(store.clone(), backend.clone());
        let registry = Arc::new(TriggerRegistry::new(executor).await.unwrap());
        let (log_tx, _) = tokio::sync::broadcast::channel(16);
        TestApp {
            _dir: dir,
            state: AppState {
                store,
                registry,
                user_name: "User".to_string(),
                log_tx,
                api_port: 17990,
            },
            backend,
        }
    }

    async fn json_request(
        app: Router,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let body = match body {
            Some(json) => Body::from(serde_json::to_string(&json).unwrap()),
            None => Body::empty(),
        };

        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body_bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&body_bytes).unwrap_or(serde_json::json!({}));
        (status, json)
    }

    async fn call(
        t: &TestApp,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        json_request(build_api_router(t.state.clone()), method, path, body).await
    }

    async fn create(t: &TestApp, name: &str) -> (StatusCode, serde_json::Value) {
        call(
            t,
            Method::POST,
            "/api/agents/ada/subroutines",
            Some(serde_json::json!({
                "name": name,
                "triggerType": "time-based",
                "interval": 30,
                "triggerText": "check the inbox"
            })),
        )
        .await
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn security_headers_present_on_responses() {
        let t = test_app(ScriptedBackend::repeating(text("ok"))).await;
        let req = Request::builder()
            .method(Method::GET)
            .uri("/api/subroutines/active")
            .body(Body::empty())
            .unwrap();
        let resp = build_api_router(t.state.clone()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(resp.headers().get("x-frame-options").unwrap(), "DENY");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_get_and_list_roundtrip() {
        let t = test_app(ScriptedBackend::repeating(text("ok"))).await;

        let (status, json) = create(&t, "inbox").await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["success"], true);
        assert_eq!(json["subroutine"]["interval"], 30);
        assert_eq!(json["subroutine"]["active"], false);

        let (status, json) = call(&t, Method::GET, "/api/agents/ada/subroutines/inbox", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["running"], false);
        assert_eq!(json["subroutine"]["triggerText"], "check the inbox");

        let (status, json) = call(&t, Method::GET, "/api/agents/ada/subroutines", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["subroutines"].as_array().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_rejects_duplicates_and_invalid_bodies() {
        let t = test_app(ScriptedBackend::repeating(text("ok"))).await;
        assert_eq!(create(&t, "inbox").await.0, StatusCode::CREATED);

        let (status, json) = create(&t, "inbox").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["success"], false);

        let (status, _) = call(
            &t,
            Method::POST,
            "/api/agents/ada/subroutines",
            Some(serde_json::json!({"name": "bad", "interval": 0, "triggerText": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &t,
            Method::POST,
            "/api/agents/ada/subroutines",
            Some(serde_json::json!({"name": "odd", "triggerText": "x", "surprise": true})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &t,
            Method::POST,
            "/api/agents/ada/subroutines",
            Some(serde_json::json!({"name": "../escape", "triggerText": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn plain_chats_are_not_subroutines() {
        let t = test_app(ScriptedBackend::repeating(text("ok"))).await;
        let path = t.state.store.chat_path("ada", "smalltalk").unwrap();
        let mut record = ChatRecord::new_agent_chat(
            "User",
            "ada",
            crate::core::subroutine::tests::support::config(
                crate::core::subroutine::config::TriggerType::Api,
            ),
        );
        record.header.chat_metadata.agent_managed = false;
        t.state.store.save(&path, &record).await.unwrap();

        let (status, _) = call(&t, Method::GET, "/api/agents/ada/subroutines/smalltalk", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (_, json) = call(&t, Method::GET, "/api/agents/ada/subroutines", None).await;
        assert!(json["subroutines"].as_array().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_stop_flow_updates_disk_flag() {
        let t = test_app(ScriptedBackend::repeating(text("ok"))).await;
        create(&t, "inbox").await;

        let (status, _) = call(&t, Method::POST, "/api/agents/ada/subroutines/inbox/start", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&t, Method::POST, "/api/agents/ada/subroutines/inbox/start", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, json) = call(&t, Method::GET, "/api/agents/ada/subroutines/inbox", None).await;
        assert_eq!(json["running"], true);
        assert_eq!(json["subroutine"]["active"], true);

        let (_, json) = call(&t, Method::GET, "/api/subroutines/active", None).await;
        assert_eq!(json["active"].as_array().unwrap().len(), 1);
        assert_eq!(json["active"][0]["kind"], "interval");

        let (status, _) = call(&t, Method::POST, "/api/agents/ada/subroutines/inbox/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&t, Method::POST, "/api/agents/ada/subroutines/inbox/stop", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, json) = call(&t, Method::GET, "/api/agents/ada/subroutines/inbox", None).await;
        assert_eq!(json["running"], false);
        assert_eq!(json["subroutine"]["active"], false);
        t.state.registry.shutdown_all().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn patch_validates_and_restarts_running_job() {
        let t = test_app(ScriptedBackend::repeating(text("ok"))).await;
        create(&t, "inbox").await;
        call(&t, Method::POST, "/api/agents/ada/subroutines/inbox/start", None).await;

        let (status, json) = call(
            &t,
            Method::PATCH,
            "/api/agents/ada/subroutines/inbox",
            Some(serde_json::json!({"interval": 120, "autoQueue": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["restarted"], true);
        assert_eq!(json["subroutine"]["interval"], 120);

        let job = t
            .state
            .registry
            .get(&crate::core::subroutine::JobKey::new("ada", "inbox"))
            .await
            .unwrap();
        assert_eq!(job.config.interval, Some(120));
        assert!(job.config.auto_queue);

        let (status, _) = call(
            &t,
            Method::PATCH,
            "/api/agents/ada/subroutines/inbox",
            Some(serde_json::json!({"interval": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &t,
            Method::PATCH,
            "/api/agents/ada/subroutines/inbox",
            Some(serde_json::json!({"active": false})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &t,
            Method::PATCH,
            "/api/agents/ada/subroutines/missing",
            Some(serde_json::json!({"interval": 10})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        t.state.registry.shutdown_all().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_stops_and_removes_record() {
        let t = test_app(ScriptedBackend::repeating(text("ok"))).await;
        create(&t, "inbox").await;
        call(&t, Method::POST, "/api/agents/ada/subroutines/inbox/start", None).await;

        let (status, json) = call(&t, Method::DELETE, "/api/agents/ada/subroutines/inbox", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["stopped"], true);
        assert!(t.state.registry.list().await.is_empty());
        assert_eq!(t.state.registry.executor().tracked_keys().await, 0);

        let (status, _) = call(&t, Method::DELETE, "/api/agents/ada/subroutines/inbox", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        t.state.registry.shutdown_all().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_delete_leaves_running_job_alone() {
        let t = test_app(ScriptedBackend::repeating(text("ok"))).await;
        let key = crate::core::subroutine::JobKey::new("ada", "ghost");
        let path = t.state.store.chat_path("ada", "ghost").unwrap();
        let mut cfg = crate::core::subroutine::tests::support::config(
            crate::core::subroutine::config::TriggerType::Time,
        );
        cfg.interval = Some(3600);
        assert!(
            t.state
                .registry
                .start(key.clone(), cfg, &path, "ada")
                .await
                .unwrap()
        );

        let (status, _) = call(&t, Method::DELETE, "/api/agents/ada/subroutines/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(t.state.registry.is_active(&key).await);
        t.state.registry.shutdown_all().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn trigger_runs_a_cycle_for_running_jobs() {
        let t = test_app(ScriptedBackend::repeating(finish("done", "ok"))).await;
        let (status, _) = call(
            &t,
            Method::POST,
            "/api/agents/ada/subroutines",
            Some(serde_json::json!({"name": "hook", "triggerType": "api-based"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = call(&t, Method::POST, "/api/agents/ada/subroutines/hook/trigger", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        call(&t, Method::POST, "/api/agents/ada/subroutines/hook/start", None).await;
        let (status, json) = call(&t, Method::POST, "/api/agents/ada/subroutines/hook/trigger", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["success"], true);

        for _ in 0..50 {
            let (_, json) = call(&t, Method::GET, "/api/agents/ada/subroutines/hook", None).await;
            if json["turns"] == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(t.backend.call_count(), 1);
        let (_, json) = call(&t, Method::GET, "/api/agents/ada/subroutines/hook", None).await;
        assert_eq!(json["turns"], 3);
        t.state.registry.shutdown_all().await;
    }
}
