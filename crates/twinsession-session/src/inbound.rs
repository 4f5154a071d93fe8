//! Inbound command listener
//!
//! One `POST` route per dispatch mode. The body is the flat action
//! envelope; the response body is whatever the control task answered.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use twinsession_control::{DispatchHandle, HandleError};
use twinsession_proto::{ActionEnvelope, DispatchMode, ReturnMessage};

pub fn router(handle: DispatchHandle) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .route("/queue", post(queue))
        .route("/execute-one-way-tls", post(execute_one_way_tls))
        .with_state(handle)
}

/// Serve `router` on `listener` until `shutdown` is cancelled
pub async fn serve(
    listener: TcpListener,
    handle: DispatchHandle,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(address = %addr, "Inbound listener started");
    }
    axum::serve(listener, router(handle))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

async fn execute(State(handle): State<DispatchHandle>, body: String) -> Response {
    forward(&handle, DispatchMode::Execute, &body).await
}

async fn queue(State(handle): State<DispatchHandle>, body: String) -> Response {
    forward(&handle, DispatchMode::Queue, &body).await
}

async fn execute_one_way_tls(State(handle): State<DispatchHandle>, body: String) -> Response {
    forward(&handle, DispatchMode::ExecuteOneWayTls, &body).await
}

async fn forward(handle: &DispatchHandle, mode: DispatchMode, body: &str) -> Response {
    let envelope = match ActionEnvelope::from_json(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(mode = %mode, error = %e, "Rejecting malformed command");
            return (
                StatusCode::BAD_REQUEST,
                ReturnMessage::failed(e.to_string()).to_json(),
            )
                .into_response();
        }
    };

    debug!(action = %envelope.action, mode = %mode, "Inbound command");
    match handle.submit(envelope, mode).await {
        Ok(reply) => (StatusCode::OK, reply).into_response(),
        Err(HandleError::Closed) => (
            StatusCode::SERVICE_UNAVAILABLE,
            ReturnMessage::failed("session is shutting down").to_json(),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ReturnMessage::failed(e.to_string()).to_json(),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use twinsession_control::{ControlMessage, Dispatcher, SessionContext};

    fn spawn_control(mut dispatcher: Dispatcher) -> DispatchHandle {
        let (handle, mut receiver) = DispatchHandle::channel(8);
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                if let ControlMessage::Dispatch {
                    envelope,
                    mode,
                    reply,
                } = message
                {
                    let _ = reply.send(dispatcher.dispatch(&envelope, mode));
                }
            }
        });
        handle
    }

    async fn send_post(router: Router, path: &str, body: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(
                Request::post(path)
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_ping_on_every_route() {
        let handle = spawn_control(Dispatcher::new(SessionContext::default()));
        for path in ["/execute", "/queue", "/execute-one-way-tls"] {
            let (status, body) = send_post(router(handle.clone()), path, r#"{"action":"Ping"}"#).await;
            assert_eq!(status, StatusCode::OK);
            if path == "/queue" {
                assert_eq!(body, ReturnMessage::ok("").to_json());
            } else {
                assert_eq!(body, "Ping");
            }
        }
    }

    #[tokio::test]
    async fn test_bound_action_reply_is_forwarded() {
        let mut dispatcher = Dispatcher::new(SessionContext::default());
        dispatcher.bind("Echo", |envelope| Ok(envelope.get_str("text")?.to_string()));
        let handle = spawn_control(dispatcher);

        let (status, body) = send_post(
            router(handle),
            "/execute",
            r#"{"action":"ExecuteAction","name":"Echo","text":"hello"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "hello");
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let handle = spawn_control(Dispatcher::new(SessionContext::default()));
        let (status, body) = send_post(router(handle), "/execute", r#"{"name":"x"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("Failed"));
    }

    #[tokio::test]
    async fn test_stopped_control_task_is_unavailable() {
        let (handle, receiver) = DispatchHandle::channel(1);
        drop(receiver);
        let (status, _) = send_post(router(handle), "/execute", r#"{"action":"Ping"}"#).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
