use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn list_calls(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let summary = state.calls.summary();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "summary": summary
    })))
}

pub async fn get_call(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let call_id = path.into_inner();
    let session = state
        .calls
        .get(&call_id)
        .ok_or_else(|| AppError::NotFound(format!("call '{}'", call_id)))?;

    Ok(HttpResponse::Ok().json(session.summary()))
}

/// Hang up a call from outside its WebSocket (admin use).
pub async fn end_call(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let call_id = path.into_inner();
    let session = state
        .calls
        .remove(&call_id)
        .ok_or_else(|| AppError::NotFound(format!("call '{}'", call_id)))?;

    session.end().await;

    Ok(HttpResponse::Ok().json(session.summary()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::testing::{FakeCapture, FakeOutput};
    use crate::call::session::CallSession;
    use crate::call::transport::testing::ScriptedTransport;
    use crate::config::AppConfig;
    use actix_web::{http::StatusCode, test, App};
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_list_get_and_end() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let (capture, _) = FakeCapture::new();
        let (output, _) = FakeOutput::new();
        let session = Arc::new(CallSession::new(
            "call-42",
            AppConfig::default().call,
            Arc::new(ScriptedTransport::new()),
            Box::new(capture),
            Box::new(output),
        ));
        state.calls.register(session).unwrap();

        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/calls", web::get().to(list_calls))
                .route("/calls/{id}", web::get().to(get_call))
                .route("/calls/{id}", web::delete().to(end_call)),
        )
        .await;

        let req = test::TestRequest::get().uri("/calls").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["summary"]["total_calls"], 1);

        let req = test::TestRequest::get().uri("/calls/call-42").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "connecting");

        let req = test::TestRequest::delete().uri("/calls/call-42").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "ended");
        assert_eq!(state.calls.active_count(), 0);

        let req = test::TestRequest::get().uri("/calls/call-42").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
