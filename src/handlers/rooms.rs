use crate::rooms::store::{fetch_messages, NewMessage};
use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

pub async fn list_messages(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let room_id = path.into_inner();
    let messages = fetch_messages(state.rooms.as_ref(), &room_id).await?;

    Ok(HttpResponse::Ok().json(json!({
        "room_id": room_id,
        "count": messages.len(),
        "messages": messages
    })))
}

pub async fn post_message(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<NewMessage>,
) -> Result<HttpResponse, AppError> {
    let room_id = path.into_inner();
    let message = state.rooms.publish(&room_id, body.into_inner()).await?;

    info!(room = %room_id, message_id = %message.id, sender = %message.sender_name, "Message posted");
    Ok(HttpResponse::Created().json(message))
}
