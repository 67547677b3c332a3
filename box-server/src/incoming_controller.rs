use crate::app_state::AppState;
use crate::receive::{ReceiveError, receive_image};
use crate::token::extract_token;
use actix_web::{HttpRequest, HttpResponse, Result, post, web};
use futures_util::StreamExt as _;
use serde::Deserialize;
use slog::{error, info, warn};

#[derive(Debug, Deserialize)]
pub struct IncomingQuery {
    pub transactionid: i64,
    pub sequencenumber: i64,
    pub totalimagecount: i64,
}

/// 对端推送影像: POST /incoming?transactionid&sequencenumber&totalimagecount
/// 请求体是原始 DICOM 字节流, 按节点令牌认证.
#[post("/incoming")]
pub async fn receive_pushed_image(
    req: HttpRequest,
    query: web::Query<IncomingQuery>,
    state: web::Data<AppState>,
    mut payload: web::Payload,
) -> Result<HttpResponse> {
    let log = state.log.clone();

    let sender = match extract_token(&req) {
        Some(token) => match state.transfer.box_by_token(&token).await {
            Ok(Some(sender)) => sender,
            Ok(None) => {
                warn!(log, "Rejected incoming push with unknown token");
                return Ok(HttpResponse::Unauthorized().body("invalid token"));
            }
            Err(e) => {
                error!(log, "Token lookup failed: {}", e);
                return Ok(HttpResponse::InternalServerError().body("token lookup failed"));
            }
        },
        None => {
            return Ok(HttpResponse::Unauthorized().body("missing token"));
        }
    };

    // 先收完整个请求体; 校验失败也不会让对端的写入阻塞
    let mut buffer = Vec::new();
    while let Some(chunk) = payload.next().await {
        match chunk {
            Ok(data) => buffer.extend_from_slice(&data),
            Err(e) => {
                error!(log, "Error reading payload chunk: {}", e);
                return Ok(HttpResponse::InternalServerError().body("error reading data"));
            }
        }
    }

    info!(
        log,
        "Incoming push from box {}: transaction {}, image {}/{} ({} bytes)",
        sender.name,
        query.transactionid,
        query.sequencenumber,
        query.totalimagecount,
        buffer.len()
    );

    match receive_image(
        &state,
        &sender,
        query.transactionid,
        query.sequencenumber,
        query.totalimagecount,
        &buffer,
    )
    .await
    {
        Ok(transaction) => Ok(HttpResponse::Ok().json(transaction)),
        Err(ReceiveError::Validation(msg)) => {
            warn!(log, "Rejected incoming image: {}", msg);
            Ok(HttpResponse::BadRequest().body(msg))
        }
        Err(ReceiveError::Internal(msg)) => {
            error!(log, "Failed to receive incoming image: {}", msg);
            Ok(HttpResponse::InternalServerError().body(msg))
        }
    }
}
