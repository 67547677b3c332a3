use crate::app_state::AppState;
use crate::engine::anonymized_image_data;
use crate::token::extract_token;
use actix_web::{HttpRequest, HttpResponse, Result, get, post, web};
use common::utils::now_millis;
use database::transfer_meta::{
    BoxEntity, FailedOutgoingTransaction, OutgoingTransactionImage, TransactionStatus,
};
use serde::Deserialize;
use slog::{error, info, warn};

/// 轮询端点统一的令牌认证, 只放行 POLL 节点, 顺手刷新在线标志
async fn authenticate_poll_box(
    req: &HttpRequest,
    state: &web::Data<AppState>,
) -> Result<BoxEntity, HttpResponse> {
    let token = match extract_token(req) {
        Some(token) => token,
        None => return Err(HttpResponse::Unauthorized().body("missing token")),
    };
    match state.transfer.poll_box_by_token(&token).await {
        Ok(Some(poll_box)) => {
            let _ = state
                .transfer
                .update_box_online(poll_box.id, true, now_millis())
                .await;
            Ok(poll_box)
        }
        Ok(None) => Err(HttpResponse::Unauthorized().body("invalid token")),
        Err(e) => {
            error!(state.log, "Poll token lookup failed: {}", e);
            Err(HttpResponse::InternalServerError().body("token lookup failed"))
        }
    }
}

/// 轮询下一个工作单元: 有则返回 JSON, 没有返回 204
#[get("/outgoing/poll")]
pub async fn poll_outgoing(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse> {
    let poll_box = match authenticate_poll_box(&req, &state).await {
        Ok(b) => b,
        Err(resp) => return Ok(resp),
    };

    match state.transfer.next_outgoing_transaction_image(poll_box.id).await {
        Ok(Some(work)) => Ok(HttpResponse::Ok().json(work)),
        Ok(None) => Ok(HttpResponse::NoContent().finish()),
        Err(e) => {
            error!(state.log, "Failed to fetch next outgoing image: {}", e);
            Ok(HttpResponse::InternalServerError().body("database error"))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OutgoingImageQuery {
    pub transactionid: i64,
    pub imageid: i64,
}

/// 取工作单元的匿名化字节: GET /outgoing?transactionid&imageid
#[get("/outgoing")]
pub async fn fetch_outgoing_image(
    req: HttpRequest,
    query: web::Query<OutgoingImageQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let poll_box = match authenticate_poll_box(&req, &state).await {
        Ok(b) => b,
        Err(resp) => return Ok(resp),
    };

    let work = match state
        .transfer
        .outgoing_transaction_image(poll_box.id, query.transactionid, query.imageid)
        .await
    {
        Ok(Some(work)) => work,
        Ok(None) => {
            return Ok(HttpResponse::NotFound().body("unknown transaction or image"));
        }
        Err(e) => {
            error!(state.log, "Failed to look up outgoing image: {}", e);
            return Ok(HttpResponse::InternalServerError().body("database error"));
        }
    };

    match anonymized_image_data(&state, &work).await {
        Ok(data) => Ok(HttpResponse::Ok()
            .content_type("application/octet-stream")
            .body(data)),
        Err(e) if e.is_permanent() => {
            warn!(
                state.log,
                "Permanent failure serving outgoing image {}: {}", query.imageid, e
            );
            let _ = state
                .transfer
                .set_outgoing_transaction_status(
                    work.transaction.id,
                    TransactionStatus::Failed,
                    now_millis(),
                )
                .await;
            Ok(HttpResponse::NotFound().body(e.to_string()))
        }
        Err(e) => {
            error!(state.log, "Failed to produce outgoing image data: {}", e);
            Ok(HttpResponse::InternalServerError().body(e.to_string()))
        }
    }
}

/// 轮询端确认送达: POST /outgoing/done, 请求体是工作单元 JSON.
/// 重复确认是幂等的.
#[post("/outgoing/done")]
pub async fn outgoing_done(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<OutgoingTransactionImage>,
) -> Result<HttpResponse> {
    let poll_box = match authenticate_poll_box(&req, &state).await {
        Ok(b) => b,
        Err(resp) => return Ok(resp),
    };

    // 只认属于该节点的工作单元
    match state
        .transfer
        .outgoing_transaction_image(poll_box.id, body.transaction.id, body.image.id)
        .await
    {
        Ok(Some(_)) => {}
        Ok(None) => return Ok(HttpResponse::NotFound().body("unknown transaction or image")),
        Err(e) => {
            error!(state.log, "Failed to look up outgoing image: {}", e);
            return Ok(HttpResponse::InternalServerError().body("database error"));
        }
    }

    match state
        .transfer
        .mark_outgoing_image_sent(body.transaction.id, body.image.id, now_millis())
        .await
    {
        Ok(transaction) => {
            info!(
                state.log,
                "Box {} acknowledged image {} of transaction {} ({} of {} sent)",
                poll_box.name,
                body.image.sequence_number,
                transaction.id,
                transaction.sent_image_count,
                transaction.total_image_count
            );
            Ok(HttpResponse::NoContent().finish())
        }
        Err(e) => {
            error!(state.log, "Failed to mark outgoing image sent: {}", e);
            Ok(HttpResponse::InternalServerError().body("database error"))
        }
    }
}

/// 轮询端报告失败: POST /outgoing/failed
#[post("/outgoing/failed")]
pub async fn outgoing_failed(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<FailedOutgoingTransaction>,
) -> Result<HttpResponse> {
    let poll_box = match authenticate_poll_box(&req, &state).await {
        Ok(b) => b,
        Err(resp) => return Ok(resp),
    };

    warn!(
        state.log,
        "Box {} reported transaction {} failed: {}",
        poll_box.name,
        body.transaction_id,
        body.message
    );
    match state
        .transfer
        .set_outgoing_transaction_status(body.transaction_id, TransactionStatus::Failed, now_millis())
        .await
    {
        Ok(()) => Ok(HttpResponse::NoContent().finish()),
        Err(e) => {
            error!(state.log, "Failed to mark transaction failed: {}", e);
            Ok(HttpResponse::InternalServerError().body("database error"))
        }
    }
}
