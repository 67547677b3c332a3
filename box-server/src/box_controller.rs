use crate::app_state::AppState;
use actix_web::{HttpResponse, Result, delete, get, post, web};
use common::events::{DomainEvent, SourceRef, SourceType};
use common::utils::now_millis;
use database::dbprovider::DbError;
use database::transfer_meta::BoxSendMethod;
use serde::Deserialize;
use slog::{error, info};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct RemoteBoxConnectionData {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "base_url")]
    pub base_url: String,
    #[serde(rename = "token")]
    pub token: String,
}

/// 登记一个要推送的远端节点, 令牌由对端签发
#[post("/boxes")]
pub async fn create_push_box(
    state: web::Data<AppState>,
    body: web::Json<RemoteBoxConnectionData>,
) -> Result<HttpResponse> {
    match state
        .transfer
        .insert_box(&body.name, &body.token, &body.base_url, BoxSendMethod::Push)
        .await
    {
        Ok(created) => {
            info!(state.log, "Added push box {} -> {}", created.name, created.base_url);
            Ok(HttpResponse::Created().json(created))
        }
        Err(DbError::AlreadyExists) => {
            Ok(HttpResponse::Conflict().body("box name already in use"))
        }
        Err(e) => {
            error!(state.log, "Failed to insert box: {}", e);
            Ok(HttpResponse::InternalServerError().body("database error"))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PollBoxConnectionData {
    #[serde(rename = "name")]
    pub name: String,
}

/// 给轮询的对端签发连接: 生成新令牌, 对端凭它访问 /outgoing 端点
#[post("/boxes/connect")]
pub async fn create_poll_box(
    state: web::Data<AppState>,
    body: web::Json<PollBoxConnectionData>,
) -> Result<HttpResponse> {
    let token = Uuid::new_v4().simple().to_string();
    match state
        .transfer
        .insert_box(&body.name, &token, "", BoxSendMethod::Poll)
        .await
    {
        Ok(created) => {
            info!(state.log, "Issued poll connection for box {}", created.name);
            Ok(HttpResponse::Created().json(created))
        }
        Err(DbError::AlreadyExists) => {
            Ok(HttpResponse::Conflict().body("box name already in use"))
        }
        Err(e) => {
            error!(state.log, "Failed to insert box: {}", e);
            Ok(HttpResponse::InternalServerError().body("database error"))
        }
    }
}

#[get("/boxes")]
pub async fn list_boxes(state: web::Data<AppState>) -> Result<HttpResponse> {
    match state.transfer.list_boxes().await {
        Ok(boxes) => Ok(HttpResponse::Ok().json(boxes)),
        Err(e) => {
            error!(state.log, "Failed to list boxes: {}", e);
            Ok(HttpResponse::InternalServerError().body("database error"))
        }
    }
}

/// 删除节点并级联删掉它的发送队列, 工作任务由监督器下一拍回收
#[delete("/boxes/{id}")]
pub async fn delete_box(state: web::Data<AppState>, path: web::Path<i64>) -> Result<HttpResponse> {
    let box_id = path.into_inner();
    match state.transfer.delete_box(box_id).await {
        Ok(()) => {
            state.events.publish(DomainEvent::SourceDeleted(SourceRef {
                source_type: SourceType::Box,
                source_id: box_id,
            }));
            Ok(HttpResponse::NoContent().finish())
        }
        Err(e) => {
            error!(state.log, "Failed to delete box {}: {}", box_id, e);
            Ok(HttpResponse::InternalServerError().body("database error"))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TagValueData {
    #[serde(rename = "tag")]
    pub tag: i64,
    #[serde(rename = "value")]
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct ImageTagValuesData {
    #[serde(rename = "image_id")]
    pub image_id: i64,
    #[serde(rename = "tag_values", default)]
    pub tag_values: Vec<TagValueData>,
}

/// 往一个节点发影像: 建一笔发送传输, 序号从 1 连续编
#[post("/boxes/{id}/send")]
pub async fn send_images_to_box(
    state: web::Data<AppState>,
    path: web::Path<i64>,
    body: web::Json<Vec<ImageTagValuesData>>,
) -> Result<HttpResponse> {
    let box_id = path.into_inner();
    if body.is_empty() {
        return Ok(HttpResponse::BadRequest().body("no images to send"));
    }

    let target = match state.transfer.box_by_id(box_id).await {
        Ok(Some(target)) => target,
        Ok(None) => return Ok(HttpResponse::NotFound().body("unknown box")),
        Err(e) => {
            error!(state.log, "Failed to look up box {}: {}", box_id, e);
            return Ok(HttpResponse::InternalServerError().body("database error"));
        }
    };

    let entries: Vec<(i64, Vec<(i64, String)>)> = body
        .iter()
        .map(|entry| {
            (
                entry.image_id,
                entry
                    .tag_values
                    .iter()
                    .map(|tv| (tv.tag, tv.value.clone()))
                    .collect(),
            )
        })
        .collect();

    match state
        .transfer
        .insert_outgoing_transaction_with_images(target.id, &target.name, &entries, now_millis())
        .await
    {
        Ok(transaction) => {
            info!(
                state.log,
                "Queued {} images for box {} in transaction {}",
                transaction.total_image_count,
                target.name,
                transaction.id
            );
            Ok(HttpResponse::Created().json(transaction))
        }
        Err(e) => {
            error!(state.log, "Failed to queue outgoing transaction: {}", e);
            Ok(HttpResponse::InternalServerError().body("database error"))
        }
    }
}

const TRANSACTION_LIST_LIMIT: i64 = 100;

#[get("/transactions/outgoing")]
pub async fn list_outgoing_transactions(state: web::Data<AppState>) -> Result<HttpResponse> {
    match state.transfer.list_outgoing_transactions(TRANSACTION_LIST_LIMIT).await {
        Ok(transactions) => Ok(HttpResponse::Ok().json(transactions)),
        Err(e) => {
            error!(state.log, "Failed to list outgoing transactions: {}", e);
            Ok(HttpResponse::InternalServerError().body("database error"))
        }
    }
}

#[get("/transactions/incoming")]
pub async fn list_incoming_transactions(state: web::Data<AppState>) -> Result<HttpResponse> {
    match state.transfer.list_incoming_transactions(TRANSACTION_LIST_LIMIT).await {
        Ok(transactions) => Ok(HttpResponse::Ok().json(transactions)),
        Err(e) => {
            error!(state.log, "Failed to list incoming transactions: {}", e);
            Ok(HttpResponse::InternalServerError().body("database error"))
        }
    }
}
