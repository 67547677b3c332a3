use crate::app_state::AppState;
use crate::engine::anonymized_image_data;
use common::utils::now_millis;
use database::transfer_meta::{BoxEntity, TransactionStatus};
use slog::{Logger, info, o, warn};
use tokio::time::{Duration, interval};

/// PUSH 节点的常驻工作任务: 每拍把队列里能发的影像都推给对端.
/// 一笔传输内严格按序号串行, 一次只在途一张.
pub async fn run_push_worker(state: AppState, push_box: BoxEntity) {
    let log = state.log.new(o!("push-worker" => push_box.name.clone()));
    let client = reqwest::Client::new();
    let mut ticker = interval(Duration::from_secs(state.box_config.poll_interval_secs));

    info!(log, "Push worker started for box {}", push_box.base_url);
    loop {
        ticker.tick().await;
        push_round(&state, &client, &push_box, &log).await;
    }
}

async fn push_round(state: &AppState, client: &reqwest::Client, push_box: &BoxEntity, log: &Logger) {
    loop {
        let work = match state.transfer.next_outgoing_transaction_image(push_box.id).await {
            Ok(Some(work)) => work,
            Ok(None) => return,
            Err(e) => {
                warn!(log, "Failed to query outgoing queue: {}", e);
                return;
            }
        };

        let data = match anonymized_image_data(state, &work).await {
            Ok(data) => data,
            Err(e) if e.is_permanent() => {
                warn!(
                    log,
                    "Permanent failure preparing image {} of transaction {}: {}",
                    work.image.sequence_number,
                    work.transaction.id,
                    e
                );
                let _ = state
                    .transfer
                    .set_outgoing_transaction_status(
                        work.transaction.id,
                        TransactionStatus::Failed,
                        now_millis(),
                    )
                    .await;
                continue;
            }
            Err(e) => {
                warn!(log, "Transient failure preparing image data: {}", e);
                let _ = state
                    .transfer
                    .set_outgoing_transaction_status(
                        work.transaction.id,
                        TransactionStatus::Waiting,
                        now_millis(),
                    )
                    .await;
                return;
            }
        };

        let url = format!(
            "{}/incoming?transactionid={}&sequencenumber={}&totalimagecount={}&token={}",
            push_box.base_url,
            work.transaction.id,
            work.image.sequence_number,
            work.transaction.total_image_count,
            push_box.token
        );

        match client.post(&url).body(data).send().await {
            Ok(response) if response.status().is_success() => {
                let _ = state
                    .transfer
                    .update_box_online(push_box.id, true, now_millis())
                    .await;
                match state
                    .transfer
                    .mark_outgoing_image_sent(work.transaction.id, work.image.id, now_millis())
                    .await
                {
                    Ok(transaction) => {
                        info!(
                            log,
                            "Pushed image {} of {} for transaction {}",
                            transaction.sent_image_count,
                            transaction.total_image_count,
                            transaction.id
                        );
                    }
                    Err(e) => {
                        warn!(log, "Failed to record pushed image: {}", e);
                        return;
                    }
                }
            }
            Ok(response) if response.status().is_client_error() => {
                // 对端永久拒绝, 这笔传输不再重试
                warn!(
                    log,
                    "Box rejected image {} of transaction {} with status {}",
                    work.image.sequence_number,
                    work.transaction.id,
                    response.status()
                );
                let _ = state
                    .transfer
                    .update_box_online(push_box.id, true, now_millis())
                    .await;
                let _ = state
                    .transfer
                    .set_outgoing_transaction_status(
                        work.transaction.id,
                        TransactionStatus::Failed,
                        now_millis(),
                    )
                    .await;
            }
            Ok(response) => {
                warn!(
                    log,
                    "Box returned transient status {} for transaction {}",
                    response.status(),
                    work.transaction.id
                );
                let _ = state
                    .transfer
                    .set_outgoing_transaction_status(
                        work.transaction.id,
                        TransactionStatus::Waiting,
                        now_millis(),
                    )
                    .await;
                return;
            }
            Err(e) => {
                warn!(log, "Push to {} failed: {}", push_box.base_url, e);
                let _ = state
                    .transfer
                    .update_box_online(push_box.id, false, now_millis())
                    .await;
                let _ = state
                    .transfer
                    .set_outgoing_transaction_status(
                        work.transaction.id,
                        TransactionStatus::Waiting,
                        now_millis(),
                    )
                    .await;
                return;
            }
        }
    }
}
