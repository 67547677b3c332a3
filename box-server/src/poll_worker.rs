use crate::app_state::AppState;
use crate::receive::receive_image;
use common::utils::now_millis;
use database::transfer_meta::{BoxEntity, FailedOutgoingTransaction, OutgoingTransactionImage};
use slog::{Logger, info, o, warn};
use tokio::time::{Duration, interval};

/// POLL 节点的常驻工作任务: 轮询对端的发送队列,
/// 取回字节走共享的接收路径, 成功后回 ACK.
pub async fn run_poll_worker(state: AppState, poll_box: BoxEntity) {
    let log = state.log.new(o!("poll-worker" => poll_box.name.clone()));
    let client = reqwest::Client::new();
    let mut ticker = interval(Duration::from_secs(state.box_config.poll_interval_secs));

    info!(log, "Poll worker started for box {}", poll_box.base_url);
    loop {
        ticker.tick().await;
        poll_round(&state, &client, &poll_box, &log).await;
    }
}

async fn poll_round(state: &AppState, client: &reqwest::Client, poll_box: &BoxEntity, log: &Logger) {
    loop {
        let poll_url = format!("{}/outgoing/poll?token={}", poll_box.base_url, poll_box.token);
        let response = match client.get(&poll_url).send().await {
            Ok(response) => response,
            Err(e) => {
                // 失败不算一次轮询, 不刷新 last_contact, 在线标志由监督任务按超时衰减
                warn!(log, "Poll of {} failed: {}", poll_box.base_url, e);
                return;
            }
        };

        let _ = state
            .transfer
            .update_box_online(poll_box.id, true, now_millis())
            .await;

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return;
        }
        if !response.status().is_success() {
            warn!(log, "Poll returned status {}", response.status());
            return;
        }

        let work: OutgoingTransactionImage = match response.json().await {
            Ok(work) => work,
            Err(e) => {
                warn!(log, "Malformed poll response: {}", e);
                return;
            }
        };

        let fetch_url = format!(
            "{}/outgoing?transactionid={}&imageid={}&token={}",
            poll_box.base_url, work.transaction.id, work.image.id, poll_box.token
        );
        let data = match client.get(&fetch_url).send().await {
            Ok(response) if response.status().is_success() => match response.bytes().await {
                Ok(data) => data,
                Err(e) => {
                    warn!(log, "Failed to read outgoing image bytes: {}", e);
                    return;
                }
            },
            Ok(response) => {
                warn!(
                    log,
                    "Fetching outgoing image returned status {}",
                    response.status()
                );
                return;
            }
            Err(e) => {
                warn!(log, "Fetch of outgoing image failed: {}", e);
                return;
            }
        };

        match receive_image(
            state,
            poll_box,
            work.transaction.id,
            work.image.sequence_number,
            work.transaction.total_image_count,
            &data,
        )
        .await
        {
            Ok(_) => {
                let done_url =
                    format!("{}/outgoing/done?token={}", poll_box.base_url, poll_box.token);
                if let Err(e) = client.post(&done_url).json(&work).send().await {
                    // ACK 丢了也没关系, 对端会重发, 接收端是幂等的
                    warn!(log, "Failed to acknowledge received image: {}", e);
                    return;
                }
                info!(
                    log,
                    "Fetched image {} of transaction {} from box {}",
                    work.image.sequence_number,
                    work.transaction.id,
                    poll_box.name
                );
            }
            Err(e) => {
                warn!(
                    log,
                    "Failed to receive polled image {} of transaction {}: {}",
                    work.image.sequence_number,
                    work.transaction.id,
                    e
                );
                let failed_url =
                    format!("{}/outgoing/failed?token={}", poll_box.base_url, poll_box.token);
                let failure = FailedOutgoingTransaction {
                    transaction_id: work.transaction.id,
                    message: e.to_string(),
                };
                if let Err(e) = client.post(&failed_url).json(&failure).send().await {
                    warn!(log, "Failed to report transaction failure: {}", e);
                }
                return;
            }
        }
    }
}
