use crate::app_state::AppState;
use crate::poll_worker::run_poll_worker;
use crate::push_worker::run_push_worker;
use common::events::DomainEvent;
use common::utils::now_millis;
use database::transfer_meta::BoxSendMethod;
use slog::{error, info, warn};
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};

/// 监督任务: 启动时为每个已知节点拉起工作任务, 之后周期性地
/// 刷新在线状态, 把停滞的 PROCESSING 传输退回 WAITING,
/// 并按节点表的增删对账工作任务.
pub fn start(state: AppState) {
    let tick_state = state.clone();
    tokio::spawn(async move {
        let mut workers: HashMap<i64, JoinHandle<()>> = HashMap::new();
        let mut ticker = interval(Duration::from_secs(tick_state.box_config.poll_interval_secs));
        loop {
            ticker.tick().await;
            supervisor_tick(&tick_state, &mut workers).await;
        }
    });

    tokio::spawn(async move {
        run_event_loop(state).await;
    });
}

async fn supervisor_tick(state: &AppState, workers: &mut HashMap<i64, JoinHandle<()>>) {
    let timeout_millis = (state.box_config.box_timeout_secs * 1000) as i64;
    if let Err(e) = state
        .transfer
        .update_status_for_boxes_and_transactions(now_millis(), timeout_millis)
        .await
    {
        error!(state.log, "Status refresh failed: {}", e);
    }

    let boxes = match state.transfer.list_boxes().await {
        Ok(boxes) => boxes,
        Err(e) => {
            error!(state.log, "Failed to list boxes: {}", e);
            return;
        }
    };

    // 新节点拉起工作任务
    for remote in &boxes {
        if !workers.contains_key(&remote.id) {
            let handle = match remote.send_method {
                BoxSendMethod::Push => {
                    tokio::spawn(run_push_worker(state.clone(), remote.clone()))
                }
                BoxSendMethod::Poll => {
                    // 没有回连地址的 POLL 节点是纯接收方, 由对端来拉
                    if remote.base_url.is_empty() {
                        continue;
                    }
                    tokio::spawn(run_poll_worker(state.clone(), remote.clone()))
                }
            };
            info!(state.log, "Spawned worker for box {}", remote.name);
            workers.insert(remote.id, handle);
        }
    }

    // 删掉的节点回收工作任务
    let known: Vec<i64> = boxes.iter().map(|b| b.id).collect();
    let stale: Vec<i64> = workers
        .keys()
        .copied()
        .filter(|id| !known.contains(id))
        .collect();
    for box_id in stale {
        if let Some(handle) = workers.remove(&box_id) {
            handle.abort();
            info!(state.log, "Stopped worker for deleted box {}", box_id);
        }
    }
}

/// 领域事件订阅: 影像删除后清引用行和存储对象, 按配置清化名映射
async fn run_event_loop(state: AppState) {
    let mut events = state.events.subscribe();
    loop {
        match events.recv().await {
            Ok(DomainEvent::ImagesDeleted(image_ids)) => {
                if let Err(e) = state.transfer.remove_image_references(&image_ids).await {
                    warn!(state.log, "Failed to remove image references: {}", e);
                }
                if let Err(e) = state.images.delete_images(&image_ids).await {
                    warn!(state.log, "Failed to remove image records: {}", e);
                }
                if let Err(e) = state.storage.delete_from_storage(&image_ids).await {
                    warn!(state.log, "Failed to remove stored images: {}", e);
                }
                if state.box_config.purge_empty_anonymization_keys {
                    if let Err(e) = state.anonymization.delete_for_image_ids(&image_ids).await {
                        warn!(state.log, "Failed to purge anonymization keys: {}", e);
                    }
                }
            }
            Ok(DomainEvent::SourceDeleted(source)) => {
                info!(
                    state.log,
                    "Source {} {} deleted", source.source_type, source.source_id
                );
            }
            Ok(DomainEvent::MetaDataAdded { .. }) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(state.log, "Event loop lagged, skipped {} events", skipped);
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                return;
            }
        }
    }
}
