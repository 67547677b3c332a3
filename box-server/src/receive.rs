use crate::app_state::AppState;
use common::events::DomainEvent;
use common::storage::StorageService;
use common::utils::now_millis;
use database::transfer_meta::{BoxEntity, IncomingTransactionEntity};
use dicom_streams::collect::{AttributeCollector, TAGS_TO_STORE};
use dicom_streams::harmonization::HarmonizationFlow;
use dicom_streams::parts::StreamError;
use dicom_streams::pipeline::{InjectKeyValuesFlow, PartFlow, PartPipeline, collect_identifiers};
use dicom_streams::validation::validate_context;
use dicom_streams::writer::DicomPartWriter;
use slog::{info, warn};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReceiveError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Internal(String),
}

impl From<StreamError> for ReceiveError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Validation(msg) => ReceiveError::Validation(msg),
            StreamError::Parse(msg) => ReceiveError::Validation(msg),
            StreamError::Deflate(msg) => ReceiveError::Validation(msg),
        }
    }
}

/// 接收一张影像的完整路径, /incoming 控制器和轮询工作任务共用.
/// 回迁管道一遍走完: 字节逐块进临时对象, 元数据同步收集,
/// 编目与计数更新落库后临时对象原子转正.
pub async fn receive_image(
    state: &AppState,
    sender: &BoxEntity,
    outgoing_transaction_id: i64,
    sequence_number: i64,
    total_image_count: i64,
    data: &[u8],
) -> Result<IncomingTransactionEntity, ReceiveError> {
    let identifiers = collect_identifiers(data)?;
    let meta = identifiers
        .meta
        .clone()
        .ok_or_else(|| ReceiveError::Validation("missing file meta information".to_string()))?;
    validate_context(&meta, &state.contexts)?;

    // 只有带匿名标记的对象才查回迁钥匙
    let key_match = if identifiers.identity_removed() {
        state
            .anonymization
            .lookup_for_anonymous_image(
                &identifiers.patient_name(),
                &identifiers.patient_id(),
                &identifiers.study_instance_uid(),
                &identifiers.series_instance_uid(),
                &identifiers.sop_instance_uid(),
            )
            .await
            .map_err(|e| ReceiveError::Internal(e.to_string()))?
    } else {
        None
    };

    let tmp_name = StorageService::tmp_name();
    let mut sink = state
        .storage
        .file_sink(&tmp_name)
        .await
        .map_err(|e| ReceiveError::Internal(e.to_string()))?;

    // 单遍管道: 储存分支和元数据分支消费同一个部件序列, 不会乱序
    let flows: Vec<Box<dyn PartFlow + Send>> = vec![
        Box::new(InjectKeyValuesFlow::new(key_match)),
        Box::new(HarmonizationFlow::new()),
    ];
    let mut writer = DicomPartWriter::new();
    let mut collector = AttributeCollector::new(TAGS_TO_STORE);

    let pipeline = PartPipeline::new(bytes::Bytes::copy_from_slice(data), flows);
    for part in pipeline {
        let part = match part {
            Ok(part) => part,
            Err(e) => {
                state.storage.schedule_tmp_cleanup(&tmp_name, state.log.clone());
                return Err(e.into());
            }
        };
        if let Err(e) = writer.feed(&part) {
            state.storage.schedule_tmp_cleanup(&tmp_name, state.log.clone());
            return Err(e.into());
        }
        collector.feed(&part);
        let pending = writer.take_pending();
        if !pending.is_empty() {
            if let Err(e) = sink.write_chunk(&pending).await {
                state.storage.schedule_tmp_cleanup(&tmp_name, state.log.clone());
                return Err(ReceiveError::Internal(e.to_string()));
            }
        }
    }

    let finish_result = async {
        let rest = writer.finish().map_err(|e| ReceiveError::Internal(e.to_string()))?;
        if !rest.is_empty() {
            sink.write_chunk(&rest)
                .await
                .map_err(|e| ReceiveError::Internal(e.to_string()))?;
        }
        sink.finish()
            .await
            .map_err(|e| ReceiveError::Internal(e.to_string()))
    }
    .await;
    if let Err(e) = finish_result {
        state.storage.schedule_tmp_cleanup(&tmp_name, state.log.clone());
        return Err(e);
    }

    let attributes = collector.into_info();
    let sop_instance_uid = attributes.sop_instance_uid();
    if sop_instance_uid.is_empty() {
        state.storage.schedule_tmp_cleanup(&tmp_name, state.log.clone());
        return Err(ReceiveError::Validation(
            "received object carries no SOP instance UID".to_string(),
        ));
    }

    let result = async {
        let (record, overwrite) = state
            .images
            .insert_or_get(
                &attributes.patient_id(),
                &attributes.patient_name(),
                &attributes.study_instance_uid(),
                &attributes.series_instance_uid(),
                &sop_instance_uid,
                now_millis(),
            )
            .await
            .map_err(|e| ReceiveError::Internal(e.to_string()))?;

        let transaction = state
            .transfer
            .update_incoming(
                sender.id,
                &sender.name,
                outgoing_transaction_id,
                sequence_number,
                total_image_count,
                record.id,
                overwrite,
                now_millis(),
            )
            .await
            .map_err(|e| ReceiveError::Internal(e.to_string()))?;

        state
            .storage
            .move_file(&tmp_name, &StorageService::image_name(record.id))
            .await
            .map_err(|e| ReceiveError::Internal(e.to_string()))?;

        Ok((record, overwrite, transaction))
    }
    .await;

    match result {
        Ok((record, overwrite, transaction)) => {
            state.events.publish(DomainEvent::MetaDataAdded {
                image_id: record.id,
                overwrite,
            });
            info!(
                state.log,
                "Received image {} of {} for incoming transaction {} from box {}",
                sequence_number,
                total_image_count,
                transaction.outgoing_transaction_id,
                sender.name
            );
            Ok(transaction)
        }
        Err(e) => {
            warn!(state.log, "Receive failed, scheduling temp cleanup: {}", e);
            state.storage.schedule_tmp_cleanup(&tmp_name, state.log.clone());
            Err(e)
        }
    }
}
