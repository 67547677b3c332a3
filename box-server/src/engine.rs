use crate::app_state::AppState;
use common::storage::{StorageError, StorageService};
use common::utils::now_millis;
use database::dbprovider::DbError;
use database::transfer_meta::OutgoingTransactionImage;
use dicom_core::Tag;
use dicom_streams::anonymization::{AnonymizationContext, build_anonymization_key};
use dicom_streams::modify::TagModification;
use dicom_streams::parts::StreamError;
use dicom_streams::pipeline::{anonymize_dicom_data, collect_identifiers};
use slog::info;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Image data missing: {0}")]
    ImageMissing(String),

    #[error("DICOM stream failed: {0}")]
    Stream(#[from] StreamError),

    #[error("Database failed: {0}")]
    Db(#[from] DbError),

    #[error("Storage failed: {0}")]
    Storage(StorageError),
}

impl EngineError {
    /// 永久性失败把传输打成 FAILED, 其余退回 WAITING 等重试
    pub fn is_permanent(&self) -> bool {
        match self {
            EngineError::ImageMissing(_) | EngineError::Stream(_) => true,
            EngineError::Db(_) => false,
            EngineError::Storage(_) => false,
        }
    }
}

fn tag_from_i64(value: i64) -> Tag {
    Tag(((value >> 16) & 0xFFFF) as u16, (value & 0xFFFF) as u16)
}

/// 为一个待发影像产出匿名化字节.
/// 化名按既有映射复用: 原始的病人/检查/序列都对上才算同一组,
/// 对不上才生成新化名并落一行新映射.
pub async fn anonymized_image_data(
    state: &AppState,
    work: &OutgoingTransactionImage,
) -> Result<Vec<u8>, EngineError> {
    let image_name = StorageService::image_name(work.image.image_id);
    let data = state.storage.read_file(&image_name).await.map_err(|e| match e {
        StorageError::NotFound(name) => EngineError::ImageMissing(name),
        other => EngineError::Storage(other),
    })?;

    let info = collect_identifiers(&data)?;

    let candidates = state
        .anonymization
        .query_protected_keys(&info.patient_name(), &info.patient_id())
        .await?;
    let existing = candidates.iter().find(|key| {
        key.study_instance_uid == info.study_instance_uid()
            && key.series_instance_uid == info.series_instance_uid()
    });

    let ctx = match existing {
        Some(key) => AnonymizationContext::from_key(key),
        None => AnonymizationContext::fresh(&info),
    };

    if existing.is_none() {
        let key = build_anonymization_key(&info, &ctx, work.image.image_id, now_millis());
        state.anonymization.insert_anonymization_key(key).await?;
        info!(
            state.log,
            "Inserted anonymization key for image {}", work.image.image_id
        );
    }

    let tag_values = state
        .transfer
        .tag_values_for_outgoing_image(work.image.id)
        .await?;
    let modifications: Vec<TagModification> = tag_values
        .iter()
        .map(|tv| TagModification::new(tag_from_i64(tv.tag), tv.value.clone(), true))
        .collect();

    Ok(anonymize_dicom_data(&data, ctx, modifications)?)
}
