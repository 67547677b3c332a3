use crate::parts::{
    DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN, DicomMetaInfo, EXPLICIT_VR_BIG_ENDIAN,
    EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN, StreamError,
};
use dicom_dictionary_std::uids;

/// 允许接收的 (SOP类, 传输语法) 组合
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationContext {
    pub sop_class_uid: String,
    pub transfer_syntax_uid: String,
}

impl ValidationContext {
    pub fn new(sop_class_uid: &str, transfer_syntax_uid: &str) -> Self {
        Self {
            sop_class_uid: sop_class_uid.to_string(),
            transfer_syntax_uid: transfer_syntax_uid.to_string(),
        }
    }
}

/// 缺省白名单: 常见影像 SOP 类乘以四种标准传输语法
pub fn default_contexts() -> Vec<ValidationContext> {
    let sop_classes = [
        uids::COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
        uids::CT_IMAGE_STORAGE,
        uids::ENHANCED_CT_IMAGE_STORAGE,
        uids::MR_IMAGE_STORAGE,
        uids::ENHANCED_MR_IMAGE_STORAGE,
        uids::ULTRASOUND_IMAGE_STORAGE,
        uids::ULTRASOUND_MULTI_FRAME_IMAGE_STORAGE,
        uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
        uids::NUCLEAR_MEDICINE_IMAGE_STORAGE,
        uids::POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE,
    ];
    let syntaxes = [
        IMPLICIT_VR_LITTLE_ENDIAN,
        EXPLICIT_VR_LITTLE_ENDIAN,
        DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN,
        EXPLICIT_VR_BIG_ENDIAN,
    ];

    let mut contexts = Vec::with_capacity(sop_classes.len() * syntaxes.len());
    for sop_class in sop_classes {
        for syntax in syntaxes {
            contexts.push(ValidationContext::new(sop_class, syntax));
        }
    }
    contexts
}

/// 白名单校验. 不在名单里的组合属于永久性拒绝.
pub fn validate_context(
    meta: &DicomMetaInfo,
    contexts: &[ValidationContext],
) -> Result<(), StreamError> {
    let accepted = contexts.iter().any(|c| {
        c.sop_class_uid == meta.media_storage_sop_class_uid
            && c.transfer_syntax_uid == meta.transfer_syntax_uid
    });
    if accepted {
        Ok(())
    } else {
        Err(StreamError::Validation(format!(
            "The presentation context [SOPClassUID = {}, TransferSyntaxUID = {}] is not supported",
            meta.media_storage_sop_class_uid, meta.transfer_syntax_uid
        )))
    }
}
