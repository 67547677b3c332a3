use crate::collect::DicomInfo;
use crate::parts::{
    DicomPart, HeaderPart, StreamEncoding, StreamError, ValueChunkPart, pad_value, standard_vr,
    trim_value,
};
use crate::pipeline::PartFlow;
use crate::uids::{anonymous_patient_id, anonymous_patient_name, create_uid};
use bytes::Bytes;
use database::anonymization_meta::AnonymizationKeyEntity;
use dicom_core::{Tag, VR};
use dicom_dictionary_std::tags;
use std::collections::HashMap;
use std::sync::LazyLock;

pub const DEIDENTIFICATION_METHOD_DESCRIPTION: &str =
    "Basic Application Confidentiality Profile";

// 字典里没有稳定常量名的旧属性
const OTHER_PATIENT_IDS: Tag = Tag(0x0010, 0x1000);

/// 标准属性表里的处理动作. CLEAN/DUMMY 按置空执行,
/// REMOVE_OR_ZERO 按删除执行, 这是既有实现保留下来的收紧语义.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnonymizationAction {
    Remove,
    Zero,
    ReplaceUid,
    Clean,
    Dummy,
    RemoveOrZero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveAction {
    Remove,
    Zero,
    ReplaceUid,
}

impl AnonymizationAction {
    pub fn effective(self) -> EffectiveAction {
        match self {
            AnonymizationAction::Remove | AnonymizationAction::RemoveOrZero => {
                EffectiveAction::Remove
            }
            AnonymizationAction::Zero
            | AnonymizationAction::Clean
            | AnonymizationAction::Dummy => EffectiveAction::Zero,
            AnonymizationAction::ReplaceUid => EffectiveAction::ReplaceUid,
        }
    }
}

/// 基本保密档案的属性动作表. 身份五元组和出生日期不在表里,
/// 它们由化名上下文单独处理.
pub static BASIC_PROFILE: LazyLock<HashMap<Tag, AnonymizationAction>> = LazyLock::new(|| {
    use AnonymizationAction::*;
    let entries: &[(Tag, AnonymizationAction)] = &[
        (tags::INSTANCE_CREATOR_UID, ReplaceUid),
        (tags::STUDY_DATE, Zero),
        (tags::SERIES_DATE, RemoveOrZero),
        (tags::ACQUISITION_DATE, RemoveOrZero),
        (tags::CONTENT_DATE, Zero),
        (tags::STUDY_TIME, Zero),
        (tags::SERIES_TIME, RemoveOrZero),
        (tags::ACQUISITION_TIME, RemoveOrZero),
        (tags::CONTENT_TIME, Zero),
        (tags::ACCESSION_NUMBER, Zero),
        (tags::INSTITUTION_NAME, Remove),
        (tags::INSTITUTION_ADDRESS, Remove),
        (tags::REFERRING_PHYSICIAN_NAME, Zero),
        (tags::REFERRING_PHYSICIAN_ADDRESS, Remove),
        (tags::REFERRING_PHYSICIAN_TELEPHONE_NUMBERS, Remove),
        (tags::STATION_NAME, Remove),
        (tags::STUDY_DESCRIPTION, Clean),
        (tags::SERIES_DESCRIPTION, Clean),
        (tags::INSTITUTIONAL_DEPARTMENT_NAME, Remove),
        (tags::PHYSICIANS_OF_RECORD, Remove),
        (tags::PERFORMING_PHYSICIAN_NAME, Remove),
        (tags::NAME_OF_PHYSICIANS_READING_STUDY, Remove),
        (tags::OPERATORS_NAME, Remove),
        (tags::ADMITTING_DIAGNOSES_DESCRIPTION, Remove),
        (tags::REFERENCED_STUDY_SEQUENCE, Remove),
        (tags::REFERENCED_PERFORMED_PROCEDURE_STEP_SEQUENCE, Remove),
        (tags::REFERENCED_PATIENT_SEQUENCE, Remove),
        (tags::REFERENCED_IMAGE_SEQUENCE, Remove),
        (tags::DERIVATION_DESCRIPTION, Remove),
        (tags::SOURCE_IMAGE_SEQUENCE, Remove),
        (tags::IRRADIATION_EVENT_UID, ReplaceUid),
        (tags::PATIENT_BIRTH_TIME, Remove),
        (tags::PATIENT_SEX, Zero),
        (OTHER_PATIENT_IDS, Remove),
        (tags::OTHER_PATIENT_NAMES, Remove),
        (tags::PATIENT_AGE, Remove),
        (tags::PATIENT_SIZE, Remove),
        (tags::PATIENT_WEIGHT, Remove),
        (tags::PATIENT_ADDRESS, Remove),
        (tags::PATIENT_MOTHER_BIRTH_NAME, Remove),
        (tags::PATIENT_TELEPHONE_NUMBERS, Remove),
        (tags::ETHNIC_GROUP, Remove),
        (tags::OCCUPATION, Remove),
        (tags::ADDITIONAL_PATIENT_HISTORY, Remove),
        (tags::PATIENT_COMMENTS, Remove),
        (tags::DEVICE_SERIAL_NUMBER, Dummy),
        (tags::PROTOCOL_NAME, Dummy),
        (tags::STUDY_ID, Zero),
        (tags::SYNCHRONIZATION_FRAME_OF_REFERENCE_UID, ReplaceUid),
        (tags::IMAGE_COMMENTS, Remove),
        (tags::REQUESTING_PHYSICIAN, Remove),
        (tags::REQUESTED_PROCEDURE_DESCRIPTION, Remove),
        (tags::PERFORMED_PROCEDURE_STEP_START_DATE, Remove),
        (tags::PERFORMED_PROCEDURE_STEP_START_TIME, Remove),
        (tags::PERFORMED_PROCEDURE_STEP_ID, Remove),
        (tags::PERFORMED_PROCEDURE_STEP_DESCRIPTION, Remove),
        (tags::UID, ReplaceUid),
        (tags::CONTENT_SEQUENCE, Remove),
        (tags::STORAGE_MEDIA_FILE_SET_UID, ReplaceUid),
        (tags::REFERENCED_FRAME_OF_REFERENCE_UID, ReplaceUid),
        (tags::RELATED_FRAME_OF_REFERENCE_UID, ReplaceUid),
    ];
    entries.iter().copied().collect()
});

/// 一次发送使用的化名集合. 同一病人/检查/序列复用同一份上下文,
/// 往返才能保持无损.
#[derive(Debug, Clone)]
pub struct AnonymizationContext {
    pub anon_patient_name: String,
    pub anon_patient_id: String,
    pub anon_study_instance_uid: String,
    pub anon_series_instance_uid: String,
    pub anon_sop_instance_uid: String,
    pub anon_frame_of_reference_uid: String,
}

impl AnonymizationContext {
    /// 首次遇到这组标识时生成全新化名
    pub fn fresh(info: &DicomInfo) -> Self {
        Self {
            anon_patient_name: anonymous_patient_name(
                info.string(tags::PATIENT_SEX),
                info.string(tags::PATIENT_AGE),
            ),
            anon_patient_id: anonymous_patient_id(),
            anon_study_instance_uid: create_uid(),
            anon_series_instance_uid: create_uid(),
            anon_sop_instance_uid: create_uid(),
            anon_frame_of_reference_uid: create_uid(),
        }
    }

    /// 复用已有映射的化名, SOP 实例一图一名
    pub fn from_key(key: &AnonymizationKeyEntity) -> Self {
        Self {
            anon_patient_name: key.anon_patient_name.clone(),
            anon_patient_id: key.anon_patient_id.clone(),
            anon_study_instance_uid: key.anon_study_instance_uid.clone(),
            anon_series_instance_uid: key.anon_series_instance_uid.clone(),
            anon_sop_instance_uid: create_uid(),
            anon_frame_of_reference_uid: if key.anon_frame_of_reference_uid.is_empty() {
                create_uid()
            } else {
                key.anon_frame_of_reference_uid.clone()
            },
        }
    }
}

/// 发送前由原始属性与化名上下文拼出映射行
pub fn build_anonymization_key(
    info: &DicomInfo,
    ctx: &AnonymizationContext,
    image_id: i64,
    created: i64,
) -> AnonymizationKeyEntity {
    AnonymizationKeyEntity {
        id: 0,
        created,
        image_id,
        patient_name: info.patient_name(),
        anon_patient_name: ctx.anon_patient_name.clone(),
        patient_id: info.patient_id(),
        anon_patient_id: ctx.anon_patient_id.clone(),
        patient_birth_date: info.string_or_empty(tags::PATIENT_BIRTH_DATE),
        study_instance_uid: info.study_instance_uid(),
        anon_study_instance_uid: ctx.anon_study_instance_uid.clone(),
        study_description: info.string_or_empty(tags::STUDY_DESCRIPTION),
        study_id: info.string_or_empty(tags::STUDY_ID),
        accession_number: info.string_or_empty(tags::ACCESSION_NUMBER),
        series_instance_uid: info.series_instance_uid(),
        anon_series_instance_uid: ctx.anon_series_instance_uid.clone(),
        series_description: info.string_or_empty(tags::SERIES_DESCRIPTION),
        protocol_name: info.string_or_empty(tags::PROTOCOL_NAME),
        frame_of_reference_uid: info.frame_of_reference_uid(),
        anon_frame_of_reference_uid: ctx.anon_frame_of_reference_uid.clone(),
        sop_instance_uid: info.sop_instance_uid(),
        anon_sop_instance_uid: ctx.anon_sop_instance_uid.clone(),
    }
}

#[derive(Debug)]
enum ValueState {
    Pass,
    Drop,
    BufferUid { header: HeaderPart, buf: Vec<u8> },
}

/// 匿名化阶段: 按动作表逐元素改写, 身份属性换成化名,
/// 并插入 PatientIdentityRemoved / DeidentificationMethod.
pub struct AnonymizationFlow {
    ctx: AnonymizationContext,
    uid_map: HashMap<String, String>,
    pending_insertions: Vec<(Tag, VR, String)>,
    value_state: ValueState,
    skip_depth: usize,
    seq_depth: usize,
    encoding: StreamEncoding,
}

impl AnonymizationFlow {
    pub fn new(ctx: AnonymizationContext) -> Self {
        Self {
            ctx,
            uid_map: HashMap::new(),
            pending_insertions: vec![
                (tags::PATIENT_IDENTITY_REMOVED, VR::CS, "YES".to_string()),
                (
                    tags::DEIDENTIFICATION_METHOD,
                    VR::LO,
                    DEIDENTIFICATION_METHOD_DESCRIPTION.to_string(),
                ),
            ],
            value_state: ValueState::Pass,
            skip_depth: 0,
            seq_depth: 0,
            encoding: StreamEncoding::EXPLICIT_LE,
        }
    }

    /// 身份属性的定向替换值. 返回 None 表示交给动作表.
    fn identity_replacement(&mut self, tag: Tag) -> Option<(VR, String)> {
        match tag {
            tags::PATIENT_NAME => Some((VR::PN, self.ctx.anon_patient_name.clone())),
            tags::PATIENT_ID => Some((VR::LO, self.ctx.anon_patient_id.clone())),
            tags::PATIENT_BIRTH_DATE => Some((VR::DA, String::new())),
            tags::STUDY_INSTANCE_UID => {
                Some((VR::UI, self.ctx.anon_study_instance_uid.clone()))
            }
            tags::SERIES_INSTANCE_UID => {
                Some((VR::UI, self.ctx.anon_series_instance_uid.clone()))
            }
            tags::SOP_INSTANCE_UID | tags::MEDIA_STORAGE_SOP_INSTANCE_UID => {
                Some((VR::UI, self.ctx.anon_sop_instance_uid.clone()))
            }
            tags::FRAME_OF_REFERENCE_UID => {
                Some((VR::UI, self.ctx.anon_frame_of_reference_uid.clone()))
            }
            tags::PATIENT_IDENTITY_REMOVED => {
                self.pending_insertions.retain(|(t, _, _)| *t != tag);
                Some((VR::CS, "YES".to_string()))
            }
            tags::DEIDENTIFICATION_METHOD => {
                self.pending_insertions.retain(|(t, _, _)| *t != tag);
                Some((VR::LO, DEIDENTIFICATION_METHOD_DESCRIPTION.to_string()))
            }
            _ => None,
        }
    }

    fn emit_replaced(&self, tag: Tag, vr: VR, value: &str, out: &mut Vec<DicomPart>) {
        let bytes = pad_value(value, vr);
        out.push(DicomPart::Header(HeaderPart::new(
            tag,
            vr,
            bytes.len() as u32,
            self.encoding,
        )));
        out.push(DicomPart::ValueChunk(ValueChunkPart {
            bytes: Bytes::from(bytes),
            last: true,
        }));
    }

    fn flush_insertions_before(&mut self, tag: Tag, out: &mut Vec<DicomPart>) {
        if self.seq_depth > 0 || tag.group() == 0x0002 {
            return;
        }
        let mut remaining = Vec::new();
        let pending = std::mem::take(&mut self.pending_insertions);
        for (insert_tag, vr, value) in pending {
            if insert_tag < tag {
                self.emit_replaced(insert_tag, vr, &value, out);
            } else {
                remaining.push((insert_tag, vr, value));
            }
        }
        self.pending_insertions = remaining;
    }
}

impl PartFlow for AnonymizationFlow {
    fn on_part(&mut self, part: DicomPart, out: &mut Vec<DicomPart>) -> Result<(), StreamError> {
        match part {
            DicomPart::Header(header) => {
                if self.skip_depth > 0 {
                    self.value_state = ValueState::Drop;
                    return Ok(());
                }
                self.encoding = header.encoding;
                self.flush_insertions_before(header.tag, out);

                if let Some((vr, value)) = self.identity_replacement(header.tag) {
                    self.emit_replaced(header.tag, vr, &value, out);
                    self.value_state = ValueState::Drop;
                    return Ok(());
                }

                match BASIC_PROFILE.get(&header.tag).map(|a| a.effective()) {
                    Some(EffectiveAction::Remove) => {
                        self.value_state = ValueState::Drop;
                    }
                    Some(EffectiveAction::Zero) => {
                        self.emit_replaced(header.tag, header.vr, "", out);
                        self.value_state = ValueState::Drop;
                    }
                    Some(EffectiveAction::ReplaceUid) => {
                        self.value_state = ValueState::BufferUid {
                            header,
                            buf: Vec::new(),
                        };
                    }
                    None => {
                        out.push(DicomPart::Header(header));
                        self.value_state = ValueState::Pass;
                    }
                }
            }
            DicomPart::ValueChunk(chunk) => match &mut self.value_state {
                ValueState::Pass => {
                    if self.skip_depth == 0 {
                        out.push(DicomPart::ValueChunk(chunk));
                    }
                }
                ValueState::Drop => {
                    if chunk.last {
                        self.value_state = ValueState::Pass;
                    }
                }
                ValueState::BufferUid { buf, .. } => {
                    buf.extend_from_slice(&chunk.bytes);
                    if chunk.last {
                        if let ValueState::BufferUid { header, buf } =
                            std::mem::replace(&mut self.value_state, ValueState::Pass)
                        {
                            let original = trim_value(&buf);
                            let replaced = self
                                .uid_map
                                .entry(original)
                                .or_insert_with(create_uid)
                                .clone();
                            self.emit_replaced(header.tag, header.vr, &replaced, out);
                        }
                    }
                }
            },
            DicomPart::SequenceStart { tag, length, encoding } => {
                if self.skip_depth > 0 {
                    self.skip_depth += 1;
                    return Ok(());
                }
                self.encoding = encoding;
                self.flush_insertions_before(tag, out);
                match BASIC_PROFILE.get(&tag).map(|a| a.effective()) {
                    // 序列级动作一律整体剪除
                    Some(EffectiveAction::Remove) | Some(EffectiveAction::Zero) => {
                        self.skip_depth = 1;
                    }
                    _ => {
                        out.push(DicomPart::SequenceStart { tag, length, encoding });
                        self.seq_depth += 1;
                    }
                }
            }
            DicomPart::SequenceDelimitation => {
                if self.skip_depth > 0 {
                    self.skip_depth -= 1;
                    return Ok(());
                }
                self.seq_depth = self.seq_depth.saturating_sub(1);
                out.push(DicomPart::SequenceDelimitation);
            }
            DicomPart::Item { length } => {
                if self.skip_depth == 0 {
                    out.push(DicomPart::Item { length });
                }
            }
            DicomPart::ItemDelimitation => {
                if self.skip_depth == 0 {
                    out.push(DicomPart::ItemDelimitation);
                }
            }
            DicomPart::FragmentsStart(header) => {
                // 像素数据之前把剩余的插入项全部补上
                self.flush_insertions_before(header.tag, out);
                self.seq_depth += 1;
                out.push(DicomPart::FragmentsStart(header));
            }
            other => out.push(other),
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<DicomPart>) -> Result<(), StreamError> {
        let pending = std::mem::take(&mut self.pending_insertions);
        for (tag, vr, value) in pending {
            self.emit_replaced(tag, vr, &value, out);
        }
        Ok(())
    }
}

/// 隐式流里插入元素时的缺省 VR
pub fn vr_for_insert(tag: Tag) -> VR {
    standard_vr(tag).unwrap_or(VR::LO)
}
