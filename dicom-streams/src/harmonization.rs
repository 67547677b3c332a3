use crate::parts::{DicomPart, HeaderPart, StreamEncoding, StreamError, ValueChunkPart, pad_value};
use crate::pipeline::PartFlow;
use bytes::Bytes;
use database::anonymization_meta::{AnonymizationKeyMatch, DicomHierarchyLevel};
use dicom_core::{Tag, VR};
use dicom_dictionary_std::tags;
use std::collections::BTreeMap;

/// 回迁属性集. 每项带最低要求的命中层级, 层级不够时保持化名.
fn reverse_set(key_match: &AnonymizationKeyMatch) -> BTreeMap<Tag, (VR, String)> {
    let key = &key_match.key;
    let candidates: [(Tag, VR, DicomHierarchyLevel, &String); 11] = [
        (
            tags::PATIENT_NAME,
            VR::PN,
            DicomHierarchyLevel::Patient,
            &key.patient_name,
        ),
        (
            tags::PATIENT_ID,
            VR::LO,
            DicomHierarchyLevel::Patient,
            &key.patient_id,
        ),
        (
            tags::PATIENT_BIRTH_DATE,
            VR::DA,
            DicomHierarchyLevel::Patient,
            &key.patient_birth_date,
        ),
        (
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            DicomHierarchyLevel::Study,
            &key.study_instance_uid,
        ),
        (
            tags::STUDY_DESCRIPTION,
            VR::LO,
            DicomHierarchyLevel::Study,
            &key.study_description,
        ),
        (
            tags::STUDY_ID,
            VR::SH,
            DicomHierarchyLevel::Study,
            &key.study_id,
        ),
        (
            tags::ACCESSION_NUMBER,
            VR::SH,
            DicomHierarchyLevel::Study,
            &key.accession_number,
        ),
        (
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            DicomHierarchyLevel::Series,
            &key.series_instance_uid,
        ),
        (
            tags::SERIES_DESCRIPTION,
            VR::LO,
            DicomHierarchyLevel::Series,
            &key.series_description,
        ),
        (
            tags::PROTOCOL_NAME,
            VR::LO,
            DicomHierarchyLevel::Series,
            &key.protocol_name,
        ),
        (
            tags::FRAME_OF_REFERENCE_UID,
            VR::UI,
            DicomHierarchyLevel::Series,
            &key.frame_of_reference_uid,
        ),
    ];

    let mut set = BTreeMap::new();
    for (tag, vr, level, value) in candidates {
        if key_match.covers(level) {
            set.insert(tag, (vr, value.clone()));
        }
    }
    // 匿名标记固定翻回
    set.insert(tags::PATIENT_IDENTITY_REMOVED, (VR::CS, "NO".to_string()));
    set.insert(tags::DEIDENTIFICATION_METHOD, (VR::LO, String::new()));
    set
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueState {
    Pass,
    Drop,
}

/// 回迁阶段. 流里出现回迁钥匙并且命中之后才开始工作:
/// 已有元素换回原值, 缺失的非空原值按序补插.
pub struct HarmonizationFlow {
    replacements: BTreeMap<Tag, (VR, String)>,
    active: bool,
    value_state: ValueState,
    seq_depth: usize,
    encoding: StreamEncoding,
}

impl HarmonizationFlow {
    pub fn new() -> Self {
        Self {
            replacements: BTreeMap::new(),
            active: false,
            value_state: ValueState::Pass,
            seq_depth: 0,
            encoding: StreamEncoding::EXPLICIT_LE,
        }
    }

    fn emit_element(&self, tag: Tag, vr: VR, value: &str, out: &mut Vec<DicomPart>) {
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

    /// 补插所有排序在当前标签之前的缺失原值
    fn flush_insertions_before(&mut self, tag: Tag, out: &mut Vec<DicomPart>) {
        if !self.active || self.seq_depth > 0 || tag.group() == 0x0002 {
            return;
        }
        let due: Vec<Tag> = self
            .replacements
            .range(..tag)
            .map(|(t, _)| *t)
            .collect();
        for insert_tag in due {
            if let Some((vr, value)) = self.replacements.remove(&insert_tag) {
                if !value.is_empty() {
                    self.emit_element(insert_tag, vr, &value, out);
                }
            }
        }
    }
}

impl Default for HarmonizationFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl PartFlow for HarmonizationFlow {
    fn on_part(&mut self, part: DicomPart, out: &mut Vec<DicomPart>) -> Result<(), StreamError> {
        match part {
            DicomPart::AnonymizationKeyValues(key_part) => {
                if let Some(key_match) = &key_part.key_match {
                    self.replacements = reverse_set(key_match);
                    self.active = true;
                }
                out.push(DicomPart::AnonymizationKeyValues(key_part));
            }
            DicomPart::Header(header) => {
                self.encoding = header.encoding;
                self.flush_insertions_before(header.tag, out);
                if self.active && self.seq_depth == 0 {
                    if let Some((vr, value)) = self.replacements.remove(&header.tag) {
                        self.emit_element(header.tag, vr, &value, out);
                        self.value_state = ValueState::Drop;
                        return Ok(());
                    }
                }
                out.push(DicomPart::Header(header));
                self.value_state = ValueState::Pass;
            }
            DicomPart::ValueChunk(chunk) => match self.value_state {
                ValueState::Pass => out.push(DicomPart::ValueChunk(chunk)),
                ValueState::Drop => {
                    if chunk.last {
                        self.value_state = ValueState::Pass;
                    }
                }
            },
            DicomPart::SequenceStart { tag, length, encoding } => {
                self.flush_insertions_before(tag, out);
                self.seq_depth += 1;
                out.push(DicomPart::SequenceStart { tag, length, encoding });
            }
            DicomPart::FragmentsStart(header) => {
                self.flush_insertions_before(header.tag, out);
                self.seq_depth += 1;
                out.push(DicomPart::FragmentsStart(header));
            }
            DicomPart::SequenceDelimitation => {
                self.seq_depth = self.seq_depth.saturating_sub(1);
                out.push(DicomPart::SequenceDelimitation);
            }
            other => out.push(other),
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<DicomPart>) -> Result<(), StreamError> {
        if !self.active {
            return Ok(());
        }
        let remaining = std::mem::take(&mut self.replacements);
        for (tag, (vr, value)) in remaining {
            if !value.is_empty() || tag == tags::DEIDENTIFICATION_METHOD {
                self.emit_element(tag, vr, &value, out);
            }
        }
        Ok(())
    }
}
