use crate::anonymization::vr_for_insert;
use crate::parts::{DicomPart, HeaderPart, StreamEncoding, StreamError, ValueChunkPart, pad_value};
use crate::pipeline::PartFlow;
use bytes::Bytes;
use dicom_core::Tag;
use std::collections::BTreeMap;

/// 调用方提供的属性覆盖
#[derive(Debug, Clone)]
pub struct TagModification {
    pub tag: Tag,
    pub value: String,
    pub insert_if_missing: bool,
}

impl TagModification {
    pub fn new(tag: Tag, value: impl Into<String>, insert_if_missing: bool) -> Self {
        Self {
            tag,
            value: value.into(),
            insert_if_missing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueState {
    Pass,
    Drop,
}

/// 覆盖阶段: 命中的根层元素换值, 标记了补插的在对应位置插入
pub struct ModifyFlow {
    modifications: BTreeMap<Tag, TagModification>,
    value_state: ValueState,
    seq_depth: usize,
    encoding: StreamEncoding,
}

impl ModifyFlow {
    pub fn new(modifications: Vec<TagModification>) -> Self {
        Self {
            modifications: modifications.into_iter().map(|m| (m.tag, m)).collect(),
            value_state: ValueState::Pass,
            seq_depth: 0,
            encoding: StreamEncoding::EXPLICIT_LE,
        }
    }

    fn emit_element(&self, tag: Tag, vr: dicom_core::VR, value: &str, out: &mut Vec<DicomPart>) {
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
        let due: Vec<Tag> = self
            .modifications
            .range(..tag)
            .filter(|(_, m)| m.insert_if_missing)
            .map(|(t, _)| *t)
            .collect();
        for insert_tag in due {
            if let Some(modification) = self.modifications.remove(&insert_tag) {
                self.emit_element(
                    insert_tag,
                    vr_for_insert(insert_tag),
                    &modification.value,
                    out,
                );
            }
        }
        // 排序在当前标签之前而又不准插入的覆盖已经没有目标了
        let stale: Vec<Tag> = self.modifications.range(..tag).map(|(t, _)| *t).collect();
        for tag in stale {
            self.modifications.remove(&tag);
        }
    }
}

impl PartFlow for ModifyFlow {
    fn on_part(&mut self, part: DicomPart, out: &mut Vec<DicomPart>) -> Result<(), StreamError> {
        match part {
            DicomPart::Header(header) => {
                self.encoding = header.encoding;
                self.flush_insertions_before(header.tag, out);
                if self.seq_depth == 0 {
                    if let Some(modification) = self.modifications.remove(&header.tag) {
                        self.emit_element(header.tag, header.vr, &modification.value, out);
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
        let remaining = std::mem::take(&mut self.modifications);
        for (tag, modification) in remaining {
            if modification.insert_if_missing {
                self.emit_element(tag, vr_for_insert(tag), &modification.value, out);
            }
        }
        Ok(())
    }
}
