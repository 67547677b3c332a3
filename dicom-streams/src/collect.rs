use crate::parser::DicomParts;
use crate::parts::{DicomMetaInfo, DicomPart, HeaderPart, StreamError, trim_value};
use bytes::Bytes;
use dicom_core::{Tag, VR};
use dicom_dictionary_std::tags;
use std::collections::BTreeMap;

/// 元数据分支入库的属性白名单
pub const TAGS_TO_STORE: &[Tag] = &[
    tags::SPECIFIC_CHARACTER_SET,
    tags::SOP_CLASS_UID,
    tags::SOP_INSTANCE_UID,
    tags::STUDY_DATE,
    tags::STUDY_TIME,
    tags::ACCESSION_NUMBER,
    tags::MODALITY,
    tags::STUDY_DESCRIPTION,
    tags::SERIES_DESCRIPTION,
    tags::PATIENT_NAME,
    tags::PATIENT_ID,
    tags::PATIENT_BIRTH_DATE,
    tags::PATIENT_SEX,
    tags::PATIENT_AGE,
    tags::PATIENT_IDENTITY_REMOVED,
    tags::DEIDENTIFICATION_METHOD,
    tags::BODY_PART_EXAMINED,
    tags::STUDY_INSTANCE_UID,
    tags::SERIES_INSTANCE_UID,
    tags::STUDY_ID,
    tags::SERIES_NUMBER,
    tags::INSTANCE_NUMBER,
    tags::PROTOCOL_NAME,
    tags::FRAME_OF_REFERENCE_UID,
];

#[derive(Debug, Clone)]
pub struct CollectedElement {
    pub tag: Tag,
    pub vr: VR,
    pub value: String,
}

/// 单次收集的结果: 文件头信息加上白名单属性
#[derive(Debug, Clone, Default)]
pub struct DicomInfo {
    pub meta: Option<DicomMetaInfo>,
    elements: BTreeMap<Tag, CollectedElement>,
}

impl DicomInfo {
    pub fn string(&self, tag: Tag) -> Option<&str> {
        self.elements.get(&tag).map(|e| e.value.as_str())
    }

    pub fn string_or_empty(&self, tag: Tag) -> String {
        self.string(tag).unwrap_or("").to_string()
    }

    pub fn elements(&self) -> impl Iterator<Item = &CollectedElement> {
        self.elements.values()
    }

    pub fn patient_name(&self) -> String {
        self.string_or_empty(tags::PATIENT_NAME)
    }

    pub fn patient_id(&self) -> String {
        self.string_or_empty(tags::PATIENT_ID)
    }

    pub fn study_instance_uid(&self) -> String {
        self.string_or_empty(tags::STUDY_INSTANCE_UID)
    }

    pub fn series_instance_uid(&self) -> String {
        self.string_or_empty(tags::SERIES_INSTANCE_UID)
    }

    pub fn sop_instance_uid(&self) -> String {
        self.string_or_empty(tags::SOP_INSTANCE_UID)
    }

    pub fn frame_of_reference_uid(&self) -> String {
        self.string_or_empty(tags::FRAME_OF_REFERENCE_UID)
    }

    /// 到达的对象是否携带匿名标记
    pub fn identity_removed(&self) -> bool {
        self.string(tags::PATIENT_IDENTITY_REMOVED) == Some("YES")
    }

    pub fn transfer_syntax_uid(&self) -> Option<&str> {
        self.meta.as_ref().map(|m| m.transfer_syntax_uid.as_str())
    }

    pub fn sop_class_uid(&self) -> Option<&str> {
        self.meta
            .as_ref()
            .map(|m| m.media_storage_sop_class_uid.as_str())
    }
}

// 白名单属性都是短文本, 超过这个长度的值按截断收集
const MAX_COLLECT_VALUE: usize = 1024;

/// 从部件流里收集白名单属性. 只看根层, 序列内容一概跳过.
pub struct AttributeCollector {
    whitelist: Vec<Tag>,
    depth: usize,
    current: Option<(HeaderPart, Vec<u8>)>,
    info: DicomInfo,
}

impl AttributeCollector {
    pub fn new(whitelist: &[Tag]) -> Self {
        Self {
            whitelist: whitelist.to_vec(),
            depth: 0,
            current: None,
            info: DicomInfo::default(),
        }
    }

    pub fn feed(&mut self, part: &DicomPart) {
        match part {
            DicomPart::Meta(meta) => {
                self.info.meta = Some(meta.clone());
            }
            DicomPart::SequenceStart { .. } | DicomPart::FragmentsStart(_) => {
                self.depth += 1;
                self.current = None;
            }
            DicomPart::SequenceDelimitation => {
                self.depth = self.depth.saturating_sub(1);
            }
            DicomPart::Header(header) => {
                if self.depth == 0 && self.whitelist.contains(&header.tag) {
                    self.current = Some((header.clone(), Vec::new()));
                } else {
                    self.current = None;
                }
            }
            DicomPart::ValueChunk(chunk) => {
                if let Some((_, buf)) = &mut self.current {
                    if buf.len() < MAX_COLLECT_VALUE {
                        buf.extend_from_slice(&chunk.bytes);
                    }
                    if chunk.last {
                        if let Some((header, buf)) = self.current.take() {
                            self.info.elements.insert(
                                header.tag,
                                CollectedElement {
                                    tag: header.tag,
                                    vr: header.vr,
                                    value: trim_value(&buf),
                                },
                            );
                        }
                    }
                }
            }
            _ => {}
        }
    }

    pub fn into_info(self) -> DicomInfo {
        self.info
    }
}

/// 解析整块数据并收集白名单属性, 发送端和接收端都用它取标识
pub fn collect_attributes(data: &[u8], whitelist: &[Tag]) -> Result<DicomInfo, StreamError> {
    let mut collector = AttributeCollector::new(whitelist);
    for part in DicomParts::new(Bytes::copy_from_slice(data)) {
        collector.feed(&part?);
    }
    Ok(collector.into_info())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::tests::minimal_explicit_file;

    #[test]
    fn test_collect_reads_patient_name_and_meta() {
        let data = minimal_explicit_file();
        let info = collect_attributes(&data, TAGS_TO_STORE).unwrap();

        assert_eq!(info.patient_name(), "DOE^JOHN");
        assert_eq!(info.transfer_syntax_uid(), Some("1.2.840.10008.1.2.1"));
        assert_eq!(info.sop_class_uid(), Some("1.2.840.10008.5.1.4.1.1.7"));
        assert!(!info.identity_removed());
    }

    #[test]
    fn test_collect_ignores_non_whitelisted() {
        let data = minimal_explicit_file();
        let info = collect_attributes(&data, &[tags::PATIENT_ID]).unwrap();
        assert!(info.string(tags::PATIENT_NAME).is_none());
    }
}
