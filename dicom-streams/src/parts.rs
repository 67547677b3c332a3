use bytes::Bytes;
use database::anonymization_meta::AnonymizationKeyMatch;
use dicom_core::{Tag, VR};
use dicom_dictionary_std::tags;
use thiserror::Error;

pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
pub const DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1.99";
pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("DICOM parse failed: {0}")]
    Parse(String),

    #[error("DICOM validation failed: {0}")]
    Validation(String),

    #[error("Deflated dataset error: {0}")]
    Deflate(String),
}

/// 数据集元素的编码方式, 由传输语法决定, 随头部一起携带
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamEncoding {
    pub explicit_vr: bool,
    pub big_endian: bool,
}

impl StreamEncoding {
    pub const EXPLICIT_LE: StreamEncoding = StreamEncoding {
        explicit_vr: true,
        big_endian: false,
    };

    pub fn for_transfer_syntax(uid: &str) -> StreamEncoding {
        match uid {
            IMPLICIT_VR_LITTLE_ENDIAN => StreamEncoding {
                explicit_vr: false,
                big_endian: false,
            },
            EXPLICIT_VR_BIG_ENDIAN => StreamEncoding {
                explicit_vr: true,
                big_endian: true,
            },
            // 压缩语法的数据集结构都是显式小端
            _ => StreamEncoding::EXPLICIT_LE,
        }
    }
}

/// 单个元素的头部. length 始终与后续 ValueChunk 的总字节数一致.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderPart {
    pub tag: Tag,
    pub vr: VR,
    pub length: u32,
    pub encoding: StreamEncoding,
}

impl HeaderPart {
    pub fn new(tag: Tag, vr: VR, length: u32, encoding: StreamEncoding) -> Self {
        Self {
            tag,
            vr,
            length,
            encoding,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueChunkPart {
    pub bytes: Bytes,
    pub last: bool,
}

/// 文件头信息, 校验上下文用它做白名单判断
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DicomMetaInfo {
    pub media_storage_sop_class_uid: String,
    pub media_storage_sop_instance_uid: String,
    pub transfer_syntax_uid: String,
}

/// 流内的回迁钥匙. 只有它出现之后, 回迁阶段才会启用.
#[derive(Debug, Clone)]
pub struct AnonymizationKeyValuesPart {
    pub key_match: Option<AnonymizationKeyMatch>,
}

/// DICOM 字节流的惰性部件序列.
/// 非 SQ 头部后面至少跟一个 ValueChunk, 最后一个带 last 标记; 空值也有一个空块.
#[derive(Debug, Clone)]
pub enum DicomPart {
    Preamble(Bytes),
    Meta(DicomMetaInfo),
    Header(HeaderPart),
    ValueChunk(ValueChunkPart),
    SequenceStart { tag: Tag, length: Option<u32>, encoding: StreamEncoding },
    Item { length: Option<u32> },
    ItemDelimitation,
    SequenceDelimitation,
    FragmentsStart(HeaderPart),
    AnonymizationKeyValues(AnonymizationKeyValuesPart),
}

pub fn vr_from_code(code: &[u8]) -> Option<VR> {
    match code {
        b"AE" => Some(VR::AE),
        b"AS" => Some(VR::AS),
        b"AT" => Some(VR::AT),
        b"CS" => Some(VR::CS),
        b"DA" => Some(VR::DA),
        b"DS" => Some(VR::DS),
        b"DT" => Some(VR::DT),
        b"FL" => Some(VR::FL),
        b"FD" => Some(VR::FD),
        b"IS" => Some(VR::IS),
        b"LO" => Some(VR::LO),
        b"LT" => Some(VR::LT),
        b"OB" => Some(VR::OB),
        b"OD" => Some(VR::OD),
        b"OF" => Some(VR::OF),
        b"OL" => Some(VR::OL),
        b"OV" => Some(VR::OV),
        b"OW" => Some(VR::OW),
        b"PN" => Some(VR::PN),
        b"SH" => Some(VR::SH),
        b"SL" => Some(VR::SL),
        b"SQ" => Some(VR::SQ),
        b"SS" => Some(VR::SS),
        b"ST" => Some(VR::ST),
        b"SV" => Some(VR::SV),
        b"TM" => Some(VR::TM),
        b"UC" => Some(VR::UC),
        b"UI" => Some(VR::UI),
        b"UL" => Some(VR::UL),
        b"UN" => Some(VR::UN),
        b"UR" => Some(VR::UR),
        b"US" => Some(VR::US),
        b"UT" => Some(VR::UT),
        b"UV" => Some(VR::UV),
        _ => None,
    }
}

pub fn vr_code(vr: VR) -> [u8; 2] {
    let code: &[u8; 2] = match vr {
        VR::AE => b"AE",
        VR::AS => b"AS",
        VR::AT => b"AT",
        VR::CS => b"CS",
        VR::DA => b"DA",
        VR::DS => b"DS",
        VR::DT => b"DT",
        VR::FL => b"FL",
        VR::FD => b"FD",
        VR::IS => b"IS",
        VR::LO => b"LO",
        VR::LT => b"LT",
        VR::OB => b"OB",
        VR::OD => b"OD",
        VR::OF => b"OF",
        VR::OL => b"OL",
        VR::OV => b"OV",
        VR::OW => b"OW",
        VR::PN => b"PN",
        VR::SH => b"SH",
        VR::SL => b"SL",
        VR::SQ => b"SQ",
        VR::SS => b"SS",
        VR::ST => b"ST",
        VR::SV => b"SV",
        VR::TM => b"TM",
        VR::UC => b"UC",
        VR::UI => b"UI",
        VR::UL => b"UL",
        VR::UR => b"UR",
        VR::US => b"US",
        VR::UT => b"UT",
        VR::UV => b"UV",
        _ => b"UN",
    };
    *code
}

/// 显式编码里使用 12 字节长头部的 VR
pub fn has_long_header(vr: VR) -> bool {
    matches!(
        vr,
        VR::OB
            | VR::OD
            | VR::OF
            | VR::OL
            | VR::OV
            | VR::OW
            | VR::SQ
            | VR::SV
            | VR::UC
            | VR::UN
            | VR::UR
            | VR::UT
            | VR::UV
    )
}

/// 常用属性的标准 VR, 隐式编码解析和插入缺失元素时使用
pub fn standard_vr(tag: Tag) -> Option<VR> {
    match tag {
        tags::SPECIFIC_CHARACTER_SET => Some(VR::CS),
        tags::SOP_CLASS_UID | tags::SOP_INSTANCE_UID => Some(VR::UI),
        tags::MEDIA_STORAGE_SOP_CLASS_UID | tags::MEDIA_STORAGE_SOP_INSTANCE_UID => Some(VR::UI),
        tags::TRANSFER_SYNTAX_UID => Some(VR::UI),
        tags::STUDY_DATE | tags::SERIES_DATE | tags::ACQUISITION_DATE | tags::CONTENT_DATE => {
            Some(VR::DA)
        }
        tags::STUDY_TIME | tags::SERIES_TIME | tags::ACQUISITION_TIME | tags::CONTENT_TIME => {
            Some(VR::TM)
        }
        tags::ACCESSION_NUMBER | tags::STUDY_ID => Some(VR::SH),
        tags::MODALITY => Some(VR::CS),
        tags::STUDY_DESCRIPTION | tags::SERIES_DESCRIPTION | tags::PROTOCOL_NAME => Some(VR::LO),
        tags::PATIENT_NAME | tags::REFERRING_PHYSICIAN_NAME => Some(VR::PN),
        tags::PATIENT_ID | tags::INSTITUTION_NAME | tags::DEIDENTIFICATION_METHOD => Some(VR::LO),
        tags::PATIENT_BIRTH_DATE => Some(VR::DA),
        tags::PATIENT_SEX | tags::PATIENT_IDENTITY_REMOVED | tags::BODY_PART_EXAMINED => {
            Some(VR::CS)
        }
        tags::PATIENT_AGE => Some(VR::AS),
        tags::STUDY_INSTANCE_UID
        | tags::SERIES_INSTANCE_UID
        | tags::FRAME_OF_REFERENCE_UID => Some(VR::UI),
        tags::SERIES_NUMBER | tags::INSTANCE_NUMBER => Some(VR::IS),
        _ => None,
    }
}

/// DICOM 文本值补齐到偶数长度
pub fn pad_value(value: &str, vr: VR) -> Vec<u8> {
    let mut bytes = value.as_bytes().to_vec();
    if bytes.len() % 2 != 0 {
        if vr == VR::UI {
            bytes.push(0);
        } else {
            bytes.push(b' ');
        }
    }
    bytes
}

/// 去掉 DICOM 文本值的尾部填充
pub fn trim_value(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\0', ' '])
        .to_string()
}
