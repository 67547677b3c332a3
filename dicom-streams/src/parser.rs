use crate::parts::{
    DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN, DicomMetaInfo, DicomPart, HeaderPart, StreamEncoding,
    StreamError, ValueChunkPart, standard_vr, trim_value, vr_from_code,
};
use bytes::Bytes;
use dicom_core::{Tag, VR};
use dicom_dictionary_std::tags;
use flate2::read::DeflateDecoder;
use std::io::Read;

pub const VALUE_CHUNK_SIZE: usize = 8192;

const UNDEFINED_LENGTH: u32 = 0xFFFF_FFFF;
const ITEM: Tag = Tag(0xFFFE, 0xE000);
const ITEM_DELIMITATION: Tag = Tag(0xFFFE, 0xE00D);
const SEQUENCE_DELIMITATION: Tag = Tag(0xFFFE, 0xE0DD);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Preamble,
    Meta,
    Dataset,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Sequence,
    Item,
}

/// 定长序列/条目的结束位置, 到达时补发对应的分隔部件
#[derive(Debug, Clone, Copy)]
struct Frame {
    end: usize,
    kind: FrameKind,
}

/// 把整块 DICOM 字节解析成按需产出的部件序列.
/// 文件头按显式小端解析, 数据集按 (0002,0010) 声明的传输语法解析;
/// 压缩数据集(deflate)先整体解压再继续.
pub struct DicomParts {
    data: Bytes,
    pos: usize,
    phase: Phase,
    meta_end: usize,
    meta_sop_class_uid: String,
    meta_sop_instance_uid: String,
    meta_transfer_syntax: String,
    encoding: StreamEncoding,
    value_remaining: Option<usize>,
    frames: Vec<Frame>,
    in_fragments: bool,
}

impl DicomParts {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            pos: 0,
            phase: Phase::Preamble,
            meta_end: 0,
            meta_sop_class_uid: String::new(),
            meta_sop_instance_uid: String::new(),
            meta_transfer_syntax: String::new(),
            encoding: StreamEncoding::EXPLICIT_LE,
            value_remaining: None,
            frames: Vec::new(),
            in_fragments: false,
        }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<Bytes, StreamError> {
        if self.remaining() < n {
            return Err(StreamError::Parse("unexpected end of data".to_string()));
        }
        let slice = self.data.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(slice)
    }

    fn read_u16(&mut self) -> Result<u16, StreamError> {
        let b = self.take(2)?;
        Ok(if self.encoding.big_endian && self.phase == Phase::Dataset {
            u16::from_be_bytes([b[0], b[1]])
        } else {
            u16::from_le_bytes([b[0], b[1]])
        })
    }

    fn read_u32(&mut self) -> Result<u32, StreamError> {
        let b = self.take(4)?;
        Ok(if self.encoding.big_endian && self.phase == Phase::Dataset {
            u32::from_be_bytes([b[0], b[1], b[2], b[3]])
        } else {
            u32::from_le_bytes([b[0], b[1], b[2], b[3]])
        })
    }

    fn read_tag(&mut self) -> Result<Tag, StreamError> {
        let group = self.read_u16()?;
        let element = self.read_u16()?;
        Ok(Tag(group, element))
    }

    fn parse_preamble(&mut self) -> Result<DicomPart, StreamError> {
        if self.remaining() < 132 || &self.data[self.pos + 128..self.pos + 132] != b"DICM" {
            return Err(StreamError::Parse(
                "missing DICM file preamble".to_string(),
            ));
        }
        let preamble = self.take(132)?;
        self.phase = Phase::Meta;

        // 文件头以 (0002,0000) 组长度开始, 定出文件头的边界
        let tag = self.read_tag()?;
        if tag != tags::FILE_META_INFORMATION_GROUP_LENGTH {
            return Err(StreamError::Parse(format!(
                "expected file meta group length, got {}",
                tag
            )));
        }
        let vr_bytes = self.take(2)?;
        if &vr_bytes[..] != b"UL" {
            return Err(StreamError::Parse(
                "file meta group length must be UL".to_string(),
            ));
        }
        let len = self.read_u16()?;
        if len != 4 {
            return Err(StreamError::Parse(
                "file meta group length must be 4 bytes".to_string(),
            ));
        }
        let group_length = self.read_u32()? as usize;
        self.meta_end = self.pos + group_length;
        if self.meta_end > self.data.len() {
            return Err(StreamError::Parse(
                "file meta group length exceeds data".to_string(),
            ));
        }
        Ok(DicomPart::Preamble(preamble))
    }

    /// 预读整个文件头, 抽出校验需要的三个 UID
    fn scan_meta(&mut self) -> Result<DicomMetaInfo, StreamError> {
        let mut pos = self.pos;
        while pos < self.meta_end {
            if self.meta_end - pos < 8 {
                return Err(StreamError::Parse("truncated file meta group".to_string()));
            }
            let group = u16::from_le_bytes([self.data[pos], self.data[pos + 1]]);
            let element = u16::from_le_bytes([self.data[pos + 2], self.data[pos + 3]]);
            let tag = Tag(group, element);
            let vr = vr_from_code(&self.data[pos + 4..pos + 6]);
            let (value_start, length) = match vr {
                Some(vr) if crate::parts::has_long_header(vr) => {
                    if self.meta_end - pos < 12 {
                        return Err(StreamError::Parse(
                            "truncated file meta element".to_string(),
                        ));
                    }
                    let len = u32::from_le_bytes([
                        self.data[pos + 8],
                        self.data[pos + 9],
                        self.data[pos + 10],
                        self.data[pos + 11],
                    ]);
                    (pos + 12, len as usize)
                }
                _ => {
                    let len = u16::from_le_bytes([self.data[pos + 6], self.data[pos + 7]]);
                    (pos + 8, len as usize)
                }
            };
            if value_start + length > self.meta_end {
                return Err(StreamError::Parse("truncated file meta element".to_string()));
            }
            let value = &self.data[value_start..value_start + length];
            match tag {
                tags::MEDIA_STORAGE_SOP_CLASS_UID => {
                    self.meta_sop_class_uid = trim_value(value);
                }
                tags::MEDIA_STORAGE_SOP_INSTANCE_UID => {
                    self.meta_sop_instance_uid = trim_value(value);
                }
                tags::TRANSFER_SYNTAX_UID => {
                    self.meta_transfer_syntax = trim_value(value);
                }
                _ => {}
            }
            pos = value_start + length;
        }
        if self.meta_transfer_syntax.is_empty() {
            return Err(StreamError::Parse(
                "file meta carries no transfer syntax".to_string(),
            ));
        }
        Ok(DicomMetaInfo {
            media_storage_sop_class_uid: self.meta_sop_class_uid.clone(),
            media_storage_sop_instance_uid: self.meta_sop_instance_uid.clone(),
            transfer_syntax_uid: self.meta_transfer_syntax.clone(),
        })
    }

    /// 文件头读完后切换到数据集: 设定编码, 压缩语法先解压
    fn enter_dataset(&mut self) -> Result<(), StreamError> {
        self.phase = Phase::Dataset;
        self.encoding = StreamEncoding::for_transfer_syntax(&self.meta_transfer_syntax);
        if self.meta_transfer_syntax == DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN {
            let mut inflated = Vec::new();
            let mut decoder = DeflateDecoder::new(&self.data[self.pos..]);
            decoder
                .read_to_end(&mut inflated)
                .map_err(|e| StreamError::Deflate(e.to_string()))?;
            self.data = Bytes::from(inflated);
            self.pos = 0;
        }
        Ok(())
    }

    fn parse_meta_element(&mut self) -> Result<DicomPart, StreamError> {
        let tag = self.read_tag()?;
        let vr_bytes = self.take(2)?;
        let vr = vr_from_code(&vr_bytes).ok_or_else(|| {
            StreamError::Parse(format!("unknown VR in file meta element {}", tag))
        })?;
        let length = if crate::parts::has_long_header(vr) {
            self.take(2)?;
            self.read_u32()?
        } else {
            self.read_u16()? as u32
        };
        self.value_remaining = Some(length as usize);
        Ok(DicomPart::Header(HeaderPart::new(
            tag,
            vr,
            length,
            StreamEncoding::EXPLICIT_LE,
        )))
    }

    fn emit_value_chunk(&mut self, remaining: usize) -> Result<DicomPart, StreamError> {
        let take = remaining.min(VALUE_CHUNK_SIZE);
        let chunk = self.take(take)?;
        let left = remaining - take;
        let last = left == 0;
        if !last {
            self.value_remaining = Some(left);
        }
        Ok(DicomPart::ValueChunk(ValueChunkPart { bytes: chunk, last }))
    }

    fn parse_dataset_element(&mut self) -> Result<DicomPart, StreamError> {
        let tag = self.read_tag()?;

        // 条目和分隔符没有 VR, 头部固定 8 字节
        if tag == ITEM {
            let length = self.read_u32()?;
            if self.in_fragments {
                self.value_remaining = Some(length as usize);
                return Ok(DicomPart::Item {
                    length: Some(length),
                });
            }
            if length == UNDEFINED_LENGTH {
                return Ok(DicomPart::Item { length: None });
            }
            self.frames.push(Frame {
                end: self.pos + length as usize,
                kind: FrameKind::Item,
            });
            return Ok(DicomPart::Item {
                length: Some(length),
            });
        }
        if tag == ITEM_DELIMITATION {
            self.read_u32()?;
            return Ok(DicomPart::ItemDelimitation);
        }
        if tag == SEQUENCE_DELIMITATION {
            self.read_u32()?;
            self.in_fragments = false;
            return Ok(DicomPart::SequenceDelimitation);
        }

        let (vr, length) = if self.encoding.explicit_vr {
            let vr_bytes = self.take(2)?;
            let vr = vr_from_code(&vr_bytes)
                .ok_or_else(|| StreamError::Parse(format!("unknown VR for element {}", tag)))?;
            let length = if crate::parts::has_long_header(vr) {
                self.take(2)?;
                self.read_u32()?
            } else {
                self.read_u16()? as u32
            };
            (vr, length)
        } else {
            let length = self.read_u32()?;
            let vr = standard_vr(tag).unwrap_or(VR::UN);
            (vr, length)
        };

        if vr == VR::SQ || (length == UNDEFINED_LENGTH && vr == VR::UN) {
            let declared = if length == UNDEFINED_LENGTH {
                None
            } else {
                self.frames.push(Frame {
                    end: self.pos + length as usize,
                    kind: FrameKind::Sequence,
                });
                Some(length)
            };
            return Ok(DicomPart::SequenceStart {
                tag,
                length: declared,
                encoding: self.encoding,
            });
        }

        if tag == tags::PIXEL_DATA && length == UNDEFINED_LENGTH {
            self.in_fragments = true;
            return Ok(DicomPart::FragmentsStart(HeaderPart::new(
                tag,
                vr,
                length,
                self.encoding,
            )));
        }

        if length == UNDEFINED_LENGTH {
            return Err(StreamError::Parse(format!(
                "undefined length on non-sequence element {}",
                tag
            )));
        }

        self.value_remaining = Some(length as usize);
        Ok(DicomPart::Header(HeaderPart::new(
            tag,
            vr,
            length,
            self.encoding,
        )))
    }

    fn parse_next(&mut self) -> Result<Option<DicomPart>, StreamError> {
        if let Some(remaining) = self.value_remaining.take() {
            return self.emit_value_chunk(remaining).map(Some);
        }

        match self.phase {
            Phase::Preamble => self.parse_preamble().map(Some),
            Phase::Meta => {
                if self.meta_sop_class_uid.is_empty() && self.meta_transfer_syntax.is_empty() {
                    // 第一次进入文件头: 先整体预读, 发出 Meta 部件
                    let info = self.scan_meta()?;
                    return Ok(Some(DicomPart::Meta(info)));
                }
                if self.pos >= self.meta_end {
                    self.enter_dataset()?;
                    return self.parse_next();
                }
                self.parse_meta_element().map(Some)
            }
            Phase::Dataset => {
                // 定长序列/条目到边界时补发分隔部件
                if let Some(frame) = self.frames.last().copied() {
                    if self.pos >= frame.end {
                        self.frames.pop();
                        return Ok(Some(match frame.kind {
                            FrameKind::Item => DicomPart::ItemDelimitation,
                            FrameKind::Sequence => DicomPart::SequenceDelimitation,
                        }));
                    }
                }
                if self.remaining() == 0 {
                    self.phase = Phase::Done;
                    return Ok(None);
                }
                self.parse_dataset_element().map(Some)
            }
            Phase::Done => Ok(None),
        }
    }
}

impl Iterator for DicomParts {
    type Item = Result<DicomPart, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.parse_next() {
            Ok(Some(part)) => Some(Ok(part)),
            Ok(None) => None,
            Err(e) => {
                self.phase = Phase::Done;
                Some(Err(e))
            }
        }
    }
}
