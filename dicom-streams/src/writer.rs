use crate::parts::{
    DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN, DicomPart, HeaderPart, StreamEncoding, StreamError,
    has_long_header, vr_code,
};
use bytes::Bytes;
use dicom_core::Tag;
use flate2::Compression;
use flate2::write::DeflateEncoder;
use std::io::Write;

const UNDEFINED_LENGTH: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterCtx {
    Sequence,
    Fragments,
}

/// 把部件序列重新编码成字节流.
/// 文件头缓冲到数据集开始时一次落盘, 组长度重新计算;
/// 序列和条目一律写成未定长度并带分隔符, 嵌套改写不需要回填长度;
/// 压缩语法的数据集经过 deflate 编码器输出.
pub struct DicomPartWriter {
    pending: Vec<u8>,
    meta_buf: Vec<u8>,
    preamble: Option<Bytes>,
    meta_flushed: bool,
    in_meta_value: bool,
    transfer_syntax: String,
    encoding: StreamEncoding,
    deflate: Option<DeflateEncoder<Vec<u8>>>,
    ctx: Vec<WriterCtx>,
}

impl DicomPartWriter {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            meta_buf: Vec::new(),
            preamble: None,
            meta_flushed: false,
            in_meta_value: false,
            transfer_syntax: String::new(),
            encoding: StreamEncoding::EXPLICIT_LE,
            deflate: None,
            ctx: Vec::new(),
        }
    }

    fn push_u16(out: &mut Vec<u8>, value: u16, big_endian: bool) {
        if big_endian {
            out.extend_from_slice(&value.to_be_bytes());
        } else {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }

    fn push_u32(out: &mut Vec<u8>, value: u32, big_endian: bool) {
        if big_endian {
            out.extend_from_slice(&value.to_be_bytes());
        } else {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }

    fn encode_header(out: &mut Vec<u8>, header: &HeaderPart) {
        let be = header.encoding.big_endian;
        Self::push_u16(out, header.tag.group(), be);
        Self::push_u16(out, header.tag.element(), be);
        if header.encoding.explicit_vr {
            out.extend_from_slice(&vr_code(header.vr));
            if has_long_header(header.vr) {
                out.extend_from_slice(&[0, 0]);
                Self::push_u32(out, header.length, be);
            } else {
                Self::push_u16(out, header.length as u16, be);
            }
        } else {
            Self::push_u32(out, header.length, be);
        }
    }

    fn encode_no_vr(out: &mut Vec<u8>, tag: Tag, length: u32, big_endian: bool) {
        Self::push_u16(out, tag.group(), big_endian);
        Self::push_u16(out, tag.element(), big_endian);
        Self::push_u32(out, length, big_endian);
    }

    fn write_out(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        match &mut self.deflate {
            Some(encoder) => encoder
                .write_all(bytes)
                .map_err(|e| StreamError::Deflate(e.to_string())),
            None => {
                self.pending.extend_from_slice(bytes);
                Ok(())
            }
        }
    }

    fn ensure_meta_flushed(&mut self) {
        if self.meta_flushed {
            return;
        }
        match &self.preamble {
            Some(preamble) => self.pending.extend_from_slice(preamble),
            None => {
                self.pending.extend_from_slice(&[0u8; 128]);
                self.pending.extend_from_slice(b"DICM");
            }
        }
        // (0002,0000) 组长度覆盖其后的所有文件头元素
        self.pending.extend_from_slice(&0x0002u16.to_le_bytes());
        self.pending.extend_from_slice(&0x0000u16.to_le_bytes());
        self.pending.extend_from_slice(b"UL");
        self.pending.extend_from_slice(&4u16.to_le_bytes());
        self.pending
            .extend_from_slice(&(self.meta_buf.len() as u32).to_le_bytes());
        let meta_buf = std::mem::take(&mut self.meta_buf);
        self.pending.extend_from_slice(&meta_buf);
        self.meta_flushed = true;

        if self.transfer_syntax == DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN {
            self.deflate = Some(DeflateEncoder::new(Vec::new(), Compression::default()));
        }
    }

    pub fn feed(&mut self, part: &DicomPart) -> Result<(), StreamError> {
        match part {
            DicomPart::Preamble(bytes) => {
                self.preamble = Some(bytes.clone());
            }
            DicomPart::Meta(info) => {
                self.transfer_syntax = info.transfer_syntax_uid.clone();
                self.encoding = StreamEncoding::for_transfer_syntax(&self.transfer_syntax);
            }
            DicomPart::AnonymizationKeyValues(_) => {}
            DicomPart::Header(header) => {
                if !self.meta_flushed && header.tag.group() == 0x0002 {
                    let mut buf = Vec::new();
                    Self::encode_header(&mut buf, header);
                    self.meta_buf.extend_from_slice(&buf);
                    self.in_meta_value = true;
                } else {
                    self.ensure_meta_flushed();
                    let mut buf = Vec::new();
                    Self::encode_header(&mut buf, header);
                    self.write_out(&buf)?;
                }
            }
            DicomPart::ValueChunk(chunk) => {
                if self.in_meta_value && !self.meta_flushed {
                    self.meta_buf.extend_from_slice(&chunk.bytes);
                    if chunk.last {
                        self.in_meta_value = false;
                    }
                } else {
                    let bytes = chunk.bytes.clone();
                    self.write_out(&bytes)?;
                }
            }
            DicomPart::SequenceStart { tag, encoding, .. } => {
                self.ensure_meta_flushed();
                let mut buf = Vec::new();
                if encoding.explicit_vr {
                    Self::push_u16(&mut buf, tag.group(), encoding.big_endian);
                    Self::push_u16(&mut buf, tag.element(), encoding.big_endian);
                    buf.extend_from_slice(b"SQ");
                    buf.extend_from_slice(&[0, 0]);
                    Self::push_u32(&mut buf, UNDEFINED_LENGTH, encoding.big_endian);
                } else {
                    Self::encode_no_vr(&mut buf, *tag, UNDEFINED_LENGTH, encoding.big_endian);
                }
                self.write_out(&buf)?;
                self.ctx.push(WriterCtx::Sequence);
            }
            DicomPart::FragmentsStart(header) => {
                self.ensure_meta_flushed();
                let mut buf = Vec::new();
                Self::encode_header(&mut buf, header);
                self.write_out(&buf)?;
                self.ctx.push(WriterCtx::Fragments);
            }
            DicomPart::Item { length } => {
                self.ensure_meta_flushed();
                // 碎片条目保留真实长度, 序列条目统一未定长度
                let write_length = match self.ctx.last() {
                    Some(WriterCtx::Fragments) => length.unwrap_or(0),
                    _ => UNDEFINED_LENGTH,
                };
                let mut buf = Vec::new();
                Self::encode_no_vr(
                    &mut buf,
                    Tag(0xFFFE, 0xE000),
                    write_length,
                    self.encoding.big_endian,
                );
                self.write_out(&buf)?;
            }
            DicomPart::ItemDelimitation => {
                self.ensure_meta_flushed();
                let mut buf = Vec::new();
                Self::encode_no_vr(&mut buf, Tag(0xFFFE, 0xE00D), 0, self.encoding.big_endian);
                self.write_out(&buf)?;
            }
            DicomPart::SequenceDelimitation => {
                self.ensure_meta_flushed();
                let mut buf = Vec::new();
                Self::encode_no_vr(&mut buf, Tag(0xFFFE, 0xE0DD), 0, self.encoding.big_endian);
                self.write_out(&buf)?;
                self.ctx.pop();
            }
        }
        Ok(())
    }

    /// 取走目前已经编码完成的字节, 供逐块写入储存
    pub fn take_pending(&mut self) -> Vec<u8> {
        if let Some(encoder) = &mut self.deflate {
            let buffered = std::mem::take(encoder.get_mut());
            if !buffered.is_empty() {
                self.pending.extend_from_slice(&buffered);
            }
        }
        std::mem::take(&mut self.pending)
    }

    pub fn finish(mut self) -> Result<Vec<u8>, StreamError> {
        self.ensure_meta_flushed();
        if let Some(encoder) = self.deflate.take() {
            let rest = encoder
                .finish()
                .map_err(|e| StreamError::Deflate(e.to_string()))?;
            self.pending.extend_from_slice(&rest);
        }
        Ok(std::mem::take(&mut self.pending))
    }
}

impl Default for DicomPartWriter {
    fn default() -> Self {
        Self::new()
    }
}
