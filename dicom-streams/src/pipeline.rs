use crate::anonymization::{AnonymizationContext, AnonymizationFlow};
use crate::collect::{AttributeCollector, DicomInfo, TAGS_TO_STORE, collect_attributes};
use crate::harmonization::HarmonizationFlow;
use crate::modify::{ModifyFlow, TagModification};
use crate::parser::DicomParts;
use crate::parts::{AnonymizationKeyValuesPart, DicomPart, StreamError};
use crate::writer::DicomPartWriter;
use bytes::Bytes;
use database::anonymization_meta::AnonymizationKeyMatch;
use std::collections::VecDeque;

/// 改写阶段: 消费一个部件, 产出零个或多个
pub trait PartFlow {
    fn on_part(&mut self, part: DicomPart, out: &mut Vec<DicomPart>) -> Result<(), StreamError>;

    fn finish(&mut self, _out: &mut Vec<DicomPart>) -> Result<(), StreamError> {
        Ok(())
    }
}

/// 文件头之后注入回迁钥匙部件, 回迁阶段看到它才会启用
pub struct InjectKeyValuesFlow {
    payload: Option<AnonymizationKeyValuesPart>,
}

impl InjectKeyValuesFlow {
    pub fn new(key_match: Option<AnonymizationKeyMatch>) -> Self {
        Self {
            payload: Some(AnonymizationKeyValuesPart { key_match }),
        }
    }
}

impl PartFlow for InjectKeyValuesFlow {
    fn on_part(&mut self, part: DicomPart, out: &mut Vec<DicomPart>) -> Result<(), StreamError> {
        let is_meta = matches!(part, DicomPart::Meta(_));
        out.push(part);
        if is_meta {
            if let Some(payload) = self.payload.take() {
                out.push(DicomPart::AnonymizationKeyValues(payload));
            }
        }
        Ok(())
    }
}

/// 解析器加一串改写阶段组成的单遍管道
pub struct PartPipeline {
    parser: DicomParts,
    flows: Vec<Box<dyn PartFlow + Send>>,
    queue: VecDeque<DicomPart>,
    finished: bool,
}

impl PartPipeline {
    pub fn new(data: Bytes, flows: Vec<Box<dyn PartFlow + Send>>) -> Self {
        Self {
            parser: DicomParts::new(data),
            flows,
            queue: VecDeque::new(),
            finished: false,
        }
    }

    fn feed_through(
        &mut self,
        start: usize,
        parts: Vec<DicomPart>,
    ) -> Result<Vec<DicomPart>, StreamError> {
        let mut current = parts;
        for flow in &mut self.flows[start..] {
            let mut next = Vec::new();
            for part in current {
                flow.on_part(part, &mut next)?;
            }
            current = next;
        }
        Ok(current)
    }

    fn drain_finish(&mut self) -> Result<Vec<DicomPart>, StreamError> {
        let mut collected = Vec::new();
        for index in 0..self.flows.len() {
            let mut flushed = Vec::new();
            self.flows[index].finish(&mut flushed)?;
            let routed = self.feed_through(index + 1, flushed)?;
            collected.extend(routed);
        }
        Ok(collected)
    }
}

impl Iterator for PartPipeline {
    type Item = Result<DicomPart, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(part) = self.queue.pop_front() {
                return Some(Ok(part));
            }
            if self.finished {
                return None;
            }
            match self.parser.next() {
                Some(Ok(part)) => match self.feed_through(0, vec![part]) {
                    Ok(parts) => self.queue.extend(parts),
                    Err(e) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                },
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                None => {
                    self.finished = true;
                    match self.drain_finish() {
                        Ok(parts) => self.queue.extend(parts),
                        Err(e) => return Some(Err(e)),
                    }
                }
            }
        }
    }
}

pub fn run_to_bytes(
    pipeline: impl Iterator<Item = Result<DicomPart, StreamError>>,
) -> Result<Vec<u8>, StreamError> {
    let mut writer = DicomPartWriter::new();
    for part in pipeline {
        writer.feed(&part?)?;
    }
    writer.finish()
}

/// 发送路径: 匿名化改写加上每张影像的强制属性
pub fn anonymize_dicom_data(
    data: &[u8],
    ctx: AnonymizationContext,
    modifications: Vec<TagModification>,
) -> Result<Vec<u8>, StreamError> {
    let mut flows: Vec<Box<dyn PartFlow + Send>> = vec![Box::new(AnonymizationFlow::new(ctx))];
    if !modifications.is_empty() {
        flows.push(Box::new(ModifyFlow::new(modifications)));
    }
    run_to_bytes(PartPipeline::new(Bytes::copy_from_slice(data), flows))
}

/// 接收路径: 注入钥匙, 回迁, 同步产出存储字节与元数据.
/// 两个分支消费同一个部件序列, 存储写出的字节与元数据分支看到的输入逐一对应.
pub fn harmonize_dicom_data(
    data: &[u8],
    key_match: Option<AnonymizationKeyMatch>,
) -> Result<(Vec<u8>, DicomInfo), StreamError> {
    let flows: Vec<Box<dyn PartFlow + Send>> = vec![
        Box::new(InjectKeyValuesFlow::new(key_match)),
        Box::new(HarmonizationFlow::new()),
    ];
    let mut writer = DicomPartWriter::new();
    let mut collector = AttributeCollector::new(TAGS_TO_STORE);
    for part in PartPipeline::new(Bytes::copy_from_slice(data), flows) {
        let part = part?;
        writer.feed(&part)?;
        collector.feed(&part);
    }
    Ok((writer.finish()?, collector.into_info()))
}

/// 发送端与接收端都先用它取标识, 再去查化名映射
pub fn collect_identifiers(data: &[u8]) -> Result<DicomInfo, StreamError> {
    collect_attributes(data, TAGS_TO_STORE)
}
