use bytes::Bytes;
use database::anonymization_meta::{AnonymizationKeyMatch, DicomHierarchyLevel};
use dicom_core::value::PrimitiveValue;
use dicom_core::{DataElement, Tag, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_streams::anonymization::{
    AnonymizationContext, DEIDENTIFICATION_METHOD_DESCRIPTION, build_anonymization_key,
};
use dicom_streams::modify::TagModification;
use dicom_streams::parser::DicomParts;
use dicom_streams::parts::{
    DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN, DicomPart, EXPLICIT_VR_LITTLE_ENDIAN, HeaderPart,
    StreamEncoding, ValueChunkPart, pad_value,
};
use dicom_streams::pipeline::{anonymize_dicom_data, collect_identifiers, harmonize_dicom_data};
use dicom_streams::validation::{default_contexts, validate_context};
use dicom_streams::writer::DicomPartWriter;

const SOP_INSTANCE: &str = "1.2.3.4.5";

fn put_str(obj: &mut InMemDicomObject, tag: Tag, vr: VR, value: &str) {
    obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
}

fn test_object_bytes() -> Vec<u8> {
    let mut obj = InMemDicomObject::new_empty();
    put_str(&mut obj, tags::SOP_CLASS_UID, VR::UI, uids::CT_IMAGE_STORAGE);
    put_str(&mut obj, tags::SOP_INSTANCE_UID, VR::UI, SOP_INSTANCE);
    put_str(&mut obj, tags::STUDY_DATE, VR::DA, "20240102");
    put_str(&mut obj, tags::ACCESSION_NUMBER, VR::SH, "ACC42");
    put_str(&mut obj, tags::MODALITY, VR::CS, "CT");
    put_str(&mut obj, tags::INSTITUTION_NAME, VR::LO, "GENERAL HOSPITAL");
    put_str(&mut obj, tags::STUDY_DESCRIPTION, VR::LO, "HEAD STUDY");
    put_str(&mut obj, tags::SERIES_DESCRIPTION, VR::LO, "AXIAL");
    put_str(&mut obj, tags::PATIENT_NAME, VR::PN, "DOE^JOHN");
    put_str(&mut obj, tags::PATIENT_ID, VR::LO, "PID42");
    put_str(&mut obj, tags::PATIENT_BIRTH_DATE, VR::DA, "19700101");
    put_str(&mut obj, tags::PATIENT_SEX, VR::CS, "M");
    put_str(&mut obj, tags::PATIENT_AGE, VR::AS, "054Y");
    put_str(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, "1.2.3.4");
    put_str(&mut obj, tags::SERIES_INSTANCE_UID, VR::UI, "1.2.3.4.1");
    put_str(&mut obj, tags::STUDY_ID, VR::SH, "ST1");
    put_str(&mut obj, tags::FRAME_OF_REFERENCE_UID, VR::UI, "1.2.3.4.9");
    put_str(&mut obj, tags::PROTOCOL_NAME, VR::LO, "PROT");

    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
        .media_storage_sop_instance_uid(SOP_INSTANCE)
        .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN)
        .build()
        .expect("failed to build file meta");
    let file_obj = obj.with_exact_meta(meta);

    let mut bytes = Vec::new();
    file_obj.write_all(&mut bytes).expect("failed to write test object");
    bytes
}

#[test]
fn test_anonymize_replaces_identity_and_marks_object() {
    let original = test_object_bytes();
    let info = collect_identifiers(&original).unwrap();
    let ctx = AnonymizationContext::fresh(&info);

    let anonymized = anonymize_dicom_data(&original, ctx.clone(), vec![]).unwrap();
    let anon_info = collect_identifiers(&anonymized).unwrap();

    assert!(anon_info.identity_removed());
    assert_eq!(
        anon_info.string(tags::DEIDENTIFICATION_METHOD),
        Some(DEIDENTIFICATION_METHOD_DESCRIPTION)
    );
    assert_eq!(anon_info.patient_name(), "Anonymous M 054Y");
    assert_eq!(anon_info.patient_id(), ctx.anon_patient_id);
    assert_eq!(anon_info.study_instance_uid(), ctx.anon_study_instance_uid);
    assert_eq!(anon_info.series_instance_uid(), ctx.anon_series_instance_uid);
    assert_eq!(anon_info.sop_instance_uid(), ctx.anon_sop_instance_uid);
    assert_eq!(anon_info.frame_of_reference_uid(), ctx.anon_frame_of_reference_uid);

    // 出生日期置空, 多选动作收紧: 描述置空, 机构删除, 年龄删除
    assert_eq!(anon_info.string(tags::PATIENT_BIRTH_DATE), Some(""));
    assert_eq!(anon_info.string(tags::STUDY_DESCRIPTION), Some(""));
    assert_eq!(anon_info.string(tags::ACCESSION_NUMBER), Some(""));
    assert!(anon_info.string(tags::PATIENT_AGE).is_none());

    // 文件头的 SOP 实例也换成了化名
    let meta = anon_info.meta.as_ref().unwrap();
    assert_eq!(meta.media_storage_sop_instance_uid, ctx.anon_sop_instance_uid);
}

#[test]
fn test_forced_tag_values_win_over_anonymization() {
    let original = test_object_bytes();
    let info = collect_identifiers(&original).unwrap();
    let ctx = AnonymizationContext::fresh(&info);

    let anonymized = anonymize_dicom_data(
        &original,
        ctx,
        vec![TagModification::new(tags::PATIENT_NAME, "FORCED^NAME", true)],
    )
    .unwrap();
    let anon_info = collect_identifiers(&anonymized).unwrap();

    assert_eq!(anon_info.patient_name(), "FORCED^NAME");
    assert!(anon_info.identity_removed());
}

#[test]
fn test_reverse_anonymization_restores_original_attributes() {
    let original = test_object_bytes();
    let info = collect_identifiers(&original).unwrap();
    let ctx = AnonymizationContext::fresh(&info);
    let key = build_anonymization_key(&info, &ctx, 1, 1000);

    let anonymized = anonymize_dicom_data(&original, ctx, vec![]).unwrap();
    let key_match = AnonymizationKeyMatch {
        level: DicomHierarchyLevel::Image,
        key,
    };
    let (restored, restored_info) = harmonize_dicom_data(&anonymized, Some(key_match)).unwrap();

    assert_eq!(restored_info.patient_name(), "DOE^JOHN");
    assert_eq!(restored_info.patient_id(), "PID42");
    assert_eq!(restored_info.string(tags::PATIENT_BIRTH_DATE), Some("19700101"));
    assert_eq!(restored_info.study_instance_uid(), "1.2.3.4");
    assert_eq!(restored_info.series_instance_uid(), "1.2.3.4.1");
    assert_eq!(restored_info.string(tags::STUDY_DESCRIPTION), Some("HEAD STUDY"));
    assert_eq!(restored_info.string(tags::SERIES_DESCRIPTION), Some("AXIAL"));
    assert_eq!(restored_info.string(tags::ACCESSION_NUMBER), Some("ACC42"));
    assert_eq!(restored_info.string(tags::STUDY_ID), Some("ST1"));
    assert_eq!(restored_info.string(tags::PROTOCOL_NAME), Some("PROT"));
    assert_eq!(restored_info.frame_of_reference_uid(), "1.2.3.4.9");
    assert_eq!(restored_info.string(tags::PATIENT_IDENTITY_REMOVED), Some("NO"));
    assert_eq!(restored_info.string(tags::DEIDENTIFICATION_METHOD), Some(""));

    // 落盘字节与元数据分支看到的是同一份数据
    let reparsed = collect_identifiers(&restored).unwrap();
    assert_eq!(reparsed.patient_name(), restored_info.patient_name());
}

#[test]
fn test_reverse_anonymization_without_key_is_noop() {
    let original = test_object_bytes();
    let info = collect_identifiers(&original).unwrap();
    let ctx = AnonymizationContext::fresh(&info);
    let anon_patient_id = ctx.anon_patient_id.clone();

    let anonymized = anonymize_dicom_data(&original, ctx, vec![]).unwrap();
    let (_, restored_info) = harmonize_dicom_data(&anonymized, None).unwrap();

    assert!(restored_info.identity_removed());
    assert_eq!(restored_info.patient_id(), anon_patient_id);
}

#[test]
fn test_partial_key_authority_leaves_lower_levels_anonymous() {
    let original = test_object_bytes();
    let info = collect_identifiers(&original).unwrap();
    let ctx = AnonymizationContext::fresh(&info);
    let key = build_anonymization_key(&info, &ctx, 1, 1000);
    let anon_series = ctx.anon_series_instance_uid.clone();

    let anonymized = anonymize_dicom_data(&original, ctx, vec![]).unwrap();
    let key_match = AnonymizationKeyMatch {
        level: DicomHierarchyLevel::Study,
        key,
    };
    let (_, restored_info) = harmonize_dicom_data(&anonymized, Some(key_match)).unwrap();

    // 检查层命中: 检查级属性回迁, 序列级保持化名
    assert_eq!(restored_info.patient_name(), "DOE^JOHN");
    assert_eq!(restored_info.study_instance_uid(), "1.2.3.4");
    assert_eq!(restored_info.series_instance_uid(), anon_series);
    assert!(restored_info.string(tags::SERIES_DESCRIPTION).map_or(true, |v| v.is_empty()));
}

#[test]
fn test_validation_accepts_test_object() {
    let original = test_object_bytes();
    let info = collect_identifiers(&original).unwrap();
    validate_context(info.meta.as_ref().unwrap(), &default_contexts()).unwrap();
}

/// 把显式小端文件改写成 deflate 传输语法
fn deflate_test_file(data: &[u8]) -> Vec<u8> {
    let deflated_uid = pad_value(DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN, VR::UI);
    let mut writer = DicomPartWriter::new();
    let mut skip_chunks = false;
    for part in DicomParts::new(Bytes::copy_from_slice(data)) {
        match part.unwrap() {
            DicomPart::Meta(mut meta) => {
                meta.transfer_syntax_uid = DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN.to_string();
                writer.feed(&DicomPart::Meta(meta)).unwrap();
            }
            DicomPart::Header(h) if h.tag == tags::TRANSFER_SYNTAX_UID => {
                writer
                    .feed(&DicomPart::Header(HeaderPart::new(
                        h.tag,
                        h.vr,
                        deflated_uid.len() as u32,
                        StreamEncoding::EXPLICIT_LE,
                    )))
                    .unwrap();
                writer
                    .feed(&DicomPart::ValueChunk(ValueChunkPart {
                        bytes: Bytes::from(deflated_uid.clone()),
                        last: true,
                    }))
                    .unwrap();
                skip_chunks = true;
            }
            DicomPart::ValueChunk(c) if skip_chunks => {
                if c.last {
                    skip_chunks = false;
                }
            }
            other => writer.feed(&other).unwrap(),
        }
    }
    writer.finish().unwrap()
}

#[test]
fn test_deflated_transfer_syntax_roundtrip() {
    let original = test_object_bytes();
    let deflated = deflate_test_file(&original);
    assert_ne!(deflated, original);

    let info = collect_identifiers(&deflated).unwrap();
    assert_eq!(
        info.transfer_syntax_uid(),
        Some(DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN)
    );
    assert_eq!(info.patient_name(), "DOE^JOHN");

    // 回迁管道读进 deflate, 写出的还是 deflate
    let (rewritten, _) = harmonize_dicom_data(&deflated, None).unwrap();
    let reparsed = collect_identifiers(&rewritten).unwrap();
    assert_eq!(
        reparsed.transfer_syntax_uid(),
        Some(DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN)
    );
    assert_eq!(reparsed.patient_name(), "DOE^JOHN");
}

#[test]
fn test_encapsulated_pixel_data_passes_through() {
    // 手工构造带碎片像素的最小文件
    let mut meta = Vec::new();
    for (element, value) in [
        (0x0002u16, pad_value(uids::CT_IMAGE_STORAGE, VR::UI)),
        (0x0003u16, pad_value(SOP_INSTANCE, VR::UI)),
        (0x0010u16, pad_value("1.2.840.10008.1.2.4.50", VR::UI)),
    ] {
        meta.extend_from_slice(&0x0002u16.to_le_bytes());
        meta.extend_from_slice(&element.to_le_bytes());
        meta.extend_from_slice(b"UI");
        meta.extend_from_slice(&(value.len() as u16).to_le_bytes());
        meta.extend_from_slice(&value);
    }

    let mut data = vec![0u8; 128];
    data.extend_from_slice(b"DICM");
    data.extend_from_slice(&0x0002u16.to_le_bytes());
    data.extend_from_slice(&0x0000u16.to_le_bytes());
    data.extend_from_slice(b"UL");
    data.extend_from_slice(&4u16.to_le_bytes());
    data.extend_from_slice(&(meta.len() as u32).to_le_bytes());
    data.extend_from_slice(&meta);

    // (7FE0,0010) OB 未定长度, 一个基本偏移表条目和一个碎片
    data.extend_from_slice(&0x7FE0u16.to_le_bytes());
    data.extend_from_slice(&0x0010u16.to_le_bytes());
    data.extend_from_slice(b"OB");
    data.extend_from_slice(&[0, 0]);
    data.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    data.extend_from_slice(&0xFFFEu16.to_le_bytes());
    data.extend_from_slice(&0xE000u16.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(&0xFFFEu16.to_le_bytes());
    data.extend_from_slice(&0xE000u16.to_le_bytes());
    data.extend_from_slice(&4u32.to_le_bytes());
    data.extend_from_slice(&[9, 9, 9, 9]);
    data.extend_from_slice(&0xFFFEu16.to_le_bytes());
    data.extend_from_slice(&0xE0DDu16.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());

    let mut writer = DicomPartWriter::new();
    let mut saw_fragments = false;
    for part in DicomParts::new(Bytes::from(data.clone())) {
        let part = part.unwrap();
        if matches!(part, DicomPart::FragmentsStart(_)) {
            saw_fragments = true;
        }
        writer.feed(&part).unwrap();
    }
    assert!(saw_fragments);
    assert_eq!(writer.finish().unwrap(), data);
}
