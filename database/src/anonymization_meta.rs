use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::fmt::Display;
use std::hash::{Hash, Hasher};

/// 匹配命中的层级, 决定哪些字段可以回写
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DicomHierarchyLevel {
    Patient,
    Study,
    Series,
    Image,
}

impl Display for DicomHierarchyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DicomHierarchyLevel::Patient => write!(f, "PATIENT"),
            DicomHierarchyLevel::Study => write!(f, "STUDY"),
            DicomHierarchyLevel::Series => write!(f, "SERIES"),
            DicomHierarchyLevel::Image => write!(f, "IMAGE"),
        }
    }
}

/// 单张影像的化名映射. 原值与化名成对保存, 回迁时按层级取用.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnonymizationKeyEntity {
    #[serde(rename = "id")]
    pub id: i64,
    #[serde(rename = "created")]
    pub created: i64,
    #[serde(rename = "image_id")]
    pub image_id: i64,
    #[serde(rename = "patient_name")]
    pub patient_name: String,
    #[serde(rename = "anon_patient_name")]
    pub anon_patient_name: String,
    #[serde(rename = "patient_id")]
    pub patient_id: String,
    #[serde(rename = "anon_patient_id")]
    pub anon_patient_id: String,
    #[serde(rename = "patient_birth_date")]
    pub patient_birth_date: String,
    #[serde(rename = "study_instance_uid")]
    pub study_instance_uid: String,
    #[serde(rename = "anon_study_instance_uid")]
    pub anon_study_instance_uid: String,
    #[serde(rename = "study_description")]
    pub study_description: String,
    #[serde(rename = "study_id")]
    pub study_id: String,
    #[serde(rename = "accession_number")]
    pub accession_number: String,
    #[serde(rename = "series_instance_uid")]
    pub series_instance_uid: String,
    #[serde(rename = "anon_series_instance_uid")]
    pub anon_series_instance_uid: String,
    #[serde(rename = "series_description")]
    pub series_description: String,
    #[serde(rename = "protocol_name")]
    pub protocol_name: String,
    #[serde(rename = "frame_of_reference_uid")]
    pub frame_of_reference_uid: String,
    #[serde(rename = "anon_frame_of_reference_uid")]
    pub anon_frame_of_reference_uid: String,
    #[serde(rename = "sop_instance_uid")]
    pub sop_instance_uid: String,
    #[serde(rename = "anon_sop_instance_uid")]
    pub anon_sop_instance_uid: String,
}

// 去重的等价判定: 病人/检查/序列层的原值与化名都一致
impl Hash for AnonymizationKeyEntity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.patient_name.hash(state);
        self.anon_patient_name.hash(state);
        self.patient_id.hash(state);
        self.anon_patient_id.hash(state);
        self.study_instance_uid.hash(state);
        self.anon_study_instance_uid.hash(state);
        self.series_instance_uid.hash(state);
        self.anon_series_instance_uid.hash(state);
    }
}

impl PartialEq for AnonymizationKeyEntity {
    fn eq(&self, other: &Self) -> bool {
        self.patient_name == other.patient_name
            && self.anon_patient_name == other.anon_patient_name
            && self.patient_id == other.patient_id
            && self.anon_patient_id == other.anon_patient_id
            && self.study_instance_uid == other.study_instance_uid
            && self.anon_study_instance_uid == other.anon_study_instance_uid
            && self.series_instance_uid == other.series_instance_uid
            && self.anon_series_instance_uid == other.anon_series_instance_uid
    }
}

impl Eq for AnonymizationKeyEntity {}

impl sqlx::FromRow<'_, SqliteRow> for AnonymizationKeyEntity {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(AnonymizationKeyEntity {
            id: row.get("id"),
            created: row.get("created"),
            image_id: row.get("image_id"),
            patient_name: row.get("patient_name"),
            anon_patient_name: row.get("anon_patient_name"),
            patient_id: row.get("patient_id"),
            anon_patient_id: row.get("anon_patient_id"),
            patient_birth_date: row.get("patient_birth_date"),
            study_instance_uid: row.get("study_instance_uid"),
            anon_study_instance_uid: row.get("anon_study_instance_uid"),
            study_description: row.get("study_description"),
            study_id: row.get("study_id"),
            accession_number: row.get("accession_number"),
            series_instance_uid: row.get("series_instance_uid"),
            anon_series_instance_uid: row.get("anon_series_instance_uid"),
            series_description: row.get("series_description"),
            protocol_name: row.get("protocol_name"),
            frame_of_reference_uid: row.get("frame_of_reference_uid"),
            anon_frame_of_reference_uid: row.get("anon_frame_of_reference_uid"),
            sop_instance_uid: row.get("sop_instance_uid"),
            anon_sop_instance_uid: row.get("anon_sop_instance_uid"),
        })
    }
}

/// 层级化查找的命中结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnonymizationKeyMatch {
    #[serde(rename = "level")]
    pub level: DicomHierarchyLevel,
    #[serde(rename = "key")]
    pub key: AnonymizationKeyEntity,
}

impl AnonymizationKeyMatch {
    /// 该命中是否有权限回写给定层级的属性
    pub fn covers(&self, level: DicomHierarchyLevel) -> bool {
        self.level >= level
    }
}
