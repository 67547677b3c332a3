use crate::anonymization_meta::{
    AnonymizationKeyEntity, AnonymizationKeyMatch, DicomHierarchyLevel,
};
use crate::dbprovider::DbError;
use sqlx::sqlite::SqlitePool;

pub async fn create_tables(pool: &SqlitePool) -> Result<(), DbError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS anonymization_keys (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created INTEGER NOT NULL,
            image_id INTEGER NOT NULL,
            patient_name TEXT NOT NULL,
            anon_patient_name TEXT NOT NULL,
            patient_id TEXT NOT NULL,
            anon_patient_id TEXT NOT NULL,
            patient_birth_date TEXT NOT NULL,
            study_instance_uid TEXT NOT NULL,
            anon_study_instance_uid TEXT NOT NULL,
            study_description TEXT NOT NULL,
            study_id TEXT NOT NULL,
            accession_number TEXT NOT NULL,
            series_instance_uid TEXT NOT NULL,
            anon_series_instance_uid TEXT NOT NULL,
            series_description TEXT NOT NULL,
            protocol_name TEXT NOT NULL,
            frame_of_reference_uid TEXT NOT NULL,
            anon_frame_of_reference_uid TEXT NOT NULL,
            sop_instance_uid TEXT NOT NULL,
            anon_sop_instance_uid TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(DbError::from_sqlx)?;

    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_anon_keys_anon_patient \
         ON anonymization_keys(anon_patient_name, anon_patient_id)",
        "CREATE INDEX IF NOT EXISTS idx_anon_keys_patient \
         ON anonymization_keys(patient_name, patient_id)",
        "CREATE INDEX IF NOT EXISTS idx_anon_keys_image_id ON anonymization_keys(image_id)",
    ];
    for index_sql in indexes {
        sqlx::query(index_sql)
            .execute(pool)
            .await
            .map_err(DbError::from_sqlx)?;
    }

    Ok(())
}

/// 化名映射表. 查找按 影像→序列→检查→病人 逐级放宽, 首个命中生效.
#[derive(Debug, Clone)]
pub struct AnonymizationStore {
    pool: SqlitePool,
}

impl AnonymizationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_anonymization_key(
        &self,
        mut key: AnonymizationKeyEntity,
    ) -> Result<AnonymizationKeyEntity, DbError> {
        let result = sqlx::query(
            r#"
            INSERT INTO anonymization_keys (
                created, image_id,
                patient_name, anon_patient_name,
                patient_id, anon_patient_id,
                patient_birth_date,
                study_instance_uid, anon_study_instance_uid,
                study_description, study_id, accession_number,
                series_instance_uid, anon_series_instance_uid,
                series_description, protocol_name,
                frame_of_reference_uid, anon_frame_of_reference_uid,
                sop_instance_uid, anon_sop_instance_uid
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(key.created)
        .bind(key.image_id)
        .bind(&key.patient_name)
        .bind(&key.anon_patient_name)
        .bind(&key.patient_id)
        .bind(&key.anon_patient_id)
        .bind(&key.patient_birth_date)
        .bind(&key.study_instance_uid)
        .bind(&key.anon_study_instance_uid)
        .bind(&key.study_description)
        .bind(&key.study_id)
        .bind(&key.accession_number)
        .bind(&key.series_instance_uid)
        .bind(&key.anon_series_instance_uid)
        .bind(&key.series_description)
        .bind(&key.protocol_name)
        .bind(&key.frame_of_reference_uid)
        .bind(&key.anon_frame_of_reference_uid)
        .bind(&key.sop_instance_uid)
        .bind(&key.anon_sop_instance_uid)
        .execute(&self.pool)
        .await
        .map_err(DbError::from_sqlx)?;

        key.id = result.last_insert_rowid();
        Ok(key)
    }

    /// 接收端按化名标识逐级匹配. 返回的层级标记了哪些原值是可信的.
    pub async fn lookup_for_anonymous_image(
        &self,
        anon_patient_name: &str,
        anon_patient_id: &str,
        anon_study_instance_uid: &str,
        anon_series_instance_uid: &str,
        anon_sop_instance_uid: &str,
    ) -> Result<Option<AnonymizationKeyMatch>, DbError> {
        let predicates: [(DicomHierarchyLevel, String, Vec<&str>); 4] = [
            (
                DicomHierarchyLevel::Image,
                "anon_patient_name = ? AND anon_patient_id = ? AND anon_study_instance_uid = ? \
                 AND anon_series_instance_uid = ? AND anon_sop_instance_uid = ?"
                    .to_string(),
                vec![
                    anon_patient_name,
                    anon_patient_id,
                    anon_study_instance_uid,
                    anon_series_instance_uid,
                    anon_sop_instance_uid,
                ],
            ),
            (
                DicomHierarchyLevel::Series,
                "anon_patient_name = ? AND anon_patient_id = ? AND anon_study_instance_uid = ? \
                 AND anon_series_instance_uid = ?"
                    .to_string(),
                vec![
                    anon_patient_name,
                    anon_patient_id,
                    anon_study_instance_uid,
                    anon_series_instance_uid,
                ],
            ),
            (
                DicomHierarchyLevel::Study,
                "anon_patient_name = ? AND anon_patient_id = ? AND anon_study_instance_uid = ?"
                    .to_string(),
                vec![anon_patient_name, anon_patient_id, anon_study_instance_uid],
            ),
            (
                DicomHierarchyLevel::Patient,
                "anon_patient_name = ? AND anon_patient_id = ?".to_string(),
                vec![anon_patient_name, anon_patient_id],
            ),
        ];

        for (level, predicate, binds) in predicates {
            let sql = format!(
                "SELECT * FROM anonymization_keys WHERE {} ORDER BY id DESC LIMIT 1",
                predicate
            );
            let mut query = sqlx::query_as::<_, AnonymizationKeyEntity>(&sql);
            for bind in binds {
                query = query.bind(bind);
            }
            if let Some(key) = query
                .fetch_optional(&self.pool)
                .await
                .map_err(DbError::from_sqlx)?
            {
                return Ok(Some(AnonymizationKeyMatch { level, key }));
            }
        }
        Ok(None)
    }

    /// 发送端按原始标识查已有映射, 用于化名复用
    pub async fn query_protected_keys(
        &self,
        patient_name: &str,
        patient_id: &str,
    ) -> Result<Vec<AnonymizationKeyEntity>, DbError> {
        sqlx::query_as::<_, AnonymizationKeyEntity>(
            "SELECT * FROM anonymization_keys WHERE patient_name = ? AND patient_id = ? ORDER BY id",
        )
        .bind(patient_name)
        .bind(patient_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from_sqlx)
    }

    /// 接收端按化名标识列出映射
    pub async fn query_anonymous_keys(
        &self,
        anon_patient_name: &str,
        anon_patient_id: &str,
    ) -> Result<Vec<AnonymizationKeyEntity>, DbError> {
        sqlx::query_as::<_, AnonymizationKeyEntity>(
            "SELECT * FROM anonymization_keys \
             WHERE anon_patient_name = ? AND anon_patient_id = ? ORDER BY id",
        )
        .bind(anon_patient_name)
        .bind(anon_patient_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from_sqlx)
    }

    pub async fn delete_for_image_ids(&self, image_ids: &[i64]) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::from_sqlx)?;
        for image_id in image_ids {
            sqlx::query("DELETE FROM anonymization_keys WHERE image_id = ?")
                .bind(image_id)
                .execute(&mut *tx)
                .await
                .map_err(DbError::from_sqlx)?;
        }
        tx.commit().await.map_err(DbError::from_sqlx)?;
        Ok(())
    }
}
