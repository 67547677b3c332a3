use crate::dbprovider::DbError;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};

pub async fn create_tables(pool: &SqlitePool) -> Result<(), DbError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS images (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            patient_id TEXT NOT NULL,
            patient_name TEXT NOT NULL,
            study_instance_uid TEXT NOT NULL,
            series_instance_uid TEXT NOT NULL,
            sop_instance_uid TEXT NOT NULL,
            created INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(DbError::from_sqlx)?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_unique_image \
         ON images(series_instance_uid, sop_instance_uid)",
    )
    .execute(pool)
    .await
    .map_err(DbError::from_sqlx)?;

    Ok(())
}

/// 影像编目行. 接收路径只需要 "新影像还是覆盖" 这一个回答.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    #[serde(rename = "id")]
    pub id: i64,
    #[serde(rename = "patient_id")]
    pub patient_id: String,
    #[serde(rename = "patient_name")]
    pub patient_name: String,
    #[serde(rename = "study_instance_uid")]
    pub study_instance_uid: String,
    #[serde(rename = "series_instance_uid")]
    pub series_instance_uid: String,
    #[serde(rename = "sop_instance_uid")]
    pub sop_instance_uid: String,
    #[serde(rename = "created")]
    pub created: i64,
}

impl sqlx::FromRow<'_, SqliteRow> for ImageRecord {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(ImageRecord {
            id: row.get("id"),
            patient_id: row.get("patient_id"),
            patient_name: row.get("patient_name"),
            study_instance_uid: row.get("study_instance_uid"),
            series_instance_uid: row.get("series_instance_uid"),
            sop_instance_uid: row.get("sop_instance_uid"),
            created: row.get("created"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ImageMetaStore {
    pool: SqlitePool,
}

impl ImageMetaStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 按 (序列, SOP实例) 查重后插入. 已存在时返回原行并报告覆盖.
    pub async fn insert_or_get(
        &self,
        patient_id: &str,
        patient_name: &str,
        study_instance_uid: &str,
        series_instance_uid: &str,
        sop_instance_uid: &str,
        now: i64,
    ) -> Result<(ImageRecord, bool), DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::from_sqlx)?;

        let existing = sqlx::query_as::<_, ImageRecord>(
            "SELECT * FROM images WHERE series_instance_uid = ? AND sop_instance_uid = ?",
        )
        .bind(series_instance_uid)
        .bind(sop_instance_uid)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::from_sqlx)?;

        if let Some(record) = existing {
            tx.commit().await.map_err(DbError::from_sqlx)?;
            return Ok((record, true));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO images
                (patient_id, patient_name, study_instance_uid, series_instance_uid,
                 sop_instance_uid, created)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(patient_id)
        .bind(patient_name)
        .bind(study_instance_uid)
        .bind(series_instance_uid)
        .bind(sop_instance_uid)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(DbError::from_sqlx)?;
        let id = result.last_insert_rowid();

        tx.commit().await.map_err(DbError::from_sqlx)?;

        let record = self
            .image_by_id(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("image {}", id)))?;
        Ok((record, false))
    }

    pub async fn image_by_id(&self, image_id: i64) -> Result<Option<ImageRecord>, DbError> {
        sqlx::query_as::<_, ImageRecord>("SELECT * FROM images WHERE id = ?")
            .bind(image_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from_sqlx)
    }

    pub async fn delete_images(&self, image_ids: &[i64]) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::from_sqlx)?;
        for image_id in image_ids {
            sqlx::query("DELETE FROM images WHERE id = ?")
                .bind(image_id)
                .execute(&mut *tx)
                .await
                .map_err(DbError::from_sqlx)?;
        }
        tx.commit().await.map_err(DbError::from_sqlx)?;
        Ok(())
    }
}
