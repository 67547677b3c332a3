use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    DatabaseError(String),

    #[error("Record already exists")]
    AlreadyExists,

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),
}

impl DbError {
    /// 唯一索引冲突映射为 AlreadyExists, 其余数据库错误视为可重试
    pub fn from_sqlx(e: sqlx::Error) -> Self {
        if let Some(db_err) = e.as_database_error() {
            if db_err.kind() == sqlx::error::ErrorKind::UniqueViolation {
                return DbError::AlreadyExists;
            }
        }
        DbError::DatabaseError(e.to_string())
    }
}

pub fn current_time() -> chrono::NaiveDateTime {
    chrono::Local::now().naive_local()
}

pub async fn connect_pool(database_url: &str) -> Result<SqlitePool, DbError> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| DbError::DatabaseError(e.to_string()))?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .connect_with(options)
        .await
        .map_err(|e| DbError::DatabaseError(e.to_string()))?;

    tracing::info!("Connected database pool: {}", database_url);
    Ok(pool)
}

/// 启动时建表建索引, 全部 IF NOT EXISTS, 可重复执行
pub async fn create_all_tables(pool: &SqlitePool) -> Result<(), DbError> {
    crate::transfer_store::create_tables(pool).await?;
    crate::anonymization_store::create_tables(pool).await?;
    crate::image_meta_store::create_tables(pool).await?;
    tracing::info!("Database tables created");
    Ok(())
}

#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = connect_pool("sqlite::memory:").await.unwrap();
    create_all_tables(&pool).await.unwrap();
    pool
}
