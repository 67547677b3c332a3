use bytes::Bytes;
use slog::{Logger, info, warn};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Duration;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage IO failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object not found: {0}")]
    NotFound(String),
}

const SOURCE_CHUNK_SIZE: usize = 8192;

/// 管道失败后延迟清理临时文件, 等操作系统释放文件句柄
const TMP_CLEANUP_DELAY_SECS: u64 = 15;

/// 影像对象存储. key 是 image_name 产生的字符串, 临时对象统一使用 tmp- 前缀.
#[derive(Debug, Clone)]
pub struct StorageService {
    base_path: PathBuf,
}

impl StorageService {
    pub fn new<P: Into<PathBuf>>(base_path: P) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub async fn ensure_base(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.base_path).await?;
        Ok(())
    }

    /// 存储对象名, 不约定任何目录结构
    pub fn image_name(image_id: i64) -> String {
        image_id.to_string()
    }

    pub fn tmp_name() -> String {
        format!("tmp-{}", Uuid::new_v4())
    }

    fn resolve(&self, name: &str) -> PathBuf {
        Path::new(&self.base_path).join(name)
    }

    pub async fn file_sink(&self, name: &str) -> Result<FileSink, StorageError> {
        let path = self.resolve(name);
        let file = fs::File::create(&path).await?;
        Ok(FileSink { file })
    }

    pub async fn file_source(&self, name: &str) -> Result<FileSource, StorageError> {
        let path = self.resolve(name);
        let file = fs::File::open(&path)
            .await
            .map_err(|_| StorageError::NotFound(name.to_string()))?;
        Ok(FileSource { file })
    }

    pub async fn read_file(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        let mut source = self.file_source(name).await?;
        let mut data = Vec::new();
        while let Some(chunk) = source.next_chunk().await? {
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    pub async fn write_file(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        let mut sink = self.file_sink(name).await?;
        sink.write_chunk(data).await?;
        sink.finish().await
    }

    /// 同一后端内的原子改名, 接收管道用它把临时对象转正
    pub async fn move_file(&self, src_name: &str, dst_name: &str) -> Result<(), StorageError> {
        fs::rename(self.resolve(src_name), self.resolve(dst_name)).await?;
        Ok(())
    }

    pub async fn contains(&self, name: &str) -> bool {
        fs::metadata(self.resolve(name)).await.is_ok()
    }

    pub async fn delete_from_storage(&self, image_ids: &[i64]) -> Result<(), StorageError> {
        let names: Vec<String> = image_ids.iter().map(|id| Self::image_name(*id)).collect();
        self.delete_by_name(&names).await
    }

    pub async fn delete_by_name(&self, names: &[String]) -> Result<(), StorageError> {
        for name in names {
            match fs::remove_file(self.resolve(name)).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
        Ok(())
    }

    pub fn schedule_tmp_cleanup(&self, name: &str, log: Logger) {
        let path = self.resolve(name);
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(TMP_CLEANUP_DELAY_SECS)).await;
            match fs::remove_file(&path).await {
                Ok(_) => {
                    info!(log, "Removed stale temp object {}", name);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(log, "Failed to remove temp object {}: {}", name, e);
                }
            }
        });
    }
}

pub struct FileSink {
    file: fs::File,
}

impl FileSink {
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.file.write_all(data).await?;
        Ok(())
    }

    pub async fn finish(mut self) -> Result<(), StorageError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }
}

pub struct FileSource {
    file: fs::File,
}

impl FileSource {
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, StorageError> {
        let mut buf = vec![0u8; SOURCE_CHUNK_SIZE];
        let n = self.file.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(Bytes::from(buf)))
    }
}
