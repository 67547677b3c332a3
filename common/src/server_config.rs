use config::{Config, ConfigError, Environment, File};
use dotenv::dotenv;
use serde::Deserialize;
use std::env;

// 定义配置结构体
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String, //sqlite 连接串, 例如 sqlite://slicebox.db 或 sqlite::memory:
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub name: String, //本节点对外显示的名称
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocalStorageConfig {
    pub dicom_store_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BoxTransferConfig {
    pub poll_interval_secs: u64,
    pub box_timeout_secs: u64,
    pub purge_empty_anonymization_keys: bool,
}

impl Default for BoxTransferConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            box_timeout_secs: 60,
            purge_empty_anonymization_keys: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: Option<ServerConfig>,
    pub database: Option<DatabaseConfig>,
    pub local_storage: Option<LocalStorageConfig>,
    pub box_transfer: Option<BoxTransferConfig>,
}

static APP_ENV: &str = "APP_ENV";
static APP_PREFIX: &str = "SLICEBOX";

pub fn load_config() -> Result<AppConfig, ConfigError> {
    // 1. 加载 .env 文件
    dotenv().ok();

    // 2. 从 .env 获取当前环境 (默认 dev)
    let env = env::var(APP_ENV).unwrap_or_else(|_| "dev".into());

    // 3. 动态加载配置文件 (如 application.dev.json)
    let config_path = format!("application.{}.json", env);

    // 4. 允许环境变量覆盖配置 (如 SLICEBOX_SERVER_PORT=...)
    let settings = Config::builder()
        .add_source(File::with_name(&config_path).required(true))
        .add_source(Environment::with_prefix(APP_PREFIX).prefix_separator("_"))
        .build()?;

    // 5. 解析配置到结构体
    let app_config: AppConfig = settings.try_deserialize()?;
    Ok(app_config)
}

pub fn generate_database_connection(app_config: &AppConfig) -> Result<String, String> {
    match &app_config.database {
        Some(database) => Ok(database.url.clone()),
        None => Err("database config is none".to_string()),
    }
}
