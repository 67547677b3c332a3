use slog::LevelFilter;
use slog::{Drain, Logger, o};
use std::fs;
use std::fs::OpenOptions;
use std::sync::OnceLock;

/// 获取当前时间
pub fn get_current_time() -> chrono::NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// 当前时间的毫秒时间戳, 事务表的 created/updated 字段都使用它
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// 全局logger静态变量
static GLOBAL_LOGGER: OnceLock<Logger> = OnceLock::new();

// 设置全局logger
pub fn set_global_logger(logger: Logger) {
    let _ = GLOBAL_LOGGER.set(logger);
}

// 获取全局logger
pub fn get_logger() -> &'static Logger {
    GLOBAL_LOGGER.get().expect("Logger not initialized")
}

// 设置日志记录, 控制台 + 文件双写
// 同时设置全局logger
pub fn setup_logging(policy_name: &str) -> Logger {
    // 创建控制台logger
    let stdout_decorator = slog_term::TermDecorator::new().build();
    let stdout_drain = slog_term::FullFormat::new(stdout_decorator).build().fuse();
    let stdout_drain = slog_async::Async::new(stdout_drain).build().fuse();

    // 创建文件logger
    fs::create_dir_all("./logs").unwrap_or(());
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(format!("./logs/{}.log", policy_name))
        .unwrap();

    let file_decorator = slog_term::PlainDecorator::new(file);
    let file_drain = slog_term::FullFormat::new(file_decorator).build().fuse();
    let file_drain = slog_async::Async::new(file_drain).build().fuse();

    // 组合drains
    let drain = slog::Duplicate::new(stdout_drain, file_drain).map(slog::Fuse);
    let drain = LevelFilter::new(drain, slog::Level::Info).map(slog::Fuse);

    let clogger: Logger = Logger::root(drain, o!("version" => env!("CARGO_PKG_VERSION")));

    set_global_logger(clogger.clone());

    clogger
}
