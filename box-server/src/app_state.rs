use common::events::EventBus;
use common::server_config::BoxTransferConfig;
use common::storage::StorageService;
use database::anonymization_store::AnonymizationStore;
use database::image_meta_store::ImageMetaStore;
use database::transfer_store::TransferStore;
use dicom_streams::validation::ValidationContext;
use slog::Logger;
use sqlx::SqlitePool;

// 应用状态, 所有控制器和工作任务共享
#[derive(Clone)]
pub struct AppState {
    pub log: Logger,
    pub transfer: TransferStore,
    pub anonymization: AnonymizationStore,
    pub images: ImageMetaStore,
    pub storage: StorageService,
    pub events: EventBus,
    pub contexts: Vec<ValidationContext>,
    pub box_config: BoxTransferConfig,
    pub node_name: String,
}

impl AppState {
    pub fn new(
        log: Logger,
        pool: SqlitePool,
        storage: StorageService,
        box_config: BoxTransferConfig,
        node_name: String,
    ) -> Self {
        Self {
            log,
            transfer: TransferStore::new(pool.clone()),
            anonymization: AnonymizationStore::new(pool.clone()),
            images: ImageMetaStore::new(pool),
            storage,
            events: EventBus::new(),
            contexts: dicom_streams::validation::default_contexts(),
            box_config,
            node_name,
        }
    }
}
