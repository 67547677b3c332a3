pub mod anonymization_meta;
pub mod anonymization_store;
pub mod dbprovider;
pub mod image_meta_store;
pub mod transfer_meta;
pub mod transfer_store;
