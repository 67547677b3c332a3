pub mod anonymization;
pub mod collect;
pub mod harmonization;
pub mod modify;
pub mod parser;
pub mod parts;
pub mod pipeline;
pub mod uids;
pub mod validation;
pub mod writer;
