//! SQL text builders, one module per table

pub mod analysis;
pub mod chunks;
pub mod data_loss;
pub mod ddl;
pub mod devices;
pub mod metadata;
pub mod sessions;
pub mod tokens;
pub mod violations;
