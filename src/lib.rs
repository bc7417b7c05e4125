pub mod acs;
pub mod choropleth;
pub mod config;
pub mod error;
pub mod geometry;
pub mod pipeline;

pub use config::{ColumnMapping, PipelineConfig};
pub use error::{Error, Result};
