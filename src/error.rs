use std::path::PathBuf;

use census::GeoIdError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No usable geometry input. Callers are expected to check for this and abort.
    #[error("no input: {0}")]
    NoInput(String),

    #[error("{path}: missing required columns {columns:?}")]
    MissingColumns { path: PathBuf, columns: Vec<String> },

    #[error("{path}: CSV file must contain a '{column}' column")]
    MissingIdentifierColumn { path: PathBuf, column: String },

    #[error("{path}: invalid GeoJSON structure: {reason}")]
    InvalidGeoJson { path: PathBuf, reason: String },

    #[error("no matching identifiers between CSV and GeoJSON")]
    NoMatchingIdentifiers,

    #[error("cannot read access token {path}")]
    MissingTokenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("data row {row}: invalid identifier")]
    InvalidGeoId {
        row: usize,
        #[source]
        source: GeoIdError,
    },

    #[error("config {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Polars(#[from] polars::prelude::PolarsError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    GeoJson(#[from] geojson::Error),

    #[error(transparent)]
    Shapefile(#[from] shapefile::Error),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Template(#[from] handlebars::RenderError),
}
