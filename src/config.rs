use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable naming a JSON file with path overrides.
pub const CONFIG_ENV: &str = "CENSUS_CONFIG";

/// Maps one raw ACS column code to the name it gets in the cleaned CSV.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub source: String,
    pub name: String,
}

impl ColumnMapping {
    pub fn new(source: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
        }
    }
}

/// Everything a run needs, built once at startup and passed to each stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Directory holding `.shp` files and/or `*_tract.zip` archives.
    pub tract_zip_dir: PathBuf,
    /// Raw ACS export.
    pub acs_file: PathBuf,
    /// Plaintext Mapbox access token.
    pub token_file: PathBuf,
    pub output_dir: PathBuf,
    // Individual outputs default to a file name under `output_dir`
    pub processed_csv: Option<PathBuf>,
    pub geojson_output: Option<PathBuf>,
    pub simplified_json: Option<PathBuf>,
    pub choropleth_html: Option<PathBuf>,
    pub geo_id_column: String,
    /// Summary level every `GEO_ID` must carry, `140` for tracts.
    pub summary_level: String,
    pub column_mapping: Vec<ColumnMapping>,
    /// Cleaned column that drives the map color.
    pub value_column: String,
    pub simplify_tolerance: f64,
    /// Re-run shapefile ingestion even if the simplified GeoJSON exists.
    pub rebuild_geometry: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tract_zip_dir: PathBuf::from("data/tractzips"),
            acs_file: PathBuf::from("data/ACSST5Y2021.S2701-Data.csv"),
            token_file: PathBuf::from("config/accesstoken.txt"),
            output_dir: PathBuf::from("output"),
            processed_csv: None,
            geojson_output: None,
            simplified_json: None,
            choropleth_html: None,
            geo_id_column: "GEO_ID".to_string(),
            summary_level: census::TRACT_SUMMARY_LEVEL.to_string(),
            column_mapping: vec![ColumnMapping::new("S2701_C01_001E", "Total_Population")],
            value_column: "Total_Population".to_string(),
            simplify_tolerance: 1e-7,
            rebuild_geometry: false,
        }
    }
}

impl PipelineConfig {
    /// Defaults, overridden by the JSON file at `path` if one is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if config.column_mapping.is_empty() {
            return Err(Error::Config {
                path: path.to_path_buf(),
                reason: "column_mapping must not be empty".to_string(),
            });
        }
        Ok(config)
    }

    pub fn processed_csv_path(&self) -> PathBuf {
        self.output_path(&self.processed_csv, "tract_population.csv")
    }

    pub fn geojson_output_path(&self) -> PathBuf {
        self.output_path(&self.geojson_output, "tracts.geojson")
    }

    pub fn simplified_json_path(&self) -> PathBuf {
        self.output_path(&self.simplified_json, "tracts_simplified.json")
    }

    pub fn choropleth_html_path(&self) -> PathBuf {
        self.output_path(&self.choropleth_html, "tract_choropleth.html")
    }

    fn output_path(&self, explicit: &Option<PathBuf>, file_name: &str) -> PathBuf {
        explicit
            .clone()
            .unwrap_or_else(|| self.output_dir.join(file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let config = PipelineConfig::load(None).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(
            config.processed_csv_path(),
            PathBuf::from("output/tract_population.csv")
        );
    }

    #[test]
    fn overrides_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "output_dir": "/tmp/out",
                "acs_file": "/tmp/acs.csv",
                "simplified_json": "/tmp/pre/tracts.json",
                "column_mapping": [
                    {"source": "S2701_C01_001E", "name": "Total_Population"},
                    {"source": "S2701_C01_002E", "name": "Insured_Population"}
                ]
            }"#,
        )
        .unwrap();

        let config = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.acs_file, PathBuf::from("/tmp/acs.csv"));
        assert_eq!(config.simplified_json_path(), PathBuf::from("/tmp/pre/tracts.json"));
        assert_eq!(
            config.choropleth_html_path(),
            PathBuf::from("/tmp/out/tract_choropleth.html")
        );
        assert_eq!(config.column_mapping.len(), 2);
        // Untouched keys keep their defaults
        assert_eq!(config.geo_id_column, "GEO_ID");
    }

    #[test]
    fn rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"outptu_dir": "typo"}"#).unwrap();
        assert!(matches!(
            PipelineConfig::load(Some(&path)),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = PipelineConfig::load(Some(Path::new("/nonexistent/config.json"))).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
