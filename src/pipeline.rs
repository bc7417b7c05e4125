use std::path::PathBuf;

use tracing::info;

use crate::acs::{self, CsvSummary, PopulationStats};
use crate::choropleth::{self, ChoroplethOptions, ChoroplethSummary};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::geometry::{self, TractCollectionSummary};

#[derive(Clone, Debug, PartialEq)]
pub enum GeometryStage {
    /// An existing simplified GeoJSON was used as is.
    Reused(PathBuf),
    Built {
        tracts: TractCollectionSummary,
        simplified: PathBuf,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunReport {
    pub geometry: GeometryStage,
    pub csv: CsvSummary,
    pub stats: Option<PopulationStats>,
    pub map: ChoroplethSummary,
}

/// Runs geometry, attribute and render stages in order, stopping at the first error.
pub fn run(config: &PipelineConfig) -> Result<RunReport> {
    let geometry = build_geometry(config)?;

    let processed_csv = config.processed_csv_path();
    let csv = acs::process_acs_csv(
        &config.acs_file,
        &processed_csv,
        &config.column_mapping,
        &config.geo_id_column,
        &config.summary_level,
    )?;
    let stats = acs::population_stats(&processed_csv, &config.value_column)?;

    let map = choropleth::generate_choropleth(
        &processed_csv,
        &config.simplified_json_path(),
        &config.token_file,
        &config.choropleth_html_path(),
        &ChoroplethOptions::for_column(config.value_column.as_str()),
    )?;

    Ok(RunReport {
        geometry,
        csv,
        stats,
        map,
    })
}

fn build_geometry(config: &PipelineConfig) -> Result<GeometryStage> {
    let simplified = config.simplified_json_path();
    if simplified.is_file() && !config.rebuild_geometry {
        info!(path = %simplified.display(), "reusing simplified GeoJSON");
        return Ok(GeometryStage::Reused(simplified));
    }

    let geojson = config.geojson_output_path();
    let tracts = geometry::convert_to_geojson(&config.tract_zip_dir, &geojson)?;
    let simplified = geometry::simplify_geojson(&geojson, &simplified, config.simplify_tolerance)?;
    Ok(GeometryStage::Built { tracts, simplified })
}
