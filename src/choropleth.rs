//! Plotly.js choropleth of a cleaned ACS CSV over tract boundaries.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use census::Geoid;
use handlebars::Handlebars;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::acs::{self, GEOID_COLUMN};
use crate::error::{Error, Result};
use crate::geometry::GEOID_PROPERTY;

const PLOTLY_JS: &str = "https://cdn.plot.ly/plotly-2.35.2.min.js";

/// How the map looks. The defaults give a national view of tract population.
#[derive(Clone, Debug, PartialEq)]
pub struct ChoroplethOptions {
    pub value_column: String,
    pub title: String,
    pub color_scale: String,
    /// Upper end of the color range, as a quantile of the value column.
    pub clip_quantile: f64,
    pub center_lat: f64,
    pub center_lon: f64,
    pub zoom: f64,
    pub map_style: String,
    pub source_note: String,
}

impl Default for ChoroplethOptions {
    fn default() -> Self {
        Self {
            value_column: "Total_Population".to_string(),
            title: "Census Tract Population Distribution".to_string(),
            color_scale: "Reds".to_string(),
            clip_quantile: 0.99,
            center_lat: 37.0902,
            center_lon: -95.7129,
            zoom: 3.5,
            map_style: "light".to_string(),
            source_note: "Source: U.S. Census Bureau, American Community Survey".to_string(),
        }
    }
}

impl ChoroplethOptions {
    pub fn for_column(value_column: impl Into<String>) -> Self {
        Self {
            value_column: value_column.into(),
            ..Self::default()
        }
    }

    fn label(&self) -> String {
        self.value_column.replace('_', " ")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChoroplethSummary {
    pub output: PathBuf,
    /// Identifiers present in both the CSV and the GeoJSON.
    pub matched: usize,
    /// Top of the color range after clipping.
    pub color_max: f64,
}

/// Joins `csv` to `geojson` on `GEOID` and writes a standalone HTML map to `output_html`.
///
/// Nothing is written unless the CSV has a `GEOID` column, the GeoJSON has a `features`
/// list, at least one identifier matches and the token file can be read.
pub fn generate_choropleth(
    csv: &Path,
    geojson: &Path,
    token_file: &Path,
    output_html: &Path,
    options: &ChoroplethOptions,
) -> Result<ChoroplethSummary> {
    let df = acs::read_text_csv(csv)?;
    if !acs::has_column(&df, GEOID_COLUMN) {
        return Err(Error::MissingIdentifierColumn {
            path: csv.to_path_buf(),
            column: GEOID_COLUMN.to_string(),
        });
    }

    let mut collection = load_feature_collection(geojson)?;
    acs::require_columns(&df, csv, [options.value_column.as_str()])?;

    let raw_ids = acs::text_column(&df, GEOID_COLUMN)?;
    let raw_values = acs::numeric_column(&df, &options.value_column)?;
    let mut locations = Vec::with_capacity(raw_ids.len());
    let mut values = Vec::with_capacity(raw_ids.len());
    let mut rejected = 0;
    for (raw, value) in raw_ids.iter().zip(raw_values) {
        match raw.as_deref().map(Geoid::normalize) {
            Some(Ok(geoid)) => {
                locations.push(geoid);
                values.push(value);
            }
            _ => rejected += 1,
        }
    }
    if rejected > 0 {
        warn!(rejected, path = %csv.display(), "ignoring rows without a usable GEOID");
    }

    let feature_ids = normalize_feature_geoids(&mut collection);
    let matched = locations
        .iter()
        .filter(|geoid| feature_ids.contains(*geoid))
        .collect::<HashSet<_>>()
        .len();
    if matched == 0 {
        return Err(Error::NoMatchingIdentifiers);
    }
    info!(matched, rows = locations.len(), features = feature_ids.len(), "found matching GEOIDs");

    let token = fs::read_to_string(token_file)
        .map_err(|source| Error::MissingTokenFile {
            path: token_file.to_path_buf(),
            source,
        })?
        .trim()
        .to_string();
    if token.is_empty() {
        warn!(path = %token_file.display(), "access token is empty");
    }

    let color_max = acs::percentile(&values, options.clip_quantile)?.unwrap_or(0.0);
    let figure = figure(collection, &locations, &values, color_max, &token, options);
    if let Some(parent) = output_html.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(output_html, render_html(&options.title, &figure)?)?;
    info!(output = %output_html.display(), "wrote choropleth map");

    Ok(ChoroplethSummary {
        output: output_html.to_path_buf(),
        matched,
        color_max,
    })
}

fn load_feature_collection(path: &Path) -> Result<Value> {
    let invalid = |reason: String| Error::InvalidGeoJson {
        path: path.to_path_buf(),
        reason,
    };
    let collection: Value =
        serde_json::from_str(&fs::read_to_string(path)?).map_err(|e| invalid(e.to_string()))?;
    match collection.get("features") {
        Some(Value::Array(_)) => Ok(collection),
        Some(_) => Err(invalid("'features' is not a list".to_string())),
        None => Err(invalid("'features' not found".to_string())),
    }
}

// Rewrites each feature's identifier to the CSV side's normalized form, so plotly's
// featureidkey lookup finds "01001" where the source had a numeric 1001
fn normalize_feature_geoids(collection: &mut Value) -> HashSet<Geoid> {
    let mut ids = HashSet::new();
    let Some(features) = collection.get_mut("features").and_then(Value::as_array_mut) else {
        return ids;
    };
    for feature in features {
        let Some(id) = feature
            .get_mut("properties")
            .and_then(|properties| properties.get_mut(GEOID_PROPERTY))
        else {
            continue;
        };
        let geoid = match id {
            Value::String(s) => Geoid::normalize(s).ok(),
            Value::Number(n) => n.as_u64().and_then(|n| Geoid::normalize(&n.to_string()).ok()),
            _ => None,
        };
        if let Some(geoid) = geoid {
            *id = Value::String(geoid.to_string());
            ids.insert(geoid);
        }
    }
    ids
}

fn figure(
    collection: Value,
    locations: &[Geoid],
    values: &[f64],
    color_max: f64,
    token: &str,
    options: &ChoroplethOptions,
) -> Value {
    let label = options.label();
    let mut figure = json!({
        "data": [{
            "type": "choroplethmapbox",
            "featureidkey": format!("properties.{GEOID_PROPERTY}"),
            "locations": locations,
            "z": values,
            "zmin": 0.0,
            "zmax": color_max,
            "colorscale": options.color_scale,
            "marker": {
                "opacity": 1.0,
                "line": {"width": 1e-9, "color": "#D3D3D3"}
            },
            "colorbar": {
                "title": {"text": label, "side": "bottom"},
                "orientation": "h",
                "x": 0.5,
                "xanchor": "center",
                "y": -1e-8,
                "yanchor": "top",
                "len": 0.9
            },
            "hovertemplate": format!("GEOID=%{{location}}<br>{label}=%{{z}}<extra></extra>")
        }],
        "layout": {
            "mapbox": {
                "accesstoken": token,
                "style": options.map_style,
                "center": {"lat": options.center_lat, "lon": options.center_lon},
                "zoom": options.zoom
            },
            "margin": {"r": 0, "t": 25, "l": 0, "b": 0},
            "title": {"text": options.title, "xanchor": "center", "x": 0.5},
            "annotations": [{
                "text": options.source_note,
                "xref": "paper",
                "yref": "paper",
                "x": 0.01,
                "y": 0.01,
                "showarrow": false,
                "font": {"size": 10},
                "align": "left"
            }]
        }
    });
    figure["data"][0]["geojson"] = collection;
    figure
}

const PAGE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>{{title}}</title>
<script src="{{plotly_js}}" charset="utf-8"></script>
<style>html, body, #map { margin: 0; width: 100%; height: 100%; }</style>
</head>
<body>
<div id="map"></div>
<script>
const figure = {{{figure}}};
Plotly.newPlot("map", figure.data, figure.layout, { responsive: true });
</script>
</body>
</html>
"#;

fn render_html(title: &str, figure: &Value) -> Result<String> {
    // Keep embedded strings from closing the script element
    let figure = serde_json::to_string(figure)?.replace("</", "<\\/");
    let page = Handlebars::new().render_template(
        PAGE_TEMPLATE,
        &json!({"title": title, "plotly_js": PLOTLY_JS, "figure": figure}),
    )?;
    Ok(page)
}
