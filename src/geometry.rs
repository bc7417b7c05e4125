//! Shapefile ingestion and GeoJSON simplification.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use census::Geoid;
use geo::{BooleanOps, Coord, LineString, MultiPolygon, Polygon, SimplifyVwPreserve, Validation};
use geojson::{Feature, FeatureCollection, GeoJson};
use shapefile::dbase::{FieldValue, Record};
use shapefile::{PolygonRing, Shape};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Property under which every written feature carries its identifier.
pub const GEOID_PROPERTY: &str = "GEOID";

const GEOID_ALIASES: [&str; 3] = ["GEOID", "GEOID20", "GEOID10"];

// State, county and tract code fields, per TIGER vintage
const COMPONENT_FIELDS: [[&str; 3]; 3] = [
    ["STATEFP", "COUNTYFP", "TRACTCE"],
    ["STATEFP20", "COUNTYFP20", "TRACTCE20"],
    ["STATEFP10", "COUNTYFP10", "TRACTCE10"],
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TractCollectionSummary {
    pub output: PathBuf,
    /// Shapefiles that were read successfully.
    pub files: usize,
    pub tracts: usize,
    /// Geometries that failed validation and were rebuilt.
    pub repaired: usize,
    /// Records dropped for a null shape, a missing identifier or a duplicate.
    pub skipped: usize,
}

struct Tract {
    geoid: Geoid,
    geometry: MultiPolygon<f64>,
}

/// Reads every shapefile in `input_dir` (and inside any zip archive there) and writes one
/// `FeatureCollection` keyed by `GEOID` to `output_path`.
///
/// Returns [`Error::NoInput`] when the directory is missing or nothing usable was read.
pub fn convert_to_geojson(input_dir: &Path, output_path: &Path) -> Result<TractCollectionSummary> {
    if !input_dir.is_dir() {
        return Err(Error::NoInput(format!(
            "directory not found: {}",
            input_dir.display()
        )));
    }

    // Extracted archives live only as long as this function
    let scratch = tempfile::tempdir()?;
    let mut shapefiles = list_shapefiles(input_dir, false)?;
    shapefiles.extend(extract_shapefiles(input_dir, scratch.path())?);
    shapefiles.sort_by(|a, b| a.file_name().cmp(&b.file_name()).then_with(|| a.cmp(b)));

    if shapefiles.is_empty() {
        return Err(Error::NoInput(format!(
            "no shapefiles found in {}",
            input_dir.display()
        )));
    }

    let mut seen = HashSet::new();
    let mut tracts = Vec::new();
    let mut files = 0;
    let mut repaired = 0;
    let mut skipped = 0;
    for path in &shapefiles {
        let file_tracts = match read_tracts(path) {
            Ok(file_tracts) => file_tracts,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable shapefile");
                continue;
            }
        };
        files += 1;
        skipped += file_tracts.skipped;
        for mut tract in file_tracts.tracts {
            if !seen.insert(tract.geoid.clone()) {
                warn!(geoid = %tract.geoid, path = %path.display(), "dropping duplicate tract");
                skipped += 1;
                continue;
            }
            if !tract.geometry.is_valid() {
                debug!(geoid = %tract.geoid, "repairing invalid geometry");
                tract.geometry = repair(&tract.geometry);
                repaired += 1;
            }
            tracts.push(tract);
        }
    }

    if tracts.is_empty() {
        return Err(Error::NoInput(format!(
            "no valid shapefiles could be read from {}",
            input_dir.display()
        )));
    }

    let collection: FeatureCollection = tracts.iter().map(tract_feature).collect();
    write_geojson(output_path, collection)?;
    info!(
        files,
        tracts = tracts.len(),
        repaired,
        skipped,
        output = %output_path.display(),
        "wrote tract GeoJSON"
    );

    Ok(TractCollectionSummary {
        output: output_path.to_path_buf(),
        files,
        tracts: tracts.len(),
        repaired,
        skipped,
    })
}

/// Unpacks every `.zip` in `zip_dir` into its own folder under `dest_dir` and returns the
/// `.shp` files found, sorted. Archives that cannot be opened are skipped with a warning.
pub fn extract_shapefiles(zip_dir: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut archives: Vec<PathBuf> = fs::read_dir(zip_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && has_extension(path, "zip"))
        .collect();
    archives.sort();

    let mut shapefiles = Vec::new();
    for archive_path in archives {
        let stem = archive_path
            .file_stem()
            .map(|s| s.to_os_string())
            .unwrap_or_default();
        let target = dest_dir.join(stem);
        match extract_archive(&archive_path, &target) {
            Ok(found) => shapefiles.extend(found),
            Err(e) => {
                warn!(archive = %archive_path.display(), error = %e, "skipping unreadable archive")
            }
        }
    }
    shapefiles.sort();
    Ok(shapefiles)
}

fn extract_archive(archive_path: &Path, target: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(target)?;
    let mut archive = zip::ZipArchive::new(fs::File::open(archive_path)?)?;
    archive.extract(target)?;
    debug!(archive = %archive_path.display(), "extracted");
    list_shapefiles(target, true)
}

/// Simplifies every (multi)polygon in a `FeatureCollection` with topology-preserving
/// Visvalingam-Whyatt.
///
/// `tolerance` is a triangle-area threshold in squared coordinate units (deg² for
/// geographic data), not a distance: vertices whose effective area falls below it are
/// removed.
pub fn simplify_geojson(input_path: &Path, output_path: &Path, tolerance: f64) -> Result<PathBuf> {
    let raw = fs::read_to_string(input_path)?;
    let mut collection = match raw.parse::<GeoJson>()? {
        GeoJson::FeatureCollection(collection) => collection,
        _ => {
            return Err(Error::InvalidGeoJson {
                path: input_path.to_path_buf(),
                reason: "expected a FeatureCollection".to_string(),
            })
        }
    };

    let mut removed = 0;
    for feature in &mut collection.features {
        let Some(geometry) = feature.geometry.as_mut() else {
            continue;
        };
        let simplified = match geo::Geometry::<f64>::try_from(geometry.value.clone())? {
            geo::Geometry::Polygon(polygon) => {
                geo::Geometry::Polygon(polygon.simplify_vw_preserve(&tolerance))
            }
            geo::Geometry::MultiPolygon(polygons) => {
                geo::Geometry::MultiPolygon(polygons.simplify_vw_preserve(&tolerance))
            }
            _ => continue,
        };
        let value = geojson::Value::from(&simplified);
        removed += vertex_count(&geometry.value).saturating_sub(vertex_count(&value));
        geometry.value = value;
    }

    let features = collection.features.len();
    write_geojson(output_path, collection)?;
    info!(features, removed, output = %output_path.display(), "wrote simplified GeoJSON");
    Ok(output_path.to_path_buf())
}

struct FileTracts {
    tracts: Vec<Tract>,
    skipped: usize,
}

fn read_tracts(path: &Path) -> Result<FileTracts> {
    let mut reader = shapefile::Reader::from_path(path)?;
    let mut tracts = Vec::new();
    let mut skipped = 0;
    for (row, result) in reader.iter_shapes_and_records().enumerate() {
        let (shape, record) = result?;
        let geometry = match shape {
            Shape::Polygon(polygon) => rings_to_multipolygon(polygon.rings()),
            Shape::PolygonM(polygon) => rings_to_multipolygon(polygon.rings()),
            Shape::PolygonZ(polygon) => rings_to_multipolygon(polygon.rings()),
            Shape::NullShape => {
                warn!(path = %path.display(), row, "skipping null shape");
                skipped += 1;
                continue;
            }
            other => {
                warn!(path = %path.display(), row, shape = ?other.shapetype(), "skipping non-polygon shape");
                skipped += 1;
                continue;
            }
        };
        match record_geoid(&record) {
            Some(geoid) => tracts.push(Tract { geoid, geometry }),
            None => {
                warn!(path = %path.display(), row, "skipping record without a tract identifier");
                skipped += 1;
            }
        }
    }
    Ok(FileTracts { tracts, skipped })
}

/// First usable identifier alias, else one assembled from state, county and tract codes.
fn record_geoid(record: &Record) -> Option<Geoid> {
    if let Some(geoid) = GEOID_ALIASES
        .iter()
        .find_map(|name| field_text(record, name))
        .and_then(|raw| Geoid::normalize(&raw).ok())
    {
        return Some(geoid);
    }
    COMPONENT_FIELDS.iter().find_map(|fields| {
        let parts = fields
            .iter()
            .map(|name| field_text(record, name))
            .collect::<Option<Vec<_>>>()?;
        Geoid::normalize(&parts.concat()).ok()
    })
}

fn field_text(record: &Record, name: &str) -> Option<String> {
    let text = match record.get(name)? {
        FieldValue::Character(Some(value)) => value.trim().to_string(),
        FieldValue::Numeric(Some(value)) => format!("{value:.0}"),
        FieldValue::Integer(value) => value.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

trait PlanarPoint {
    fn coord(&self) -> Coord<f64>;
}

impl PlanarPoint for shapefile::Point {
    fn coord(&self) -> Coord<f64> {
        Coord { x: self.x, y: self.y }
    }
}

impl PlanarPoint for shapefile::PointM {
    fn coord(&self) -> Coord<f64> {
        Coord { x: self.x, y: self.y }
    }
}

impl PlanarPoint for shapefile::PointZ {
    fn coord(&self) -> Coord<f64> {
        Coord { x: self.x, y: self.y }
    }
}

// Each outer ring opens a polygon; inner rings belong to the last one opened
fn rings_to_multipolygon<P: PlanarPoint>(rings: &[PolygonRing<P>]) -> MultiPolygon<f64> {
    let mut polygons: Vec<(LineString<f64>, Vec<LineString<f64>>)> = Vec::new();
    for ring in rings {
        let line: LineString<f64> = ring.points().iter().map(PlanarPoint::coord).collect();
        if let (PolygonRing::Inner(_), Some((_, interiors))) = (ring, polygons.last_mut()) {
            interiors.push(line);
            continue;
        }
        polygons.push((line, Vec::new()));
    }
    MultiPolygon::new(
        polygons
            .into_iter()
            .map(|(exterior, interiors)| Polygon::new(exterior, interiors))
            .collect(),
    )
}

/// Zero-width rebuild: a boolean union with nothing re-nodes self-intersections.
fn repair(geometry: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    geometry.union(&MultiPolygon::new(Vec::new()))
}

fn tract_feature(tract: &Tract) -> Feature {
    let value = match tract.geometry.0.as_slice() {
        [polygon] => geojson::Value::from(polygon),
        _ => geojson::Value::from(&tract.geometry),
    };
    let mut feature = Feature {
        bbox: None,
        geometry: Some(geojson::Geometry::new(value)),
        id: None,
        properties: None,
        foreign_members: None,
    };
    feature.set_property(GEOID_PROPERTY, tract.geoid.as_str());
    feature
}

fn write_geojson(path: &Path, collection: FeatureCollection) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, GeoJson::from(collection).to_string())?;
    Ok(())
}

fn list_shapefiles(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            if recursive {
                found.extend(list_shapefiles(&path, true)?);
            }
        } else if has_extension(&path, "shp") {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
}

fn vertex_count(value: &geojson::Value) -> usize {
    use geojson::Value;
    match value {
        Value::Polygon(rings) => rings.iter().map(Vec::len).sum(),
        Value::MultiPolygon(polygons) => polygons
            .iter()
            .flat_map(|rings| rings.iter().map(Vec::len))
            .sum(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use shapefile::dbase::{FieldName, TableWriterBuilder};
    use shapefile::Point;

    use super::*;

    /// Writes `test.shp` (+ `.shx`, `.dbf`) with one polygon per `(GEOID, ring)` pair.
    fn write_shapefile(dir: &Path, name: &str, tracts: &[(&str, Vec<(f64, f64)>)]) -> PathBuf {
        fs::create_dir_all(dir).unwrap();
        let path = dir.join(format!("{name}.shp"));
        let table = TableWriterBuilder::new()
            .add_character_field(FieldName::try_from(GEOID_PROPERTY).unwrap(), 20);
        {
            let mut writer = shapefile::Writer::from_path(&path, table).unwrap();
            for (geoid, ring) in tracts {
                let points: Vec<Point> = ring.iter().map(|&(x, y)| Point::new(x, y)).collect();
                let polygon = shapefile::Polygon::new(PolygonRing::Outer(points));
                let mut record = Record::default();
                record.insert(
                    GEOID_PROPERTY.to_string(),
                    FieldValue::Character(Some(geoid.to_string())),
                );
                writer.write_shape_and_record(&polygon, &record).unwrap();
            }
        }
        path
    }

    fn unit_square(offset: f64) -> Vec<(f64, f64)> {
        vec![
            (offset, offset),
            (offset, offset + 1.0),
            (offset + 1.0, offset + 1.0),
            (offset + 1.0, offset),
            (offset, offset),
        ]
    }

    fn read_collection(path: &Path) -> FeatureCollection {
        fs::read_to_string(path).unwrap().parse().unwrap()
    }

    fn geoids(collection: &FeatureCollection) -> Vec<String> {
        collection
            .features
            .iter()
            .map(|f| f.property(GEOID_PROPERTY).unwrap().as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn converts_shapefiles_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("shp");
        write_shapefile(&input, "b", &[("01003", unit_square(2.0))]);
        write_shapefile(&input, "a", &[("01001", unit_square(0.0)), ("1002", unit_square(1.0))]);
        let output = dir.path().join("nested/out/tracts.geojson");

        let summary = convert_to_geojson(&input, &output).unwrap();
        assert_eq!(summary.output, output);
        assert_eq!(summary.files, 2);
        assert_eq!(summary.tracts, 3);
        assert_eq!(summary.repaired, 0);

        let collection = read_collection(&output);
        assert_eq!(geoids(&collection), vec!["01001", "01002", "01003"]);
    }

    #[test]
    fn missing_or_empty_directory_signals_no_input() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.geojson");

        let empty = dir.path().join("empty");
        fs::create_dir_all(&empty).unwrap();
        assert!(matches!(
            convert_to_geojson(&empty, &output),
            Err(Error::NoInput(_))
        ));
        assert!(matches!(
            convert_to_geojson(Path::new("/nonexistent/dir"), &output),
            Err(Error::NoInput(_))
        ));
        assert!(!output.exists());
    }

    #[test]
    fn unreadable_shapefiles_signal_no_input() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.shp"), b"not a shapefile").unwrap();
        let output = dir.path().join("out.geojson");
        assert!(matches!(
            convert_to_geojson(dir.path(), &output),
            Err(Error::NoInput(_))
        ));
    }

    #[test]
    fn repairs_self_intersecting_polygons() {
        let dir = tempfile::tempdir().unwrap();
        let bowtie = vec![(0.0, 0.0), (1.0, 1.0), (1.0, 0.0), (0.0, 1.0), (0.0, 0.0)];
        write_shapefile(dir.path(), "bowtie", &[("01001", bowtie)]);
        let output = dir.path().join("out.geojson");

        let summary = convert_to_geojson(dir.path(), &output).unwrap();
        assert_eq!(summary.repaired, 1);
        let collection = read_collection(&output);
        assert_eq!(collection.features.len(), 1);

        let value = collection.features[0].geometry.clone().unwrap().value;
        match geo::Geometry::<f64>::try_from(value).unwrap() {
            geo::Geometry::MultiPolygon(repaired) => {
                assert!(repaired.is_valid());
                assert_eq!(repaired.0.len(), 2);
            }
            other => panic!("expected a multipolygon, got {other:?}"),
        }
    }

    #[test]
    fn drops_duplicate_identifiers() {
        let dir = tempfile::tempdir().unwrap();
        write_shapefile(dir.path(), "a", &[("01001", unit_square(0.0))]);
        write_shapefile(dir.path(), "b", &[("01001", unit_square(5.0))]);
        let output = dir.path().join("out.geojson");

        let summary = convert_to_geojson(dir.path(), &output).unwrap();
        assert_eq!(summary.tracts, 1);
        assert_eq!(summary.skipped, 1);
    }

    fn zip_shapefile(shp: &Path, zip_path: &Path) {
        let mut zip = zip::ZipWriter::new(fs::File::create(zip_path).unwrap());
        for ext in ["shp", "shx", "dbf"] {
            let part = shp.with_extension(ext);
            let name = part.file_name().unwrap().to_str().unwrap();
            zip.start_file(name, zip::write::FileOptions::default()).unwrap();
            zip.write_all(&fs::read(&part).unwrap()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn extracts_zipped_shapefiles() {
        let dir = tempfile::tempdir().unwrap();
        let shp = write_shapefile(&dir.path().join("shp"), "tract", &[("01001", unit_square(0.0))]);
        let zips = dir.path().join("zips");
        fs::create_dir_all(&zips).unwrap();
        zip_shapefile(&shp, &zips.join("01_tract.zip"));

        let extract = dir.path().join("extract");
        let extracted = extract_shapefiles(&zips, &extract).unwrap();
        assert_eq!(extracted.len(), 1);
        assert!(extracted[0].ends_with("01_tract/tract.shp"));

        let output = dir.path().join("out.geojson");
        let summary = convert_to_geojson(&zips, &output).unwrap();
        assert_eq!(summary.tracts, 1);
    }

    #[test]
    fn corrupt_archives_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad_tract.zip"), b"not a zip archive").unwrap();
        let output = dir.path().join("out.geojson");
        assert!(matches!(
            convert_to_geojson(dir.path(), &output),
            Err(Error::NoInput(_))
        ));

        // A readable shapefile next to the corrupt archive is still ingested
        write_shapefile(dir.path(), "tract", &[("01001", unit_square(0.0))]);
        let summary = convert_to_geojson(dir.path(), &output).unwrap();
        assert_eq!(summary.tracts, 1);
        assert!(extract_shapefiles(dir.path(), &dir.path().join("extract"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn simplify_keeps_structure_and_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.geojson");
        // Squares with a redundant midpoint on every edge
        let dense = serde_json::json!({"type": "FeatureCollection", "features": [
            {"type": "Feature", "properties": {"GEOID": "01001"}, "geometry": {"type": "Polygon", "coordinates":
                [[[0.0, 0.0], [0.0, 0.5], [0.0, 1.0], [0.5, 1.0], [1.0, 1.0], [1.0, 0.5], [1.0, 0.0], [0.5, 0.0], [0.0, 0.0]]]}},
            {"type": "Feature", "properties": {"GEOID": "01002"}, "geometry": {"type": "Polygon", "coordinates":
                [[[2.0, 2.0], [2.0, 2.5], [2.0, 3.0], [2.5, 3.0], [3.0, 3.0], [3.0, 2.5], [3.0, 2.0], [2.5, 2.0], [2.0, 2.0]]]}}
        ]})
        .to_string();
        fs::write(&input, dense).unwrap();
        let output = dir.path().join("out/simplified.json");

        let result = simplify_geojson(&input, &output, 1e-7).unwrap();
        assert_eq!(result, output);

        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(value["type"], "FeatureCollection");
        assert_eq!(value["features"].as_array().unwrap().len(), 2);
        assert_eq!(value["features"][0]["properties"]["GEOID"], "01001");
        assert!(fs::metadata(&output).unwrap().len() < fs::metadata(&input).unwrap().len());
    }

    #[test]
    fn simplify_rejects_malformed_input() {
        let dir = tempfile::tempdir().unwrap();
        let invalid = dir.path().join("invalid.geojson");
        fs::write(&invalid, "invalid json").unwrap();
        let output = dir.path().join("out.json");

        assert!(simplify_geojson(&invalid, &output, 1e-7).is_err());
        assert!(simplify_geojson(&dir.path().join("missing.json"), &output, 1e-7).is_err());
        assert!(!output.exists());
    }
}
