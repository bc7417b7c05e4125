//! Cleaning of raw ACS table exports.

use std::fmt;
use std::fs::{self, File};
use std::path::Path;

use census::{coerce_estimate, GeoIdError, Geoid, PopulationRecord};
use polars::prelude::*;
use tracing::{debug, info};

use crate::config::ColumnMapping;
use crate::error::{Error, Result};

/// Identifier column of every cleaned CSV.
pub const GEOID_COLUMN: &str = "GEOID";

/// Percentiles reported by [`PopulationStats`].
pub const REPORTED_PERCENTILES: [u8; 12] = [0, 10, 20, 30, 40, 50, 60, 70, 80, 90, 99, 100];

/// Column types and null counts of a written CSV, in column order.
#[derive(Clone, Debug, PartialEq)]
pub struct CsvSummary {
    pub rows: usize,
    pub dtypes: Vec<(String, DataType)>,
    pub null_counts: Vec<(String, usize)>,
}

impl CsvSummary {
    fn of(df: &DataFrame) -> Self {
        let columns = df.get_columns();
        Self {
            rows: df.height(),
            dtypes: columns
                .iter()
                .map(|s| (s.name().to_string(), s.dtype().clone()))
                .collect(),
            null_counts: columns
                .iter()
                .map(|s| (s.name().to_string(), s.null_count()))
                .collect(),
        }
    }
}

impl fmt::Display for CsvSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Data Types:")?;
        for (name, dtype) in &self.dtypes {
            writeln!(f, "{name:<20} {dtype}")?;
        }
        writeln!(f, "Missing Values:")?;
        for (name, nulls) in &self.null_counts {
            writeln!(f, "{name:<20} {nulls}")?;
        }
        Ok(())
    }
}

/// Drops the descriptive second row and keeps `columns_to_keep`, in that order, as text.
pub fn process_csv(input: &Path, output: &Path, columns_to_keep: &[&str]) -> Result<()> {
    let df = read_text_csv(input)?;
    require_columns(&df, input, columns_to_keep.iter().copied())?;

    let df = df.slice(1, df.height().saturating_sub(1));
    let mut selected = df.select(columns_to_keep.iter().copied())?;
    write_csv(output, &mut selected)?;
    info!(rows = selected.height(), output = %output.display(), "processed CSV");
    Ok(())
}

/// Turns a raw ACS export into `GEOID` plus one numeric column per mapping entry.
///
/// The descriptive row under the header is dropped when present, every `GEO_ID` must
/// carry the tract summary level, and unparseable estimates become `0.0`.
pub fn process_acs_csv(
    input: &Path,
    output: &Path,
    mapping: &[ColumnMapping],
    geo_id_column: &str,
    summary_level: &str,
) -> Result<CsvSummary> {
    let df = read_text_csv(input)?;
    require_columns(
        &df,
        input,
        std::iter::once(geo_id_column).chain(mapping.iter().map(|m| m.source.as_str())),
    )?;

    let raw_ids = text_column(&df, geo_id_column)?;
    let skip = usize::from(is_descriptive_row(raw_ids.first(), summary_level));
    if skip == 1 {
        debug!(path = %input.display(), "dropping descriptive header row");
    }

    let geoids = raw_ids
        .iter()
        .enumerate()
        .skip(skip)
        .map(|(row, raw)| {
            Geoid::from_geo_id(raw.as_deref().unwrap_or_default(), summary_level)
                .map_err(|source| Error::InvalidGeoId { row: row + 1, source })
        })
        .collect::<Result<Vec<_>>>()?;

    let raw_values = mapping
        .iter()
        .map(|m| text_column(&df, &m.source))
        .collect::<Result<Vec<_>>>()?;
    let records: Vec<PopulationRecord> = geoids
        .into_iter()
        .enumerate()
        .map(|(i, geoid)| {
            PopulationRecord::from_raw(
                geoid,
                raw_values.iter().map(|column| column[i + skip].as_deref()),
            )
        })
        .collect();

    let mut columns = vec![Series::new(
        GEOID_COLUMN,
        records
            .iter()
            .map(|r| r.geoid.as_str())
            .collect::<Vec<_>>(),
    )];
    for (j, m) in mapping.iter().enumerate() {
        columns.push(Series::new(
            &m.name,
            records.iter().map(|r| r.values[j]).collect::<Vec<f64>>(),
        ));
    }
    let mut cleaned = DataFrame::new(columns)?;
    write_csv(output, &mut cleaned)?;
    info!(rows = cleaned.height(), output = %output.display(), "wrote cleaned ACS CSV");
    Ok(CsvSummary::of(&cleaned))
}

/// Distribution summary of one numeric column.
#[derive(Clone, Debug, PartialEq)]
pub struct PopulationStats {
    pub min: f64,
    pub max: f64,
    pub percentiles: Vec<(u8, f64)>,
}

impl PopulationStats {
    /// `None` when there is nothing to summarise.
    pub fn from_values(values: &[f64]) -> Result<Option<Self>> {
        let series = Float64Chunked::from_slice("values", values);
        let (Some(min), Some(max)) = (series.min(), series.max()) else {
            return Ok(None);
        };
        let percentiles = REPORTED_PERCENTILES
            .iter()
            .map(|&p| Ok((p, quantile(&series, f64::from(p) / 100.0)?.unwrap_or(min))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(Self {
            min,
            max,
            percentiles,
        }))
    }
}

impl fmt::Display for PopulationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Summary Statistics:")?;
        writeln!(f, "min: {:?}", self.min)?;
        for (p, value) in &self.percentiles {
            writeln!(f, "{p}%ile: {value:?}")?;
        }
        write!(f, "max: {:?}", self.max)
    }
}

/// Reads `column` of a cleaned CSV and summarises it, coercing as on the way in.
pub fn population_stats(csv: &Path, column: &str) -> Result<Option<PopulationStats>> {
    let df = read_text_csv(csv)?;
    require_columns(&df, csv, [column])?;
    let values = numeric_column(&df, column)?;
    PopulationStats::from_values(&values)
}

/// Quantile `q` in `[0, 1]`, interpolating linearly between closest ranks.
pub fn percentile(values: &[f64], q: f64) -> Result<Option<f64>> {
    quantile(&Float64Chunked::from_slice("values", values), q)
}

fn quantile(series: &Float64Chunked, q: f64) -> Result<Option<f64>> {
    Ok(series.quantile(q.clamp(0.0, 1.0), QuantileInterpolOptions::Linear)?)
}

/// Reads a CSV without type inference so identifiers keep their leading zeros.
pub(crate) fn read_text_csv(path: &Path) -> Result<DataFrame> {
    Ok(CsvReader::from_path(path)?
        .has_header(true)
        .infer_schema(Some(0))
        .finish()?)
}

pub(crate) fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_names().contains(&name)
}

pub(crate) fn require_columns<'a>(
    df: &DataFrame,
    path: &Path,
    required: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let missing: Vec<String> = required
        .into_iter()
        .filter(|name| !has_column(df, name))
        .map(str::to_string)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::MissingColumns {
            path: path.to_path_buf(),
            columns: missing,
        })
    }
}

pub(crate) fn text_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>> {
    let series = df.column(name)?.cast(&DataType::Utf8)?;
    let values = series
        .utf8()?
        .into_iter()
        .map(|value| value.map(str::to_string))
        .collect();
    Ok(values)
}

pub(crate) fn numeric_column(df: &DataFrame, name: &str) -> Result<Vec<f64>> {
    Ok(text_column(df, name)?
        .iter()
        .map(|value| coerce_estimate(value.as_deref()))
        .collect())
}

fn write_csv(path: &Path, df: &mut DataFrame) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    CsvWriter::new(&mut file).finish(df)?;
    Ok(())
}

// ACS exports repeat the header as prose ("Geography", "Estimate!!Total...") on the
// first data line. A well-formed GEO_ID of the wrong level is data, not prose.
fn is_descriptive_row(first: Option<&Option<String>>, summary_level: &str) -> bool {
    match first {
        Some(Some(raw)) => matches!(
            Geoid::from_geo_id(raw, summary_level),
            Err(e) if !matches!(e, GeoIdError::SummaryLevel { .. })
        ),
        Some(None) => true,
        None => false,
    }
}
