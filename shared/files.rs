//! Tabular file I/O shared by the library and the command-line tool.
//!
//! Tables are read with the Polars CSV reader. The separator follows the
//! extension (`.csv` is comma-separated, everything else tab-separated) and
//! files ending in `.gz` are decompressed first.

use flate2::read::MultiGzDecoder;
use ndarray::ArrayView2;
use polars::prelude::*;
use std::fs::File;
use std::io::{self, BufWriter, Cursor, Read};
use std::path::Path;

/// Separator implied by a file name, ignoring a trailing `.gz`.
pub fn separator_for(path: &Path) -> u8 {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let name = name.strip_suffix(".gz").unwrap_or(&name);
    if name.ends_with(".csv") { b',' } else { b'\t' }
}

fn is_gzipped(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

/// Reads a delimited table with a header row.
pub fn read_table(path: &Path) -> PolarsResult<DataFrame> {
    let options = CsvReadOptions::default()
        .with_has_header(true)
        .with_parse_options(CsvParseOptions::default().with_separator(separator_for(path)));

    if is_gzipped(path) {
        let mut bytes = Vec::new();
        MultiGzDecoder::new(File::open(path)?).read_to_end(&mut bytes)?;
        CsvReader::new(Cursor::new(bytes)).with_options(options).finish()
    } else {
        CsvReader::new(File::open(path)?).with_options(options).finish()
    }
}

/// Writes a table as TSV with a header row.
pub fn write_table_tsv(path: &Path, table: &DataFrame) -> PolarsResult<()> {
    let mut file = BufWriter::new(File::create(path)?);
    let mut table = table.clone();
    CsvWriter::new(&mut file)
        .include_header(true)
        .with_separator(b'\t')
        .finish(&mut table)
}

/// Writes a matrix as TSV: a header of `corner` plus the column names, then
/// one line per row starting with its row name. Missing values are written
/// as `NaN`.
pub fn write_matrix_tsv(
    path: &Path,
    corner: &str,
    rows: &[String],
    columns: &[String],
    values: ArrayView2<f64>,
) -> io::Result<()> {
    if values.dim() != (rows.len(), columns.len()) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "matrix is {} x {} but {} row and {} column names were given",
                values.nrows(),
                values.ncols(),
                rows.len(),
                columns.len()
            ),
        ));
    }

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(BufWriter::new(File::create(path)?));
    writer.write_record(std::iter::once(corner).chain(columns.iter().map(String::as_str)))?;

    let mut buffer = ryu::Buffer::new();
    let mut record: Vec<String> = Vec::with_capacity(columns.len() + 1);
    for (name, row) in rows.iter().zip(values.rows()) {
        record.clear();
        record.push(name.clone());
        record.extend(row.iter().map(|&v| {
            if v.is_nan() {
                "NaN".to_string()
            } else {
                buffer.format(v).to_string()
            }
        }));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}
