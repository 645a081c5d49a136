//! File formats and the codecs that turn stored bytes into tables and back.

use crate::error::{DatasetError, DatasetResult};
use crate::table::{Table, Value};
use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use rust_xlsxwriter::Workbook;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

/// ZIP local file header; every XLSX file starts with it
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Excel worksheet limits
const XLSX_MAX_ROWS: usize = 1_048_576;
const XLSX_MAX_COLUMNS: usize = 16_384;

/// Supported dataset formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Csv,
    Xlsx,
}

impl FileFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Xlsx => "xlsx",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            FileFormat::Csv => "text/csv",
            FileFormat::Xlsx => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        }
    }

    /// Format named by a file's extension, if any
    pub fn from_file_name(name: &str) -> Option<Self> {
        let (_, ext) = name.rsplit_once('.')?;
        ext.parse().ok()
    }

    /// Detect the format of an upload from its name and confirm the content
    /// agrees with it
    pub fn detect(name: &str, bytes: &[u8]) -> DatasetResult<Self> {
        let format = Self::from_file_name(name).ok_or_else(|| {
            DatasetError::UnsupportedFormat(format!(
                "'{name}' is not a CSV or XLSX file"
            ))
        })?;

        match format {
            FileFormat::Xlsx if !bytes.starts_with(ZIP_MAGIC) => Err(
                DatasetError::UnsupportedFormat(format!("'{name}' is not a valid XLSX workbook")),
            ),
            FileFormat::Csv if std::str::from_utf8(bytes).is_err() => Err(
                DatasetError::UnsupportedFormat(format!("'{name}' is not UTF-8 encoded CSV")),
            ),
            _ => Ok(format),
        }
    }

    /// Codec that reads and writes this format
    pub fn codec(&self) -> &'static dyn TabularCodec {
        static CSV: CsvCodec = CsvCodec;
        static XLSX: XlsxCodec = XlsxCodec;

        match self {
            FileFormat::Csv => &CSV,
            FileFormat::Xlsx => &XLSX,
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileFormat {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(FileFormat::Csv),
            "xlsx" => Ok(FileFormat::Xlsx),
            other => Err(DatasetError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Converts between stored bytes and [`Table`]s
pub trait TabularCodec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> DatasetResult<Table>;

    fn encode(&self, table: &Table) -> DatasetResult<Vec<u8>>;
}

/// Comma separated values with a header record
pub struct CsvCodec;

impl TabularCodec for CsvCodec {
    fn decode(&self, bytes: &[u8]) -> DatasetResult<Table> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(bytes);

        let header: Vec<String> = reader
            .headers()
            .map_err(|e| DatasetError::MalformedFile(format!("invalid CSV header: {e}")))?
            .iter()
            .enumerate()
            .map(|(i, name)| header_name(i, name))
            .collect();

        let mut rows: Vec<Vec<Value>> = Vec::new();
        for record in reader.records() {
            let record =
                record.map_err(|e| DatasetError::MalformedFile(format!("invalid CSV record: {e}")))?;
            rows.push(record.iter().map(Value::parse).collect());
        }

        Table::from_rows(header, rows)
    }

    fn encode(&self, table: &Table) -> DatasetResult<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());

        writer
            .write_record(table.column_names())
            .map_err(|e| DatasetError::Internal(format!("failed to write CSV header: {e}")))?;

        for index in 0..table.num_rows() {
            writer
                .write_record(table.row(index).into_iter().map(|v| v.to_string()))
                .map_err(|e| DatasetError::Internal(format!("failed to write CSV row: {e}")))?;
        }

        writer
            .into_inner()
            .map_err(|e| DatasetError::Internal(format!("failed to flush CSV output: {e}")))
    }
}

/// Excel workbooks; reads the first worksheet and writes a single one
pub struct XlsxCodec;

impl TabularCodec for XlsxCodec {
    fn decode(&self, bytes: &[u8]) -> DatasetResult<Table> {
        let mut workbook: Xlsx<Cursor<Vec<u8>>> = open_workbook_from_rs(Cursor::new(bytes.to_vec()))
            .map_err(|e| DatasetError::MalformedFile(format!("invalid XLSX workbook: {e}")))?;

        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| DatasetError::MalformedFile("workbook has no worksheets".to_string()))?
            .map_err(|e| DatasetError::MalformedFile(format!("unreadable worksheet: {e}")))?;

        let mut rows = range.rows();
        let Some(header_row) = rows.next() else {
            return Ok(Table::default());
        };

        let header: Vec<String> = header_row
            .iter()
            .enumerate()
            .map(|(i, cell)| match cell {
                Data::Empty => header_name(i, ""),
                other => header_name(i, &other.to_string()),
            })
            .collect();
        let width = header.len();

        let rows = rows
            .filter(|row| row.iter().any(|cell| !matches!(cell, Data::Empty)))
            .map(|row| {
                let mut values: Vec<Value> = row.iter().take(width).map(cell_value).collect();
                values.resize(width, Value::Null);
                values
            })
            .collect();

        Table::from_rows(header, rows)
    }

    fn encode(&self, table: &Table) -> DatasetResult<Vec<u8>> {
        if table.num_rows() + 1 > XLSX_MAX_ROWS || table.num_columns() > XLSX_MAX_COLUMNS {
            return Err(DatasetError::InvalidRequest(format!(
                "{} rows x {} columns exceeds worksheet limits",
                table.num_rows(),
                table.num_columns()
            )));
        }

        let xlsx_err = |e: rust_xlsxwriter::XlsxError| {
            DatasetError::Internal(format!("failed to write XLSX: {e}"))
        };

        let mut workbook = Workbook::new();
        {
            let worksheet = workbook.add_worksheet();
            worksheet.set_name("data").map_err(xlsx_err)?;

            for (col, column) in table.columns().iter().enumerate() {
                // Bounds checked above
                let col = col as u16;
                worksheet
                    .write_string(0, col, column.name())
                    .map_err(xlsx_err)?;

                for (row, value) in column.values().iter().enumerate() {
                    let row = row as u32 + 1;
                    match value {
                        Value::Null => {}
                        Value::Int(i) => {
                            worksheet.write_number(row, col, *i as f64).map_err(xlsx_err)?;
                        }
                        Value::Float(f) => {
                            worksheet.write_number(row, col, *f).map_err(xlsx_err)?;
                        }
                        Value::Bool(b) => {
                            worksheet.write_boolean(row, col, *b).map_err(xlsx_err)?;
                        }
                        Value::Text(s) => {
                            worksheet.write_string(row, col, s).map_err(xlsx_err)?;
                        }
                    }
                }
            }
        }

        workbook.save_to_buffer().map_err(xlsx_err)
    }
}

/// Column name for header cell `index`; blank headers get a positional name
fn header_name(index: usize, raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        format!("unnamed_{index}")
    } else {
        trimmed.to_string()
    }
}

fn cell_value(cell: &Data) -> Value {
    match cell {
        Data::Empty | Data::Error(_) => Value::Null,
        Data::Int(i) => Value::Int(*i),
        // Excel stores every number as a float
        Data::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Value::Int(*f as i64),
        Data::Float(f) => Value::Float(*f),
        Data::Bool(b) => Value::Bool(*b),
        Data::String(s) if s.trim().is_empty() => Value::Null,
        Data::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}
