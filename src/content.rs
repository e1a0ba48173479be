//! File content model
//!
//! Raw uploads are decoded once, by file type, into [`FileContent`]. Text
//! files must be UTF-8. Tabular files are either spreadsheets (xlsx, xlsm,
//! xls, recognized by their container signature; the first worksheet is
//! read) or comma-delimited UTF-8, both with a header row. Everything else
//! is carried as opaque bytes.
//!
//! Tabular content is always rendered back as comma-delimited text, so an
//! anonymized spreadsheet downloads as CSV.

use crate::error::{AnonymizeError, Result};
use crate::types::FileType;
use calamine::Reader;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Local file header of a zip container (xlsx, xlsm)
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
/// Compound document header (legacy xls)
const OLE_MAGIC: &[u8] = &[0xd0, 0xcf, 0x11, 0xe0, 0xa1, 0xb1, 0x1a, 0xe1];

/// Decoded file content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum FileContent {
    Text { text: String },
    Tabular { table: Table },
    Binary { data: Vec<u8> },
}

impl FileContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Decode raw upload bytes according to the file type
    pub fn decode(file_type: FileType, bytes: &[u8]) -> Result<Self> {
        match file_type {
            FileType::Text => {
                let text = std::str::from_utf8(bytes).map_err(|e| {
                    AnonymizeError::MalformedInput(format!("Text file is not valid UTF-8: {}", e))
                })?;
                Ok(Self::text(text))
            }
            FileType::Tabular if bytes.starts_with(ZIP_MAGIC) || bytes.starts_with(OLE_MAGIC) => {
                Ok(Self::Tabular {
                    table: Table::parse_workbook(bytes)?,
                })
            }
            FileType::Tabular => {
                let text = std::str::from_utf8(bytes).map_err(|e| {
                    AnonymizeError::MalformedInput(format!(
                        "Tabular file is not valid UTF-8: {}",
                        e
                    ))
                })?;
                Ok(Self::Tabular {
                    table: Table::parse_delimited(text)?,
                })
            }
            FileType::Image | FileType::Document | FileType::Unknown => Ok(Self::Binary {
                data: bytes.to_vec(),
            }),
        }
    }

    /// Encode for download; tabular content is rendered as CSV
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Self::Text { text } => Ok(text.as_bytes().to_vec()),
            Self::Tabular { table } => Ok(table.to_delimited()?.into_bytes()),
            Self::Binary { data } => Ok(data.clone()),
        }
    }
}

/// Tabular content with a header row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Build a table, rejecting rows whose width differs from the header
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self> {
        if let Some((idx, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != headers.len())
        {
            return Err(AnonymizeError::MalformedInput(format!(
                "Row {} has {} cells, header has {}",
                idx + 1,
                row.len(),
                headers.len()
            )));
        }
        Ok(Self { headers, rows })
    }

    /// Index of the column with the given header
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Parse comma-delimited text with a header row. Blank lines are
    /// skipped; every other row must be as wide as the header.
    pub fn parse_delimited(input: &str) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(input.as_bytes());

        let headers: Vec<String> = reader
            .headers()
            .map_err(malformed_csv)?
            .iter()
            .map(str::to_string)
            .collect();
        if headers.is_empty() {
            return Err(AnonymizeError::MalformedInput(
                "Tabular file has no header row".to_string(),
            ));
        }

        let rows = reader
            .records()
            .map(|record| {
                record
                    .map(|r| r.iter().map(str::to_string).collect())
                    .map_err(malformed_csv)
            })
            .collect::<Result<Vec<Vec<String>>>>()?;
        Self::new(headers, rows)
    }

    /// Read the first worksheet of an xlsx, xlsm or xls workbook. The first
    /// non-empty row is the header; empty rows are skipped.
    pub fn parse_workbook(bytes: &[u8]) -> Result<Self> {
        let mut workbook = calamine::open_workbook_auto_from_rs(Cursor::new(bytes))
            .map_err(|e| AnonymizeError::MalformedInput(format!("Unreadable spreadsheet: {}", e)))?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| {
                AnonymizeError::MalformedInput("Spreadsheet has no worksheet".to_string())
            })?
            .map_err(|e| AnonymizeError::MalformedInput(format!("Unreadable worksheet: {}", e)))?;

        let mut rows = range
            .rows()
            .map(|row| row.iter().map(ToString::to_string).collect::<Vec<String>>())
            .filter(|row| row.iter().any(|cell| !cell.is_empty()));
        let headers = rows.next().ok_or_else(|| {
            AnonymizeError::MalformedInput("Spreadsheet has no header row".to_string())
        })?;
        Self::new(headers, rows.collect())
    }

    /// Render as comma-delimited text with `\n` line endings
    pub fn to_delimited(&self) -> Result<String> {
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        for record in std::iter::once(&self.headers).chain(self.rows.iter()) {
            writer
                .write_record(record)
                .map_err(|e| AnonymizeError::Internal(format!("CSV rendering failed: {}", e)))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| AnonymizeError::Internal(format!("CSV rendering failed: {}", e)))?;
        String::from_utf8(bytes)
            .map_err(|e| AnonymizeError::Internal(format!("CSV rendering failed: {}", e)))
    }
}

fn malformed_csv(e: csv::Error) -> AnonymizeError {
    AnonymizeError::MalformedInput(format!("Invalid delimited file: {}", e))
}
