//! Turns uploaded bytes into candidate credential records.

use std::io::Cursor;
use std::str::FromStr;

use calamine::{Data, Reader, open_workbook_auto_from_rs};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ImportError;
use super::parser::is_email;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Candidate CSV delimiters, in tie-break order.
const CSV_DELIMITERS: [u8; 5] = [b',', b';', b'\t', b'|', b':'];

/// Declared format of an uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatHint {
    /// Sniff the content.
    #[default]
    Auto,
    /// Delimited columns.
    Csv,
    /// One credential per line.
    Txt,
    /// XLSX/XLS/ODS workbook.
    Excel,
}

impl FromStr for FormatHint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "csv" => Ok(Self::Csv),
            "txt" | "text" => Ok(Self::Txt),
            "excel" | "xlsx" | "xls" => Ok(Self::Excel),
            other => Err(format!("unknown format '{other}' (expected auto, csv, txt or excel)")),
        }
    }
}

impl FormatHint {
    /// Replaces `Auto` with what the bytes look like.
    #[must_use]
    pub fn sniff(self, bytes: &[u8]) -> Self {
        match self {
            Self::Auto if bytes.starts_with(ZIP_MAGIC) || bytes.starts_with(OLE_MAGIC) => Self::Excel,
            Self::Auto => Self::Txt,
            other => other,
        }
    }
}

/// Cells picked out of a row by a recognised header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnFields {
    /// Username cell.
    pub username: String,
    /// Secret cell.
    pub secret: String,
    /// Optional host cell.
    pub host: Option<String>,
    /// Optional port cell, unparsed.
    pub port: Option<String>,
    /// Optional sender display name.
    pub from_name: Option<String>,
}

/// One non-blank input record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// 1-based line or row number in the file.
    pub line_no: usize,
    /// Text shown in reports.
    pub raw: String,
    /// Set when the row was already split into columns.
    pub fields: Option<ColumnFields>,
}

/// Splits `bytes` into records according to `hint`.
///
/// `delimiter` overrides CSV delimiter detection; other formats ignore it.
///
/// # Errors
///
/// Returns [`ImportError::Unreadable`] for undecodable text or a corrupt
/// workbook, and [`ImportError::EmptyWorkbook`] for a workbook with no sheet.
pub fn read_records(bytes: &[u8], hint: FormatHint, delimiter: Option<u8>) -> Result<Vec<Record>, ImportError> {
    match hint.sniff(bytes) {
        FormatHint::Excel => excel_records(bytes),
        FormatHint::Csv => {
            let text = decode(bytes)?;
            let delimiter = delimiter.unwrap_or_else(|| detect_delimiter(&text));
            csv_records(&text, delimiter)
        }
        FormatHint::Txt | FormatHint::Auto => Ok(text_records(&decode(bytes)?)),
    }
}

fn decode(bytes: &[u8]) -> Result<String, ImportError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    String::from_utf8(bytes.to_vec())
        .map_err(|e| ImportError::Unreadable(format!("file is not valid UTF-8: {e}")))
}

fn text_records(text: &str) -> Vec<Record> {
    text.lines()
        .enumerate()
        .filter_map(|(i, line)| {
            let line = line.trim();
            (!line.is_empty()).then(|| Record {
                line_no: i + 1,
                raw: line.to_string(),
                fields: None,
            })
        })
        .collect()
}

/// Picks the delimiter that occurs most often in the first non-blank line.
///
/// A line starting with an `smtp://` or `smtps://` URL never splits on `:`,
/// which the URL itself contains.
#[must_use]
pub fn detect_delimiter(text: &str) -> u8 {
    let first = text.lines().find(|l| !l.trim().is_empty()).unwrap_or_default();
    let url_first = starts_with_smtp_url(first);
    let mut best = (CSV_DELIMITERS[0], 0);
    for candidate in CSV_DELIMITERS {
        if url_first && candidate == b':' {
            continue;
        }
        let count = first.bytes().filter(|b| *b == candidate).count();
        if count > best.1 {
            best = (candidate, count);
        }
    }
    best.0
}

fn starts_with_smtp_url(line: &str) -> bool {
    let line = line.trim_start().as_bytes();
    [&b"smtp://"[..], b"smtps://"]
        .iter()
        .any(|scheme| line.len() >= scheme.len() && line[..scheme.len()].eq_ignore_ascii_case(scheme))
}

fn csv_records(text: &str, delimiter: u8) -> Result<Vec<Record>, ImportError> {
    debug!(delimiter = %char::from(delimiter).escape_default(), "Reading CSV");

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|e| ImportError::Unreadable(format!("malformed CSV: {e}")))?;
        let line_no = record
            .position()
            .and_then(|p| usize::try_from(p.line()).ok())
            .unwrap_or(rows.len() + 1);
        rows.push((line_no, record.iter().map(str::to_string).collect()));
    }
    Ok(rows_to_records(rows, char::from(delimiter)))
}

fn excel_records(bytes: &[u8]) -> Result<Vec<Record>, ImportError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|e| ImportError::Unreadable(format!("corrupt workbook: {e}")))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or(ImportError::EmptyWorkbook)?
        .map_err(|e| ImportError::Unreadable(format!("unreadable sheet: {e}")))?;

    let first_row = range
        .start()
        .and_then(|(row, _)| usize::try_from(row).ok())
        .unwrap_or(0);
    let rows = range
        .rows()
        .enumerate()
        .map(|(i, row)| (first_row + i + 1, row.iter().map(cell_text).collect()))
        .collect();
    Ok(rows_to_records(rows, '\t'))
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{f:.0}"),
        other => other.to_string().trim().to_string(),
    }
}

struct Header {
    username: usize,
    secret: usize,
    host: Option<usize>,
    port: Option<usize>,
    from_name: Option<usize>,
}

impl Header {
    fn detect(cells: &[String]) -> Option<Self> {
        let find = |names: &[&str]| {
            cells.iter().position(|cell| {
                let cell = cell.trim().to_ascii_lowercase().replace([' ', '-'], "_");
                names.contains(&cell.as_str())
            })
        };
        Some(Self {
            username: find(&["email", "username", "user", "login"])?,
            secret: find(&["password", "pass", "secret", "api_key", "apikey"])?,
            host: find(&["host", "smtp_host", "server"]),
            port: find(&["port", "smtp_port"]),
            from_name: find(&["from_name", "fromname", "name", "sender"]),
        })
    }

    fn fields(&self, cells: &[String]) -> ColumnFields {
        let cell = |i: usize| cells.get(i).map(|c| c.trim().to_string()).unwrap_or_default();
        let optional = |i: Option<usize>| i.map(cell).filter(|c| !c.is_empty());
        ColumnFields {
            username: cell(self.username),
            secret: cell(self.secret),
            host: optional(self.host),
            port: optional(self.port),
            from_name: optional(self.from_name),
        }
    }
}

fn rows_to_records(rows: Vec<(usize, Vec<String>)>, separator: char) -> Vec<Record> {
    let mut rows = rows
        .into_iter()
        .filter(|(_, cells)| cells.iter().any(|c| !c.trim().is_empty()))
        .peekable();

    let header = rows.peek().and_then(|(_, cells)| Header::detect(cells));
    if header.is_some() {
        rows.next();
    }

    rows.map(|(line_no, cells)| {
        let fields = match &header {
            Some(header) => Some(header.fields(&cells)),
            None => positional_fields(&cells),
        };
        let raw = if fields.is_some() {
            cells
                .iter()
                .map(|c| c.trim())
                .filter(|c| !c.is_empty())
                .collect::<Vec<_>>()
                .join(&separator.to_string())
        } else {
            first_cell(&cells)
        };
        Record { line_no, raw, fields }
    })
    .collect()
}

/// A lone email cell takes the next non-empty cell as its secret.
fn positional_fields(cells: &[String]) -> Option<ColumnFields> {
    let mut non_empty = cells.iter().map(|c| c.trim()).filter(|c| !c.is_empty());
    let first = non_empty.next()?;
    if !is_email(first) {
        return None;
    }
    non_empty.next().map(|secret| ColumnFields {
        username: first.to_string(),
        secret: secret.to_string(),
        ..ColumnFields::default()
    })
}

fn first_cell(cells: &[String]) -> String {
    cells
        .iter()
        .map(|c| c.trim())
        .find(|c| !c.is_empty())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_workbooks_by_magic() {
        assert_eq!(FormatHint::Auto.sniff(b"PK\x03\x04rest"), FormatHint::Excel);
        assert_eq!(FormatHint::Auto.sniff(b"a@b.io:pw"), FormatHint::Txt);
        assert_eq!(FormatHint::Csv.sniff(b"PK\x03\x04"), FormatHint::Csv);
    }

    #[test]
    fn parses_hint_names() {
        assert_eq!("Excel".parse::<FormatHint>(), Ok(FormatHint::Excel));
        assert!("pdf".parse::<FormatHint>().is_err());
    }

    #[test]
    fn text_skips_blank_lines_and_bom() {
        let records = read_records(b"\xEF\xBB\xBFa@b.io:pw\n\n   \n c@d.io|x \n", FormatHint::Txt, None).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].raw, "a@b.io:pw");
        assert_eq!(records[1].line_no, 4);
        assert_eq!(records[1].raw, "c@d.io|x");
    }

    #[test]
    fn invalid_utf8_is_unreadable() {
        let err = read_records(&[0x61, 0xFF, 0xFE], FormatHint::Txt, None).unwrap_err();
        assert!(matches!(err, ImportError::Unreadable(_)));
    }

    #[test]
    fn detects_most_frequent_delimiter() {
        assert_eq!(detect_delimiter("a;b;c\nx,y"), b';');
        assert_eq!(detect_delimiter("\n\na\tb"), b'\t');
        assert_eq!(detect_delimiter("plain"), b',');
        assert_eq!(detect_delimiter("SMTPS://a%40b.io:pw@mx.b.io:465;x"), b';');
        assert_eq!(detect_delimiter("a@b.io:pw"), b':');
    }

    #[test]
    fn url_rows_stay_whole() {
        let csv = "smtp://a%40b.io:pw@mx.b.io:2525\nsmtps://c%40d.io:pw@mx.d.io,notes\n";
        let records = read_records(csv.as_bytes(), FormatHint::Csv, None).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].raw, "smtp://a%40b.io:pw@mx.b.io:2525");
        assert_eq!(records[1].raw, "smtps://c%40d.io:pw@mx.d.io");
    }

    #[test]
    fn declared_delimiter_beats_detection() {
        // Detection would pick ',' from the first line's secret.
        let csv = "alice@corp.io;p,a,s,s\nbob@corp.io;hunter2\n";
        assert_eq!(detect_delimiter(csv), b',');

        let records = read_records(csv.as_bytes(), FormatHint::Csv, Some(b';')).unwrap();
        assert_eq!(records.len(), 2);
        let first = records[0].fields.clone().unwrap();
        assert_eq!(first.username, "alice@corp.io");
        assert_eq!(first.secret, "p,a,s,s");
        assert_eq!(records[1].fields.clone().unwrap().secret, "hunter2");
    }

    #[test]
    fn txt_ignores_declared_delimiter() {
        let records = read_records(b"a@b.io:pw\n", FormatHint::Txt, Some(b';')).unwrap();
        assert_eq!(records[0].raw, "a@b.io:pw");
    }

    #[test]
    fn csv_header_selects_columns() {
        let csv = "name,email,password,host,port\nAlice,alice@corp.io,p:w,mail.corp.io,2525\n,,,,\n";
        let records = read_records(csv.as_bytes(), FormatHint::Csv, None).unwrap();
        assert_eq!(records.len(), 1);
        let fields = records[0].fields.clone().unwrap();
        assert_eq!(fields.username, "alice@corp.io");
        assert_eq!(fields.secret, "p:w");
        assert_eq!(fields.host.as_deref(), Some("mail.corp.io"));
        assert_eq!(fields.port.as_deref(), Some("2525"));
        assert_eq!(fields.from_name.as_deref(), Some("Alice"));
        assert_eq!(records[0].line_no, 2);
    }

    #[test]
    fn csv_without_header_uses_first_cell() {
        let csv = "alice@gmail.com:Secret123,notes\nnot-an-email,whatever\n";
        let records = read_records(csv.as_bytes(), FormatHint::Csv, None).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].raw, "alice@gmail.com:Secret123");
        assert!(records[0].fields.is_none());
        assert_eq!(records[1].raw, "not-an-email");
    }

    #[test]
    fn lone_email_cell_takes_next_cell() {
        let records = read_records(b"alice@gmail.com;;Secret123\n", FormatHint::Csv, None).unwrap();
        let fields = records[0].fields.clone().unwrap();
        assert_eq!(fields.username, "alice@gmail.com");
        assert_eq!(fields.secret, "Secret123");
    }

    #[test]
    fn corrupt_workbook_is_unreadable() {
        let err = read_records(b"PK\x03\x04garbage", FormatHint::Auto, None).unwrap_err();
        assert!(matches!(err, ImportError::Unreadable(_)));
    }
}
