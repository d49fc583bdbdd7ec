//! Multi-section SPC storm report CSV.
//!
//! A day's document carries three sections (tornado, wind, hail), each
//! opened by its own `Time,...` header line. Data rows are parsed against
//! the most recent header.

use std::collections::HashMap;

use csv::{ReaderBuilder, StringRecord, Trim, WriterBuilder};
use haily_core::{
    resolve_report_date, Magnitude, Measured, ReportKind, ReportTime, SourceToken, StormReportDraft,
};
use haily_storage::content_fingerprint;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ParseErrorKind {
    #[error("data row before any section header")]
    OrphanRow,
    #[error("expected {expected} columns, found {found}")]
    ColumnCount { expected: usize, found: usize },
    #[error("missing event time")]
    MissingTime,
    #[error("malformed event time: {0}")]
    MalformedTime(String),
    #[error("unreadable csv record: {0}")]
    Csv(String),
}

/// A row that could not become a report. Recorded and skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("line {line}: {kind}")]
pub struct ParseError {
    pub line: u64,
    pub kind: ParseErrorKind,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedDay {
    pub drafts: Vec<StormReportDraft>,
    pub errors: Vec<ParseError>,
}

impl ParsedDay {
    pub fn count_for(&self, kind: ReportKind) -> usize {
        self.drafts.iter().filter(|d| d.kind() == kind).count()
    }
}

struct Section {
    kind: ReportKind,
    columns: HashMap<String, usize>,
    width: usize,
}

impl Section {
    fn field<'r>(&self, record: &'r StringRecord, name: &str) -> &'r str {
        self.columns
            .get(name)
            .and_then(|idx| record.get(*idx))
            .unwrap_or("")
    }
}

/// Strips NUL bytes that occasionally appear in the published feed.
pub fn sanitize(content: &str) -> (String, usize) {
    let clean: String = content.chars().filter(|c| *c != '\0').collect();
    let removed = content.chars().count() - clean.chars().count();
    (clean, removed)
}

fn reader(content: &str) -> csv::Reader<&[u8]> {
    ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(content.as_bytes())
}

fn section_for_header(record: &StringRecord) -> Option<Section> {
    if record.get(0) != Some("Time") {
        return None;
    }
    let has = |name: &str| record.iter().any(|f| f == name);
    let kind = if has("F_Scale") {
        ReportKind::Tornado
    } else if has("Speed") {
        ReportKind::Wind
    } else if has("Size") {
        ReportKind::Hail
    } else {
        return None;
    };
    let columns = record
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.to_string(), idx))
        .collect();
    Some(Section {
        kind,
        columns,
        width: record.len(),
    })
}

fn is_blank(record: &StringRecord) -> bool {
    record.iter().all(str::is_empty)
}

/// Canonical CSV text of a trimmed record; the fingerprint input.
fn normalize_record(record: &StringRecord) -> String {
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    let text = writer
        .write_record(record)
        .ok()
        .and_then(|_| writer.into_inner().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
    match text {
        Some(text) => text.trim_end_matches(['\r', '\n']).to_string(),
        None => record.iter().collect::<Vec<_>>().join(","),
    }
}

fn parse_measured(raw: &str) -> Measured<u32> {
    match raw {
        "" => Measured::Absent,
        "UNK" => Measured::Unknown,
        other => other
            .parse::<u32>()
            .map(Measured::Known)
            .unwrap_or(Measured::Absent),
    }
}

fn parse_coordinate(raw: &str) -> Option<f64> {
    if raw.is_empty() {
        return None;
    }
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn magnitude_for(section: &Section, record: &StringRecord) -> Magnitude {
    match section.kind {
        ReportKind::Tornado => {
            let f_scale = section.field(record, "F_Scale");
            Magnitude::Tornado {
                f_scale: (!f_scale.is_empty()).then(|| f_scale.to_string()),
            }
        }
        ReportKind::Wind => Magnitude::Wind {
            speed_mph: parse_measured(section.field(record, "Speed")),
        },
        ReportKind::Hail => Magnitude::Hail {
            size_hundredths: parse_measured(section.field(record, "Size")),
        },
    }
}

fn parse_row(
    token: SourceToken,
    section: &Section,
    record: &StringRecord,
) -> Result<StormReportDraft, ParseErrorKind> {
    if record.len() != section.width {
        return Err(ParseErrorKind::ColumnCount {
            expected: section.width,
            found: record.len(),
        });
    }

    let raw_time = section.field(record, "Time");
    if raw_time.is_empty() {
        return Err(ParseErrorKind::MissingTime);
    }
    let report_date = resolve_report_date(token, raw_time)
        .map_err(|err| ParseErrorKind::MalformedTime(err.to_string()))?;
    let time_utc =
        ReportTime::parse(raw_time).map_err(|err| ParseErrorKind::MalformedTime(err.to_string()))?;

    let source_row = normalize_record(record);
    Ok(StormReportDraft {
        source_token: token,
        report_date,
        time_utc,
        magnitude: magnitude_for(section, record),
        location: section.field(record, "Location").to_string(),
        county: section.field(record, "County").to_string(),
        state: section.field(record, "State").to_string(),
        latitude: parse_coordinate(section.field(record, "Lat")),
        longitude: parse_coordinate(section.field(record, "Lon")),
        narrative: section.field(record, "Comments").to_string(),
        content_fingerprint: content_fingerprint(section.kind, &source_row),
        source_row,
    })
}

/// Parses every row of `token`'s document. One bad row never aborts the batch.
pub fn parse_spc_csv(token: SourceToken, content: &str) -> ParsedDay {
    let mut parsed = ParsedDay::default();
    let mut section: Option<Section> = None;
    let mut rdr = reader(content);

    for result in rdr.records() {
        let record = match result {
            Ok(record) => record,
            Err(err) => {
                let line = err.position().map(|p| p.line()).unwrap_or(0);
                parsed.errors.push(ParseError {
                    line,
                    kind: ParseErrorKind::Csv(err.to_string()),
                });
                continue;
            }
        };
        if is_blank(&record) {
            continue;
        }
        let line = record.position().map(|p| p.line()).unwrap_or(0);

        if let Some(next) = section_for_header(&record) {
            section = Some(next);
            continue;
        }

        let Some(current) = section.as_ref() else {
            parsed.errors.push(ParseError {
                line,
                kind: ParseErrorKind::OrphanRow,
            });
            continue;
        };

        match parse_row(token, current, &record) {
            Ok(draft) => parsed.drafts.push(draft),
            Err(kind) => parsed.errors.push(ParseError { line, kind }),
        }
    }

    parsed
}

/// Number of data rows the source publishes, across all sections.
///
/// A data row has at least six columns and a four-digit time in its first
/// column; header lines are excluded.
pub fn count_reports_in_csv(content: &str) -> u64 {
    let mut rdr = reader(content);
    rdr.records()
        .filter_map(Result::ok)
        .filter(|record| record.len() >= 6)
        .filter(|record| {
            record
                .get(0)
                .is_some_and(|first| first.len() == 4 && first.bytes().all(|b| b.is_ascii_digit()))
        })
        .count() as u64
}
