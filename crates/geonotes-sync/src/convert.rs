//! Raw dump text to note records
//!
//! Bulk dumps are line-oriented CSV with one record type per line:
//!
//! ```text
//! N,<id>,<lat>,<lon>,<created_at>,<updated_at>,<status>,<closed_at>
//! C,<note_id>,<seq>,<action>,<created_at>,<author>,<text>
//! ```
//!
//! Comment lines follow the note they belong to, so every line of one note's
//! history carries the same entity id in its second field.

use crate::error::{Result, SyncError};
use crate::models::{Coordinates, NoteComment, NoteId, NoteRecord};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Converts a byte slice of a bulk dump into normalized records
///
/// Implementations are synchronous; workers call them from a blocking task.
pub trait FormatConverter: Send + Sync {
    /// Parse every record in `data`, preserving input order
    fn convert(&self, data: &[u8]) -> Result<Vec<NoteRecord>>;

    /// Entity a single raw line belongs to, if it carries one
    fn entity_id(&self, line: &[u8]) -> Option<NoteId>;
}

/// Converter for the `N,`/`C,` CSV dump format
#[derive(Debug, Clone, Default)]
pub struct CsvNoteConverter;

impl CsvNoteConverter {
    pub fn new() -> Self {
        Self
    }

    /// Render notes back to dump lines (fixtures and re-exports)
    pub fn encode(&self, notes: &[NoteRecord]) -> Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_writer(Vec::new());

        for note in notes {
            writer
                .write_record([
                    "N".to_string(),
                    note.id.to_string(),
                    note.location.lat.to_string(),
                    note.location.lon.to_string(),
                    note.created_at.to_rfc3339(),
                    note.updated_at.to_rfc3339(),
                    note.status.to_string(),
                    note.closed_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                ])
                .map_err(csv_error)?;
            for comment in &note.comments {
                writer
                    .write_record([
                        "C".to_string(),
                        comment.note_id.to_string(),
                        comment.seq.to_string(),
                        comment.action.clone(),
                        comment.created_at.to_rfc3339(),
                        comment.author.clone().unwrap_or_default(),
                        comment.text.clone(),
                    ])
                    .map_err(csv_error)?;
            }
        }

        writer
            .into_inner()
            .map_err(|e| SyncError::DataValidation(format!("failed to flush dump writer: {e}")))
    }
}

impl FormatConverter for CsvNoteConverter {
    fn convert(&self, data: &[u8]) -> Result<Vec<NoteRecord>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(data);

        let mut notes: Vec<NoteRecord> = Vec::new();
        let mut index_by_id: HashMap<NoteId, usize> = HashMap::new();

        for (line_no, row) in reader.records().enumerate() {
            let row = row.map_err(csv_error)?;
            let line = line_no + 1;

            match row.get(0) {
                Some("N") => {
                    let note = parse_note(&row, line)?;
                    if index_by_id.insert(note.id, notes.len()).is_some() {
                        return Err(SyncError::DataValidation(format!(
                            "line {line}: duplicate note {}",
                            note.id
                        )));
                    }
                    notes.push(note);
                },
                Some("C") => {
                    let comment = parse_comment(&row, line)?;
                    let idx = index_by_id.get(&comment.note_id).ok_or_else(|| {
                        SyncError::DataValidation(format!(
                            "line {line}: comment for note {} precedes its note",
                            comment.note_id
                        ))
                    })?;
                    notes[*idx].comments.push(comment);
                },
                Some("") | None => continue,
                Some(other) => {
                    return Err(SyncError::DataValidation(format!(
                        "line {line}: unknown record type '{other}'"
                    )))
                },
            }
        }

        for note in &mut notes {
            note.comments.sort_by_key(|c| c.seq);
        }
        Ok(notes)
    }

    fn entity_id(&self, line: &[u8]) -> Option<NoteId> {
        let mut fields = line.splitn(3, |b| *b == b',');
        let kind = fields.next()?;
        if kind != b"N" && kind != b"C" {
            return None;
        }
        std::str::from_utf8(fields.next()?).ok()?.trim().parse().ok()
    }
}

fn parse_note(row: &csv::StringRecord, line: usize) -> Result<NoteRecord> {
    if row.len() < 7 {
        return Err(SyncError::DataValidation(format!(
            "line {line}: note record has {} fields, expected 8",
            row.len()
        )));
    }
    let lat = parse_field::<f64>(row, 2, "lat", line)?;
    let lon = parse_field::<f64>(row, 3, "lon", line)?;

    Ok(NoteRecord {
        id: parse_field(row, 1, "id", line)?,
        location: Coordinates::new(lat, lon)
            .map_err(|e| SyncError::DataValidation(format!("line {line}: {e}")))?,
        created_at: parse_time(field(row, 4), "created_at", line)?,
        updated_at: parse_time(field(row, 5), "updated_at", line)?,
        status: field(row, 6).parse()?,
        closed_at: match field(row, 7) {
            "" => None,
            raw => Some(parse_time(raw, "closed_at", line)?),
        },
        comments: Vec::new(),
    })
}

fn parse_comment(row: &csv::StringRecord, line: usize) -> Result<NoteComment> {
    if row.len() < 7 {
        return Err(SyncError::DataValidation(format!(
            "line {line}: comment record has {} fields, expected 7",
            row.len()
        )));
    }
    let author = field(row, 5);
    Ok(NoteComment {
        note_id: parse_field(row, 1, "note_id", line)?,
        seq: parse_field(row, 2, "seq", line)?,
        action: field(row, 3).to_string(),
        created_at: parse_time(field(row, 4), "created_at", line)?,
        author: (!author.is_empty()).then(|| author.to_string()),
        text: field(row, 6).to_string(),
    })
}

fn field(row: &csv::StringRecord, idx: usize) -> &str {
    row.get(idx).map(str::trim).unwrap_or("")
}

fn parse_field<T: std::str::FromStr>(
    row: &csv::StringRecord,
    idx: usize,
    name: &str,
    line: usize,
) -> Result<T> {
    let raw = field(row, idx);
    raw.parse()
        .map_err(|_| SyncError::DataValidation(format!("line {line}: invalid {name} '{raw}'")))
}

fn parse_time(raw: &str, name: &str, line: usize) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SyncError::DataValidation(format!("line {line}: invalid {name} '{raw}': {e}")))
}

fn csv_error(err: csv::Error) -> SyncError {
    SyncError::DataValidation(format!("malformed CSV: {err}"))
}
