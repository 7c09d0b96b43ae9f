//! Tabular input and result exports.
//!
//! Input is a headed CSV with at least a question column. Row identifiers are
//! spreadsheet row numbers: the header is row 1, so the first data row is 2.
//!
//! Results go to two files: an annotated CSV for people (with rationale) and
//! a JSON array for tools (rationale excluded).

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use serde::{Deserialize, Serialize};

use crate::evaluator::{EvaluationRecord, RecordStatus};
use crate::sampler::Stratified;

/// Row number of the first data row.
pub const FIRST_DATA_ROW: usize = 2;

const QUESTION_COLUMNS: &[&str] = &["question", "text", "query"];
const TRUTH_COLUMNS: &[&str] = &["ground_truth", "ground truth", "label", "domain"];
const SUCCESS_COLUMNS: &[&str] = &["success", "result"];

/// Separator for multi-label cells in the CSV export.
const LABEL_SEPARATOR: &str = " | ";

#[derive(Debug, thiserror::Error)]
pub enum RecordsError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("input has no question column (expected one of: {0})")]
    MissingQuestionColumn(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> RecordsError + '_ {
    move |source| RecordsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// =============================================================================
// Requests
// =============================================================================

/// One question to classify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRequest {
    pub row: usize,
    pub question: String,
    pub ground_truth: Option<String>,
    /// Success flag from a previous run, if the input carries one.
    pub prior_success: Option<bool>,
}

impl Stratified for ClassificationRequest {
    fn stratum(&self) -> &str {
        self.ground_truth.as_deref().unwrap_or("")
    }
}

/// Which rows to read, by prior success flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuccessFilter {
    #[default]
    All,
    /// Only rows previously marked `O`.
    Success,
    /// Only rows previously marked `X`.
    Failure,
}

impl SuccessFilter {
    pub fn admits(&self, prior: Option<bool>) -> bool {
        match self {
            SuccessFilter::All => true,
            SuccessFilter::Success => prior == Some(true),
            SuccessFilter::Failure => prior == Some(false),
        }
    }
}

impl FromStr for SuccessFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "all" | "ALL" | "All" => Ok(SuccessFilter::All),
            "O" | "o" => Ok(SuccessFilter::Success),
            "X" | "x" => Ok(SuccessFilter::Failure),
            other => Err(format!("unknown filter '{other}' (expected all, O or X)")),
        }
    }
}

/// Parse `O`/`X` (or true/false) success cells.
pub fn parse_success_flag(cell: &str) -> Option<bool> {
    match cell.trim().to_ascii_lowercase().as_str() {
        "o" | "true" | "1" | "yes" => Some(true),
        "x" | "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

pub fn success_mark(success: bool) -> &'static str {
    if success {
        "O"
    } else {
        "X"
    }
}

fn find_column(headers: &StringRecord, names: &[&str]) -> Option<usize> {
    headers.iter().position(|h| {
        let h = h.trim().to_lowercase();
        names.iter().any(|n| *n == h)
    })
}

fn non_blank(cell: Option<&str>) -> Option<String> {
    cell.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// A loaded input CSV, kept whole so it can be written back relabeled.
#[derive(Debug, Clone)]
pub struct InputTable {
    headers: StringRecord,
    rows: Vec<StringRecord>,
    question_idx: usize,
    truth_idx: Option<usize>,
    success_idx: Option<usize>,
}

impl InputTable {
    pub fn load(path: &Path) -> Result<Self, RecordsError> {
        let file = File::open(path).map_err(io_err(path))?;
        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(BufReader::new(file));

        let headers = rdr.headers()?.clone();
        let question_idx = find_column(&headers, QUESTION_COLUMNS)
            .ok_or_else(|| RecordsError::MissingQuestionColumn(QUESTION_COLUMNS.join(", ")))?;
        let truth_idx = find_column(&headers, TRUTH_COLUMNS);
        let success_idx = find_column(&headers, SUCCESS_COLUMNS);

        let rows = rdr.records().collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(path = %path.display(), rows = rows.len(), "input loaded");

        Ok(Self {
            headers,
            rows,
            question_idx,
            truth_idx,
            success_idx,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Requests for non-blank questions admitted by `filter`.
    pub fn requests(&self, filter: SuccessFilter) -> Vec<ClassificationRequest> {
        self.rows
            .iter()
            .enumerate()
            .filter_map(|(idx, record)| {
                let question = non_blank(record.get(self.question_idx))?;
                let prior_success = self
                    .success_idx
                    .and_then(|i| record.get(i))
                    .and_then(parse_success_flag);
                if !filter.admits(prior_success) {
                    return None;
                }
                Some(ClassificationRequest {
                    row: idx + FIRST_DATA_ROW,
                    question,
                    ground_truth: self.truth_idx.and_then(|i| non_blank(record.get(i))),
                    prior_success,
                })
            })
            .collect()
    }

    /// Write the table with the ground-truth column replaced for the given rows.
    ///
    /// Adds a `ground_truth` column when the input had none.
    pub fn write_relabeled(
        &self,
        path: &Path,
        labels: &BTreeMap<usize, String>,
    ) -> Result<(), RecordsError> {
        ensure_parent(path)?;
        let mut wtr = WriterBuilder::new().flexible(true).from_path(path)?;

        let (headers, truth_idx) = match self.truth_idx {
            Some(idx) => (self.headers.clone(), idx),
            None => {
                let mut h = self.headers.clone();
                h.push_field("ground_truth");
                let idx = h.len() - 1;
                (h, idx)
            }
        };
        wtr.write_record(&headers)?;

        for (idx, record) in self.rows.iter().enumerate() {
            let row = idx + FIRST_DATA_ROW;
            let mut fields: Vec<String> = record.iter().map(str::to_string).collect();
            if fields.len() <= truth_idx {
                fields.resize(truth_idx + 1, String::new());
            }
            if let Some(label) = labels.get(&row) {
                fields[truth_idx] = label.clone();
            }
            wtr.write_record(&fields)?;
        }
        wtr.flush().map_err(io_err(path))?;
        Ok(())
    }

    /// Write only the given rows, unchanged, under the original header.
    pub fn write_rows(&self, path: &Path, rows: &BTreeSet<usize>) -> Result<usize, RecordsError> {
        ensure_parent(path)?;
        let mut wtr = WriterBuilder::new().flexible(true).from_path(path)?;
        wtr.write_record(&self.headers)?;

        let mut written = 0;
        for (idx, record) in self.rows.iter().enumerate() {
            if rows.contains(&(idx + FIRST_DATA_ROW)) {
                wtr.write_record(record)?;
                written += 1;
            }
        }
        wtr.flush().map_err(io_err(path))?;
        Ok(written)
    }
}

/// Load requests from a CSV in one step.
pub fn read_requests(
    path: &Path,
    filter: SuccessFilter,
) -> Result<Vec<ClassificationRequest>, RecordsError> {
    Ok(InputTable::load(path)?.requests(filter))
}

// =============================================================================
// Exports
// =============================================================================

#[derive(Debug, Serialize)]
struct CsvResultRow<'a> {
    row: usize,
    question: &'a str,
    ground_truth: &'a str,
    classified_label: &'a str,
    labels: String,
    success: &'static str,
    hit_rank: Option<usize>,
    opinion_tag: &'a str,
    status: RecordStatus,
    rationale: &'a str,
}

/// Machine-readable export row. Rationale is deliberately absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonResultRow {
    pub row: usize,
    pub question: String,
    pub ground_truth: Option<String>,
    pub classified_label: Option<String>,
    pub labels: Vec<String>,
    pub success: bool,
    pub hit_rank: Option<usize>,
    pub opinion_tag: String,
    pub status: RecordStatus,
}

impl From<&EvaluationRecord> for JsonResultRow {
    fn from(r: &EvaluationRecord) -> Self {
        Self {
            row: r.row,
            question: r.question.clone(),
            ground_truth: r.ground_truth.clone(),
            classified_label: r.top_label().map(str::to_string),
            labels: r.labels.clone(),
            success: r.success,
            hit_rank: r.hit_rank,
            opinion_tag: r.opinion_tag.clone(),
            status: r.status,
        }
    }
}

impl From<JsonResultRow> for EvaluationRecord {
    fn from(r: JsonResultRow) -> Self {
        Self {
            row: r.row,
            question: r.question,
            ground_truth: r.ground_truth,
            labels: r.labels,
            success: r.success,
            hit_rank: r.hit_rank,
            rationale: String::new(),
            opinion_tag: r.opinion_tag,
            status: r.status,
        }
    }
}

fn ensure_parent(path: &Path) -> Result<(), RecordsError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
    }
    Ok(())
}

/// JSON export path next to a CSV export (`result.csv` -> `result.json`).
pub fn json_path_for(csv_path: &Path) -> PathBuf {
    csv_path.with_extension("json")
}

pub fn write_results_csv(path: &Path, records: &[EvaluationRecord]) -> Result<(), RecordsError> {
    ensure_parent(path)?;
    let mut wtr = WriterBuilder::new().from_path(path)?;
    for r in records {
        wtr.serialize(CsvResultRow {
            row: r.row,
            question: &r.question,
            ground_truth: r.ground_truth.as_deref().unwrap_or(""),
            classified_label: r.top_label().unwrap_or(""),
            labels: r.labels.join(LABEL_SEPARATOR),
            success: success_mark(r.success),
            hit_rank: r.hit_rank,
            opinion_tag: &r.opinion_tag,
            status: r.status,
            rationale: &r.rationale,
        })?;
    }
    wtr.flush().map_err(io_err(path))?;
    Ok(())
}

pub fn write_results_json(path: &Path, records: &[EvaluationRecord]) -> Result<(), RecordsError> {
    ensure_parent(path)?;
    let rows: Vec<JsonResultRow> = records.iter().map(JsonResultRow::from).collect();
    let file = File::create(path).map_err(io_err(path))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &rows)?;
    Ok(())
}

pub fn read_results_json(path: &Path) -> Result<Vec<EvaluationRecord>, RecordsError> {
    let file = File::open(path).map_err(io_err(path))?;
    let rows: Vec<JsonResultRow> = serde_json::from_reader(BufReader::new(file))?;
    Ok(rows.into_iter().map(EvaluationRecord::from).collect())
}

/// Write both exports; returns the JSON path.
pub fn write_results(csv_path: &Path, records: &[EvaluationRecord]) -> Result<PathBuf, RecordsError> {
    write_results_csv(csv_path, records)?;
    let json_path = json_path_for(csv_path);
    write_results_json(&json_path, records)?;
    tracing::info!(
        csv = %csv_path.display(),
        json = %json_path.display(),
        rows = records.len(),
        "results written"
    );
    Ok(json_path)
}
