//! Results ledger: one CSV table of match results per query image
//!
//! Rows are facts keyed by `(hemilineage, query_centroid, threshold)`.
//! Scoring the same key again updates that row; scoring the same
//! hemilineage and centroid at another threshold appends a history row.
//! The latest row for a `(hemilineage, query_centroid)` pair is the last one
//! in file order.
//!
//! The file is replaced atomically on save (temp file in the same directory,
//! then rename), so a failed save leaves the previous table intact.

use crate::error::{MatchError, Result};
use crate::scoring::{CandidateScore, ScoringMethods};
use chrono::NaiveDateTime;
use hat_common::time::{format_stamp, local_stamp, parse_stamp};
use hat_common::Point3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

pub const HEADER: [&str; 8] = [
    "Hemilineage",
    "query_centroid",
    "time_stamp",
    "voxel_score",
    "NBLAST_score",
    "status",
    "threshold",
    "error",
];

/// Older tables spell the NBLAST column in lower case
const LEGACY_NBLAST_HEADER: &str = "nblast_score";

/// Proofreading verdict for one result row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    #[default]
    NotReviewed,
    Accept,
    Unsure,
    Reject,
}

impl ReviewStatus {
    pub const ALL: [ReviewStatus; 4] = [
        ReviewStatus::NotReviewed,
        ReviewStatus::Accept,
        ReviewStatus::Unsure,
        ReviewStatus::Reject,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::NotReviewed => "not_reviewed",
            ReviewStatus::Accept => "accept",
            ReviewStatus::Unsure => "unsure",
            ReviewStatus::Reject => "reject",
        }
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewStatus {
    type Err = MatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "not_reviewed" | "not reviewed" => Ok(ReviewStatus::NotReviewed),
            "accept" | "accepted" => Ok(ReviewStatus::Accept),
            "unsure" => Ok(ReviewStatus::Unsure),
            "reject" | "rejected" => Ok(ReviewStatus::Reject),
            other => Err(MatchError::InvalidInput(format!(
                "unknown review status '{}' (expected one of not_reviewed, accept, unsure, reject)",
                other
            ))),
        }
    }
}

/// One result row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRow {
    pub hemilineage: String,
    pub query_centroid: Point3,
    pub time_stamp: NaiveDateTime,
    pub voxel_score: Option<f64>,
    pub nblast_score: Option<f64>,
    pub status: ReviewStatus,
    pub threshold: Option<f64>,
    /// Set when a scorer failed for this candidate
    pub error: Option<String>,
}

impl ResultRow {
    fn matches_pair(&self, hemilineage: &str, centroid: &Point3) -> bool {
        self.hemilineage == hemilineage && self.query_centroid.same_bits(centroid)
    }

    fn matches_key(&self, hemilineage: &str, centroid: &Point3, threshold: Option<f64>) -> bool {
        self.matches_pair(hemilineage, centroid) && same_threshold(self.threshold, threshold)
    }
}

fn same_threshold(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.to_bits() == b.to_bits(),
        _ => false,
    }
}

/// Identifies the rows of one hemilineage at one query centroid
#[derive(Debug, Clone, PartialEq)]
pub struct RowKey {
    pub hemilineage: String,
    pub centroid: Point3,
}

impl RowKey {
    pub fn new(hemilineage: impl Into<String>, centroid: Point3) -> Self {
        Self {
            hemilineage: hemilineage.into(),
            centroid,
        }
    }
}

/// Fields written by an upsert
///
/// `None` in a score field leaves the stored value alone; `Some(None)` clears
/// it. The error flag always reflects the latest scoring attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RowUpdate {
    pub hemilineage: String,
    pub centroid: Point3,
    pub threshold: Option<f64>,
    pub voxel_score: Option<Option<f64>>,
    pub nblast_score: Option<Option<f64>>,
    pub status: Option<ReviewStatus>,
    pub error: Option<String>,
}

impl RowUpdate {
    pub fn new(hemilineage: impl Into<String>, centroid: Point3, threshold: Option<f64>) -> Self {
        Self {
            hemilineage: hemilineage.into(),
            centroid,
            threshold,
            voxel_score: None,
            nblast_score: None,
            status: None,
            error: None,
        }
    }

    /// Update carrying the scores of the methods that ran
    pub fn from_score(
        score: &CandidateScore,
        centroid: Point3,
        threshold: Option<f64>,
        methods: ScoringMethods,
    ) -> Self {
        Self {
            voxel_score: methods.voxel.then_some(score.voxel_score),
            nblast_score: methods.nblast.then_some(score.nblast_score),
            error: score.error.clone(),
            ..Self::new(score.hemilineage.clone(), centroid, threshold)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpsertOutcome {
    /// First row for this hemilineage and centroid
    Inserted,
    /// Existing row with the same threshold overwritten
    Updated,
    /// New history row at a different threshold
    Appended,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryView {
    /// Only the latest row per hemilineage and centroid
    #[default]
    Latest,
    All,
}

#[derive(Debug, Clone, Default)]
pub struct LedgerFilter {
    pub view: HistoryView,
    pub centroid: Option<Point3>,
    pub hemilineages: Option<Vec<String>>,
    pub status: Option<ReviewStatus>,
}

impl LedgerFilter {
    pub fn all_history() -> Self {
        Self {
            view: HistoryView::All,
            ..Default::default()
        }
    }

    pub fn for_centroid(centroid: Point3) -> Self {
        Self {
            centroid: Some(centroid),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: ReviewStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_hemilineages(mut self, names: Vec<String>) -> Self {
        self.hemilineages = Some(names);
        self
    }

    fn accepts(&self, row: &ResultRow) -> bool {
        if let Some(centroid) = &self.centroid {
            if !row.query_centroid.same_bits(centroid) {
                return false;
            }
        }
        if let Some(names) = &self.hemilineages {
            if !names.iter().any(|n| n == &row.hemilineage) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if row.status != status {
                return false;
            }
        }
        true
    }
}

/// A query centroid and its mirror image, for display
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CentroidMarker {
    pub centroid: Point3,
    pub mirrored: Point3,
}

/// Results table bound to a file path
#[derive(Debug, Clone)]
pub struct ResultsLedger {
    path: PathBuf,
    rows: Vec<ResultRow>,
}

impl ResultsLedger {
    /// Empty ledger bound to `path`; nothing is written until `save`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            rows: Vec::new(),
        }
    }

    /// Read the table at `path`, or start an empty one if the file is absent
    pub fn load_or_create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            info!(path = %path.display(), "No results table yet, starting empty ledger");
            return Ok(Self::new(path));
        }

        let file = File::open(&path).map_err(|e| MatchError::ledger_io(&path, e))?;
        let rows = read_rows(file).map_err(|message| MatchError::ledger_io(&path, message))?;
        info!(path = %path.display(), rows = rows.len(), "Loaded results table");
        Ok(Self { path, rows })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn latest_index(&self, hemilineage: &str, centroid: &Point3) -> Option<usize> {
        self.rows.iter().rposition(|r| r.matches_pair(hemilineage, centroid))
    }

    /// Latest row for a hemilineage at a centroid
    pub fn latest(&self, key: &RowKey) -> Option<&ResultRow> {
        self.latest_index(&key.hemilineage, &key.centroid)
            .map(|i| &self.rows[i])
    }

    /// Insert or update the row for `update`'s key
    pub fn upsert(&mut self, update: RowUpdate) -> UpsertOutcome {
        let stamp = local_stamp();
        let existing = self
            .rows
            .iter()
            .rposition(|r| r.matches_key(&update.hemilineage, &update.centroid, update.threshold));

        if let Some(index) = existing {
            let mut row = self.rows.remove(index);
            row.time_stamp = stamp;
            if let Some(voxel) = update.voxel_score {
                row.voxel_score = voxel;
            }
            if let Some(nblast) = update.nblast_score {
                row.nblast_score = nblast;
            }
            if let Some(status) = update.status {
                row.status = status;
            }
            row.error = update.error;
            // An updated row becomes the latest for its pair
            self.rows.push(row);
            return UpsertOutcome::Updated;
        }

        let outcome = if self.latest_index(&update.hemilineage, &update.centroid).is_some() {
            UpsertOutcome::Appended
        } else {
            UpsertOutcome::Inserted
        };
        self.rows.push(ResultRow {
            hemilineage: update.hemilineage,
            query_centroid: update.centroid,
            time_stamp: stamp,
            voxel_score: update.voxel_score.flatten(),
            nblast_score: update.nblast_score.flatten(),
            status: update.status.unwrap_or_default(),
            threshold: update.threshold,
            error: update.error,
        });
        outcome
    }

    /// Set the review status of the latest row for `key` and stamp it
    ///
    /// Returns the row as it was before the change. An unknown key leaves the
    /// ledger as it was.
    pub fn set_status(&mut self, key: &RowKey, status: ReviewStatus) -> Result<ResultRow> {
        let index = self
            .latest_index(&key.hemilineage, &key.centroid)
            .ok_or_else(|| {
                MatchError::NotFound(format!(
                    "no result row for {} at {}",
                    key.hemilineage, key.centroid
                ))
            })?;
        let row = &mut self.rows[index];
        let previous = row.clone();
        row.status = status;
        row.time_stamp = local_stamp();
        debug!(
            hemilineage = %key.hemilineage,
            centroid = %key.centroid,
            from = %previous.status,
            to = %status,
            "Review status changed"
        );
        Ok(previous)
    }

    /// Put `row` back in place of the latest row for its pair
    ///
    /// Returns false when no row exists for the pair.
    pub fn restore(&mut self, row: ResultRow) -> bool {
        match self.latest_index(&row.hemilineage, &row.query_centroid) {
            Some(index) => {
                self.rows[index] = row;
                true
            }
            None => false,
        }
    }

    /// Whether the latest row for `key` already holds every selected score
    /// at `threshold`
    pub fn is_current(&self, key: &RowKey, threshold: Option<f64>, methods: ScoringMethods) -> bool {
        match self.latest(key) {
            Some(row) => {
                same_threshold(row.threshold, threshold)
                    && row.error.is_none()
                    && (!methods.voxel || row.voxel_score.is_some())
                    && (!methods.nblast || row.nblast_score.is_some())
            }
            None => false,
        }
    }

    pub fn query(&self, filter: &LedgerFilter) -> Vec<&ResultRow> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(index, row)| match filter.view {
                HistoryView::All => true,
                HistoryView::Latest => {
                    self.latest_index(&row.hemilineage, &row.query_centroid) == Some(*index)
                }
            })
            .map(|(_, row)| row)
            .filter(|row| filter.accepts(row))
            .collect()
    }

    /// Distinct query centroids in order of first appearance
    pub fn centroids(&self) -> Vec<Point3> {
        let mut seen: Vec<Point3> = Vec::new();
        for row in &self.rows {
            if !seen.iter().any(|c| c.same_bits(&row.query_centroid)) {
                seen.push(row.query_centroid);
            }
        }
        seen
    }

    pub fn centroid_markers(&self, mirror_width_um: f64) -> Vec<CentroidMarker> {
        self.centroids()
            .into_iter()
            .map(|centroid| CentroidMarker {
                centroid,
                mirrored: centroid.mirrored(mirror_width_um),
            })
            .collect()
    }

    /// Write the table atomically
    pub fn save(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| MatchError::ledger_io(&self.path, e))?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| MatchError::ledger_io(&self.path, e))?;
        write_rows(tmp.as_file_mut(), &self.rows).map_err(|e| MatchError::ledger_io(&self.path, e))?;
        tmp.as_file().sync_all().map_err(|e| MatchError::ledger_io(&self.path, e))?;
        tmp.persist(&self.path)
            .map_err(|e| MatchError::ledger_io(&self.path, e.error))?;

        debug!(path = %self.path.display(), rows = self.rows.len(), "Saved results table");
        Ok(())
    }
}

fn format_float(value: Option<f64>) -> String {
    value.map(|v| format!("{:?}", v)).unwrap_or_default()
}

fn write_rows<W: Write>(writer: W, rows: &[ResultRow]) -> std::result::Result<(), String> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(HEADER).map_err(|e| e.to_string())?;
    for row in rows {
        csv.write_record([
            row.hemilineage.clone(),
            row.query_centroid.to_string(),
            format_stamp(&row.time_stamp),
            format_float(row.voxel_score),
            format_float(row.nblast_score),
            row.status.as_str().to_string(),
            format_float(row.threshold),
            row.error.clone().unwrap_or_default(),
        ])
        .map_err(|e| e.to_string())?;
    }
    csv.flush().map_err(|e| e.to_string())
}

/// Column positions found in a table header
struct Columns {
    hemilineage: usize,
    centroid: usize,
    time_stamp: Option<usize>,
    voxel: Option<usize>,
    nblast: Option<usize>,
    status: Option<usize>,
    threshold: Option<usize>,
    error: Option<usize>,
}

impl Columns {
    fn from_header(header: &csv::StringRecord) -> std::result::Result<Self, String> {
        let find = |name: &str| header.iter().position(|h| h.trim() == name);
        let hemilineage = find("Hemilineage").ok_or("missing 'Hemilineage' column")?;
        let centroid = find("query_centroid").ok_or("missing 'query_centroid' column")?;
        Ok(Self {
            hemilineage,
            centroid,
            time_stamp: find("time_stamp"),
            voxel: find("voxel_score"),
            nblast: find("NBLAST_score").or_else(|| find(LEGACY_NBLAST_HEADER)),
            status: find("status"),
            threshold: find("threshold"),
            error: find("error"),
        })
    }
}

fn read_rows<R: std::io::Read>(reader: R) -> std::result::Result<Vec<ResultRow>, String> {
    let mut csv = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let header = csv.headers().map_err(|e| e.to_string())?.clone();
    let columns = Columns::from_header(&header)?;

    let mut rows = Vec::new();
    for (line, record) in csv.records().enumerate() {
        let record = record.map_err(|e| e.to_string())?;
        let row = parse_row(&record, &columns).map_err(|e| format!("row {}: {}", line + 1, e))?;
        rows.push(row);
    }
    Ok(rows)
}

fn parse_row(record: &csv::StringRecord, columns: &Columns) -> std::result::Result<ResultRow, String> {
    let field = |index: Option<usize>| index.and_then(|i| record.get(i)).map(str::trim).filter(|s| !s.is_empty());
    let parse_float = |index: Option<usize>, name: &str| -> std::result::Result<Option<f64>, String> {
        field(index)
            .map(|s| s.parse::<f64>().map_err(|e| format!("invalid {} '{}': {}", name, s, e)))
            .transpose()
    };

    let hemilineage = field(Some(columns.hemilineage))
        .ok_or("empty hemilineage")?
        .to_string();
    let query_centroid: Point3 = field(Some(columns.centroid))
        .ok_or("empty query_centroid")?
        .parse()
        .map_err(|e: hat_common::Error| e.to_string())?;
    let time_stamp = match field(columns.time_stamp) {
        Some(text) => parse_stamp(text).map_err(|e| e.to_string())?,
        None => {
            warn!(hemilineage = %hemilineage, "Result row without time stamp, using current time");
            local_stamp()
        }
    };
    let status = match field(columns.status) {
        Some(text) => text.parse().map_err(|e: MatchError| e.to_string())?,
        None => ReviewStatus::NotReviewed,
    };

    Ok(ResultRow {
        hemilineage,
        query_centroid,
        time_stamp,
        voxel_score: parse_float(columns.voxel, "voxel_score")?,
        nblast_score: parse_float(columns.nblast, "NBLAST_score")?,
        status,
        threshold: parse_float(columns.threshold, "threshold")?,
        error: field(columns.error).map(str::to_string),
    })
}
