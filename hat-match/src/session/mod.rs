//! Proofreading session
//!
//! Ties the atlas, the thresholded query image, candidate search, scoring
//! and the results ledger together as an explicit state machine. One caller
//! drives the session; scoring runs on a background task and reports
//! progress on the session's [`EventBus`].
//!
//! Failed operations leave the session in its last good state.

pub mod state;

pub use state::{SessionState, StateTransition};

use crate::atlas::{AtlasValidation, HemilineageAtlas, SqliteAtlas};
use crate::display::{ArtifactData, DisplayArtifact, DisplayKind};
use crate::error::{MatchError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::ledger::{CentroidMarker, LedgerFilter, ResultRow, ResultsLedger, ReviewStatus, RowKey, RowUpdate};
use crate::scoring::{run_batch, BatchRequest, NblastParams, ScoringMethods, ScoringReport};
use crate::search::{Candidate, CandidateSearch, SearchParams};
use crate::selection::{parse_point_selection, selection_centroid};
use crate::threshold;
use crate::volume::{BinaryMask, QueryImage};
use chrono::Utc;
use hat_common::Point3;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Tunables the session passes down to search and scoring
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub search: SearchParams,
    pub nblast: NblastParams,
    /// Concurrent candidates per batch, 0 = number of CPUs
    pub workers: usize,
    /// Rescore targets whose ledger rows are already current
    pub rescore: bool,
    pub expected_hemilineages: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            search: SearchParams::default(),
            nblast: NblastParams::default(),
            workers: 0,
            rescore: true,
            expected_hemilineages: None,
        }
    }
}

impl SessionConfig {
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }
}

/// Result of thresholding the query image
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdSummary {
    pub threshold: f64,
    pub foreground_voxels: usize,
    pub automatic: bool,
}

/// One round of point selection, candidate editing and scoring
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCycle {
    pub centroid: Point3,
    /// 0-based indices of the points that formed the centroid
    pub selection: Vec<usize>,
    /// Search result, nearest first
    pub candidates: Vec<Candidate>,
    /// Hemilineages that will be scored; starts as the candidate list
    pub targets: Vec<String>,
}

/// Handle to a running scoring batch
pub struct ScoringJob {
    job_id: Uuid,
    cancel: CancellationToken,
    handle: JoinHandle<ScoringReport>,
}

impl ScoringJob {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Stop dispatching candidates; finished candidates are kept
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

pub struct ProofreadingSession {
    id: Uuid,
    state: SessionState,
    config: SessionConfig,
    events: EventBus,
    atlas: Option<Arc<dyn HemilineageAtlas>>,
    hemilineages: Vec<String>,
    search: Option<CandidateSearch>,
    image: Option<Arc<QueryImage>>,
    mask: Option<Arc<BinaryMask>>,
    ledger: Option<ResultsLedger>,
    cycle: Option<MatchCycle>,
    active_job: Option<Uuid>,
    /// Report applied to the ledger whose save has not succeeded yet
    pending: Option<ScoringReport>,
    last_report: Option<ScoringReport>,
}

impl ProofreadingSession {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_events(config, EventBus::default())
    }

    pub fn with_events(config: SessionConfig, events: EventBus) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Disconnected,
            config,
            events,
            atlas: None,
            hemilineages: Vec::new(),
            search: None,
            image: None,
            mask: None,
            ledger: None,
            cycle: None,
            active_job: None,
            pending: None,
            last_report: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn atlas(&self) -> Option<&Arc<dyn HemilineageAtlas>> {
        self.atlas.as_ref()
    }

    pub fn hemilineages(&self) -> &[String] {
        &self.hemilineages
    }

    pub fn candidate_search(&self) -> Option<&CandidateSearch> {
        self.search.as_ref()
    }

    pub fn image(&self) -> Option<&QueryImage> {
        self.image.as_deref()
    }

    pub fn mask(&self) -> Option<&BinaryMask> {
        self.mask.as_deref()
    }

    pub fn ledger(&self) -> Option<&ResultsLedger> {
        self.ledger.as_ref()
    }

    pub fn cycle(&self) -> Option<&MatchCycle> {
        self.cycle.as_ref()
    }

    pub fn last_report(&self) -> Option<&ScoringReport> {
        self.last_report.as_ref()
    }

    /// Report whose rows are applied but not yet saved
    pub fn pending_report(&self) -> Option<&ScoringReport> {
        self.pending.as_ref()
    }

    /// Move to `new_state` and publish the change
    pub fn transition_to(&mut self, new_state: SessionState) -> StateTransition {
        let transition = StateTransition {
            session_id: self.id,
            old_state: self.state,
            new_state,
            transitioned_at: Utc::now(),
        };
        self.state = new_state;

        if transition.old_state != new_state {
            info!(
                session_id = %self.id,
                from = %transition.old_state,
                to = %new_state,
                "Session state changed"
            );
            self.events.emit_lossy(SessionEvent::StateChanged {
                old_state: transition.old_state,
                new_state,
                timestamp: transition.transitioned_at,
            });
        }
        transition
    }

    fn require_not_scoring(&self, operation: &'static str) -> Result<()> {
        if self.state == SessionState::Scoring {
            return Err(self.invalid_state(operation));
        }
        Ok(())
    }

    fn invalid_state(&self, operation: &'static str) -> MatchError {
        MatchError::InvalidState {
            operation,
            state: self.state,
        }
    }

    /// State implied by what is loaded, used after connect and image changes
    fn resting_state(&self) -> SessionState {
        if self.atlas.is_none() {
            SessionState::Disconnected
        } else if self.mask.is_none() {
            SessionState::Connected
        } else if self.ledger.is_none() {
            SessionState::Thresholded
        } else {
            SessionState::AwaitingSelection
        }
    }

    // ------------------------------------------------------------------
    // Atlas connection
    // ------------------------------------------------------------------

    /// Open a SQLite atlas file and connect to it
    pub async fn connect(&mut self, path: &Path) -> Result<()> {
        self.require_not_scoring("connect")?;
        let atlas = SqliteAtlas::connect(path).await?;
        self.connect_with(Arc::new(atlas)).await
    }

    /// Connect to an already opened atlas
    ///
    /// Replaces any previous connection. The pending match cycle is dropped
    /// because its candidates came from the old atlas.
    pub async fn connect_with(&mut self, atlas: Arc<dyn HemilineageAtlas>) -> Result<()> {
        self.require_not_scoring("connect")?;

        let hemilineages = atlas.hemilineages().await.map_err(into_connection)?;
        let search = CandidateSearch::load(atlas.as_ref(), self.config.search)
            .await
            .map_err(into_connection)?;

        if let Some(previous) = self.atlas.take() {
            debug!(atlas = %previous.location(), "Closing previous atlas connection");
            previous.close().await;
        }

        info!(
            atlas = %atlas.location(),
            hemilineages = hemilineages.len(),
            zones = search.zones().len(),
            "Connected to atlas"
        );
        self.events.emit_lossy(SessionEvent::AtlasConnected {
            location: atlas.location(),
            hemilineages: hemilineages.len(),
            timestamp: Utc::now(),
        });

        self.atlas = Some(atlas);
        self.hemilineages = hemilineages;
        self.search = Some(search);
        self.cycle = None;
        let next = self.resting_state();
        self.transition_to(next);
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.require_not_scoring("disconnect")?;
        if let Some(atlas) = self.atlas.take() {
            atlas.close().await;
            info!(atlas = %atlas.location(), "Disconnected from atlas");
        }
        self.hemilineages.clear();
        self.search = None;
        self.cycle = None;
        self.transition_to(SessionState::Disconnected);
        Ok(())
    }

    pub async fn validate_atlas(&self) -> Result<AtlasValidation> {
        let atlas = self.atlas.as_ref().ok_or_else(|| self.invalid_state("validate atlas"))?;
        atlas.validate(self.config.expected_hemilineages).await
    }

    // ------------------------------------------------------------------
    // Query image and threshold
    // ------------------------------------------------------------------

    /// Replace the query image; mask, ledger and match cycle are reset
    pub fn load_image(&mut self, image: QueryImage) -> Result<()> {
        self.require_not_scoring("load an image")?;
        info!(
            image = %image.name(),
            dims = ?image.geometry().dims,
            pixel_type = ?image.pixel_type(),
            "Query image loaded"
        );
        self.image = Some(Arc::new(image));
        self.mask = None;
        self.ledger = None;
        self.cycle = None;
        self.pending = None;
        self.last_report = None;
        let next = self.resting_state();
        self.transition_to(next);
        Ok(())
    }

    fn require_threshold_state(&self) -> Result<Arc<QueryImage>> {
        if !self.state.allows_threshold() {
            return Err(self.invalid_state("threshold"));
        }
        self.image
            .clone()
            .ok_or_else(|| MatchError::InvalidInput("no query image loaded".to_string()))
    }

    /// Threshold the query image with Otsu's method
    pub fn auto_threshold(&mut self) -> Result<ThresholdSummary> {
        let image = self.require_threshold_state()?;
        let value = threshold::compute_threshold(&image)?;
        Ok(self.install_mask(&image, value, true))
    }

    /// Threshold the query image at a user-supplied value
    pub fn apply_threshold(&mut self, value: f64) -> Result<ThresholdSummary> {
        let image = self.require_threshold_state()?;
        threshold::validate_manual(&image, value)?;
        Ok(self.install_mask(&image, value, false))
    }

    fn install_mask(&mut self, image: &QueryImage, value: f64, automatic: bool) -> ThresholdSummary {
        let mask = threshold::apply(image, value);
        let summary = ThresholdSummary {
            threshold: value,
            foreground_voxels: mask.count(),
            automatic,
        };
        info!(
            threshold = value,
            foreground_voxels = summary.foreground_voxels,
            automatic,
            "Threshold applied"
        );
        self.events.emit_lossy(SessionEvent::ThresholdApplied {
            threshold: value,
            foreground_voxels: summary.foreground_voxels,
            automatic,
            timestamp: Utc::now(),
        });
        self.mask = Some(Arc::new(mask));
        if self.state == SessionState::Connected {
            self.transition_to(SessionState::Thresholded);
        }
        summary
    }

    // ------------------------------------------------------------------
    // Results ledger
    // ------------------------------------------------------------------

    /// Open the results table next to the query image file
    pub fn open_ledger(&mut self) -> Result<()> {
        let path = self
            .image
            .as_ref()
            .and_then(|image| image.ledger_path())
            .ok_or_else(|| {
                MatchError::InvalidInput(
                    "query image has no source file, give the results table path explicitly".to_string(),
                )
            })?;
        self.open_ledger_at(path)
    }

    pub fn open_ledger_at(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        if !self.state.allows_ledger() {
            return Err(self.invalid_state("open the results table"));
        }
        let ledger = ResultsLedger::load_or_create(path)?;
        self.ledger = Some(ledger);
        self.transition_to(SessionState::AwaitingSelection);
        Ok(())
    }

    fn save_ledger(&self) -> Result<()> {
        let ledger = self
            .ledger
            .as_ref()
            .ok_or_else(|| self.invalid_state("save the results table"))?;
        ledger.save()?;
        self.events.emit_lossy(SessionEvent::LedgerSaved {
            path: ledger.path().display().to_string(),
            rows: ledger.len(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    pub fn view(&self, filter: &LedgerFilter) -> Result<Vec<ResultRow>> {
        let ledger = self
            .ledger
            .as_ref()
            .ok_or_else(|| self.invalid_state("view results"))?;
        Ok(ledger.query(filter).into_iter().cloned().collect())
    }

    /// Latest rows for the current match cycle's centroid
    pub fn current_results(&self) -> Result<Vec<ResultRow>> {
        let centroid = self
            .cycle
            .as_ref()
            .map(|c| c.centroid)
            .ok_or_else(|| self.invalid_state("view current results"))?;
        self.view(&LedgerFilter::for_centroid(centroid))
    }

    /// Every recorded centroid plus the pending one, each with its mirror
    pub fn centroid_markers(&self) -> Vec<CentroidMarker> {
        let width = self.config.search.mirror_width_um;
        let mut markers = self
            .ledger
            .as_ref()
            .map(|l| l.centroid_markers(width))
            .unwrap_or_default();
        if let Some(cycle) = &self.cycle {
            if !markers.iter().any(|m| m.centroid.same_bits(&cycle.centroid)) {
                markers.push(CentroidMarker {
                    centroid: cycle.centroid,
                    mirrored: cycle.centroid.mirrored(width),
                });
            }
        }
        markers
    }

    // ------------------------------------------------------------------
    // Selection and candidates
    // ------------------------------------------------------------------

    /// Start a match cycle from clicked points and a selection string
    pub fn select_points(&mut self, points: &[Point3], selection: &str) -> Result<&MatchCycle> {
        if self.state != SessionState::AwaitingSelection {
            return Err(self.invalid_state("select points"));
        }
        if points.is_empty() {
            return Err(MatchError::DegenerateInput("no points placed".to_string()));
        }
        let indices = parse_point_selection(selection, points.len())?;
        let centroid = selection_centroid(points, &indices)?;
        self.begin_cycle(centroid, indices)
    }

    /// Start a match cycle from a known centroid
    pub fn select_centroid(&mut self, centroid: Point3) -> Result<&MatchCycle> {
        if self.state != SessionState::AwaitingSelection {
            return Err(self.invalid_state("select a centroid"));
        }
        self.begin_cycle(centroid, Vec::new())
    }

    fn begin_cycle(&mut self, centroid: Point3, selection: Vec<usize>) -> Result<&MatchCycle> {
        let search = self
            .search
            .as_ref()
            .ok_or_else(|| self.invalid_state("search candidates"))?;
        let candidates = search.find_candidates(&centroid)?;
        info!(
            centroid = %centroid,
            candidates = candidates.len(),
            "Candidate hemilineages found"
        );
        let targets = candidates.iter().map(|c| c.hemilineage.clone()).collect();
        Ok(self.cycle.insert(MatchCycle {
            centroid,
            selection,
            candidates,
            targets,
        }))
    }

    fn editable_cycle(&mut self, operation: &'static str) -> Result<&mut MatchCycle> {
        if self.state != SessionState::AwaitingSelection {
            return Err(self.invalid_state(operation));
        }
        let state = self.state;
        self.cycle.as_mut().ok_or(MatchError::InvalidState { operation, state })
    }

    /// Add a hemilineage to the scoring targets
    pub fn add_target(&mut self, hemilineage: &str) -> Result<()> {
        if !self.hemilineages.iter().any(|h| h == hemilineage) {
            return Err(MatchError::NotFound(format!(
                "hemilineage '{}' is not in the atlas",
                hemilineage
            )));
        }
        let cycle = self.editable_cycle("edit targets")?;
        if !cycle.targets.iter().any(|t| t == hemilineage) {
            cycle.targets.push(hemilineage.to_string());
        }
        Ok(())
    }

    pub fn remove_target(&mut self, hemilineage: &str) -> Result<()> {
        let cycle = self.editable_cycle("edit targets")?;
        let index = cycle
            .targets
            .iter()
            .position(|t| t == hemilineage)
            .ok_or_else(|| MatchError::NotFound(format!("'{}' is not a scoring target", hemilineage)))?;
        cycle.targets.remove(index);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scoring
    // ------------------------------------------------------------------

    /// Launch a scoring batch for the current targets
    ///
    /// Returns immediately; progress arrives on the event bus. Pass the job
    /// to [`complete_scoring`](Self::complete_scoring) to collect it.
    pub fn start_scoring(&mut self, methods: ScoringMethods) -> Result<ScoringJob> {
        if self.state != SessionState::AwaitingSelection {
            return Err(self.invalid_state("start scoring"));
        }
        if !methods.any() {
            return Err(MatchError::InvalidInput("no scoring method selected".to_string()));
        }
        let cycle = self
            .cycle
            .as_ref()
            .ok_or_else(|| self.invalid_state("start scoring"))?;
        if cycle.targets.is_empty() {
            return Err(MatchError::DegenerateInput("no hemilineages to score".to_string()));
        }
        let atlas = self
            .atlas
            .clone()
            .ok_or_else(|| self.invalid_state("start scoring"))?;
        let mask = self
            .mask
            .clone()
            .ok_or_else(|| self.invalid_state("start scoring"))?;
        if mask.count() == 0 {
            return Err(MatchError::DegenerateInput(
                "query mask has no foreground voxels".to_string(),
            ));
        }

        let (targets, skipped) = self.partition_targets(cycle, mask.threshold(), methods);
        let job_id = Uuid::new_v4();
        let request = BatchRequest {
            job_id,
            atlas,
            query_mask: mask,
            centroid: cycle.centroid,
            targets,
            skipped,
            methods,
            nblast: self.config.nblast,
            mirror_width_um: self.config.search.mirror_width_um,
            workers: self.config.effective_workers(),
        };

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_batch(request, self.events.clone(), cancel.clone()));
        self.active_job = Some(job_id);
        self.transition_to(SessionState::Scoring);
        Ok(ScoringJob {
            job_id,
            cancel,
            handle,
        })
    }

    fn partition_targets(
        &self,
        cycle: &MatchCycle,
        threshold: Option<f64>,
        methods: ScoringMethods,
    ) -> (Vec<String>, Vec<String>) {
        let Some(ledger) = self.ledger.as_ref().filter(|_| !self.config.rescore) else {
            return (cycle.targets.clone(), Vec::new());
        };
        cycle.targets.iter().cloned().partition(|name| {
            !ledger.is_current(&RowKey::new(name.clone(), cycle.centroid), threshold, methods)
        })
    }

    /// Wait for a batch, write its rows to the ledger and save
    ///
    /// Cancelled batches keep the candidates that finished. If the save
    /// fails the session stays in `Scoring` with the report pending;
    /// [`commit_scores`](Self::commit_scores) retries.
    pub async fn complete_scoring(&mut self, job: ScoringJob) -> Result<ScoringReport> {
        if self.state != SessionState::Scoring || self.active_job != Some(job.job_id) {
            return Err(self.invalid_state("complete scoring"));
        }
        let report = match job.handle.await {
            Ok(report) => report,
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "Scoring task failed");
                self.active_job = None;
                self.transition_to(SessionState::AwaitingSelection);
                return Err(MatchError::scoring("batch", e));
            }
        };
        self.active_job = None;

        let ledger = self
            .ledger
            .as_mut()
            .ok_or(MatchError::InvalidState {
                operation: "record scores",
                state: SessionState::Scoring,
            })?;
        for score in &report.scores {
            let update = RowUpdate::from_score(score, report.centroid, report.threshold, report.methods);
            let outcome = ledger.upsert(update);
            debug!(hemilineage = %score.hemilineage, outcome = ?outcome, "Result row recorded");
        }
        if report.failure_count() > 0 {
            warn!(
                job_id = %report.job_id,
                failed = report.failure_count(),
                "Some candidates could not be scored"
            );
        }

        self.pending = Some(report);
        self.commit_scores()
    }

    /// Save the pending scoring report and move on to review
    pub fn commit_scores(&mut self) -> Result<ScoringReport> {
        if self.state != SessionState::Scoring || self.pending.is_none() {
            return Err(self.invalid_state("commit scores"));
        }
        if let Err(e) = self.save_ledger() {
            error!(error = %e, "Could not save scores, results kept in memory");
            return Err(e);
        }
        let report = self.pending.take().ok_or_else(|| self.invalid_state("commit scores"))?;
        self.last_report = Some(report.clone());
        self.transition_to(SessionState::Reviewing);
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Review
    // ------------------------------------------------------------------

    /// Set the status of a hemilineage at the current cycle's centroid
    pub fn set_status(&mut self, hemilineage: &str, status: ReviewStatus) -> Result<()> {
        let centroid = self
            .cycle
            .as_ref()
            .map(|c| c.centroid)
            .ok_or_else(|| self.invalid_state("set a review status"))?;
        self.set_status_at(&RowKey::new(hemilineage, centroid), status)
    }

    /// Set the status of the latest row for `key` and save
    ///
    /// If the save fails the in-memory change is reverted.
    pub fn set_status_at(&mut self, key: &RowKey, status: ReviewStatus) -> Result<()> {
        self.require_not_scoring("set a review status")?;
        let state = self.state;
        let ledger = self.ledger.as_mut().ok_or(MatchError::InvalidState {
            operation: "set a review status",
            state,
        })?;
        let previous = ledger.set_status(key, status)?;
        if let Err(e) = self.save_ledger() {
            if let Some(ledger) = self.ledger.as_mut() {
                ledger.restore(previous);
            }
            return Err(e);
        }
        info!(hemilineage = %key.hemilineage, status = %status, "Review status saved");
        Ok(())
    }

    /// End the review of the current cycle
    pub fn finish_review(&mut self) -> Result<()> {
        if self.state != SessionState::Reviewing {
            return Err(self.invalid_state("finish review"));
        }
        self.save_ledger()?;
        self.cycle = None;
        self.transition_to(SessionState::AwaitingSelection);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Display
    // ------------------------------------------------------------------

    /// Fetch atlas data for the viewer
    pub async fn candidate_artifacts(&self, names: &[String], kind: DisplayKind) -> Result<Vec<DisplayArtifact>> {
        let atlas = self
            .atlas
            .as_ref()
            .ok_or_else(|| self.invalid_state("fetch candidate artifacts"))?;
        let mut artifacts = Vec::with_capacity(names.len());
        for name in names {
            let data = match kind.mask_kind() {
                Some(mask_kind) => ArtifactData::Mask(atlas.mask(name, mask_kind).await?),
                None => ArtifactData::Skeleton(atlas.skeleton(name).await?),
            };
            artifacts.push(DisplayArtifact {
                hemilineage: name.clone(),
                kind,
                data,
            });
        }
        debug!(count = artifacts.len(), kind = %kind, "Candidate artifacts fetched");
        Ok(artifacts)
    }
}

fn into_connection(e: MatchError) -> MatchError {
    match e {
        MatchError::Connection(_) => e,
        other => MatchError::Connection(other.to_string()),
    }
}
