//! Scoring batch runner
//!
//! Candidates are dispatched with `buffer_unordered(workers)`: atlas lookups
//! run on the async side, the CPU-bound scorers in `spawn_blocking`. The
//! cancellation token is checked before a candidate starts and again when it
//! finishes; results that finish after cancellation are discarded.

use super::dotprops::Dotprops;
use super::nblast::{nblast_symmetric, IndexedDotprops, NblastParams};
use super::voxel::voxel_overlap;
use super::{CandidateScore, ScoringMethods, ScoringReport};
use crate::atlas::{HemilineageAtlas, MaskKind};
use crate::error::Result;
use crate::events::{EventBus, ScoringProgress, SessionEvent};
use crate::volume::{BinaryMask, SparseMask};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use hat_common::Point3;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything a batch needs, owned so it can move onto a task
pub struct BatchRequest {
    pub job_id: Uuid,
    pub atlas: Arc<dyn HemilineageAtlas>,
    pub query_mask: Arc<BinaryMask>,
    pub centroid: Point3,
    /// Hemilineages to score, in display order
    pub targets: Vec<String>,
    /// Hemilineages left out because their scores are current
    pub skipped: Vec<String>,
    pub methods: ScoringMethods,
    pub nblast: NblastParams,
    /// Template width used to mirror skeletons for symmetric NBLAST
    pub mirror_width_um: f64,
    pub workers: usize,
}

type QueryMorphology = std::result::Result<Arc<IndexedDotprops>, String>;

/// Score every target; never fails as a whole
pub async fn run_batch(request: BatchRequest, events: EventBus, cancel: CancellationToken) -> ScoringReport {
    let start = Instant::now();
    let BatchRequest {
        job_id,
        atlas,
        query_mask,
        centroid,
        targets,
        skipped,
        methods,
        nblast: params,
        mirror_width_um,
        workers,
    } = request;
    let total = targets.len();
    let workers = workers.max(1);

    info!(
        job_id = %job_id,
        centroid = %centroid,
        candidates = total,
        skipped = skipped.len(),
        workers,
        voxel = methods.voxel,
        nblast = methods.nblast,
        "Scoring batch started"
    );
    events.emit_lossy(SessionEvent::ScoringStarted {
        job_id,
        total,
        timestamp: Utc::now(),
    });
    for hemilineage in &skipped {
        events.emit_lossy(SessionEvent::CandidateSkipped {
            job_id,
            hemilineage: hemilineage.clone(),
            timestamp: Utc::now(),
        });
    }

    // Query dotprops are shared by every candidate
    let query_morphology: Option<QueryMorphology> = if methods.nblast && total > 0 {
        Some(build_query_morphology(query_mask.clone(), params).await)
    } else {
        None
    };

    let completed = Arc::new(AtomicUsize::new(0));
    let results: Vec<(usize, Option<CandidateScore>)> = stream::iter(targets.iter().cloned().enumerate())
        .map(|(index, hemilineage)| {
            let atlas = atlas.clone();
            let query_mask = query_mask.clone();
            let query_morphology = query_morphology.clone();
            let completed = completed.clone();
            let cancel = cancel.clone();
            let events = events.clone();

            async move {
                if cancel.is_cancelled() {
                    return (index, None);
                }

                debug!(job_id = %job_id, hemilineage = %hemilineage, "Scoring candidate");
                let score = score_candidate(
                    atlas.as_ref(),
                    &hemilineage,
                    query_mask,
                    query_morphology,
                    methods,
                    params,
                    mirror_width_um,
                )
                .await;

                if cancel.is_cancelled() {
                    debug!(
                        job_id = %job_id,
                        hemilineage = %hemilineage,
                        "Candidate finished after cancellation, result discarded"
                    );
                    return (index, None);
                }

                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                let progress = ScoringProgress::new(done, total, start.elapsed());
                match &score.error {
                    None => events.emit_lossy(SessionEvent::CandidateScored {
                        job_id,
                        hemilineage: hemilineage.clone(),
                        voxel_score: score.voxel_score,
                        nblast_score: score.nblast_score,
                        progress,
                        timestamp: Utc::now(),
                    }),
                    Some(message) => {
                        warn!(
                            job_id = %job_id,
                            hemilineage = %hemilineage,
                            error = %message,
                            "Candidate scoring failed"
                        );
                        events.emit_lossy(SessionEvent::CandidateFailed {
                            job_id,
                            hemilineage: hemilineage.clone(),
                            message: message.clone(),
                            progress,
                            timestamp: Utc::now(),
                        });
                    }
                }
                (index, Some(score))
            }
        })
        .buffer_unordered(workers)
        .collect()
        .await;

    let mut slots: Vec<Option<CandidateScore>> = vec![None; total];
    for (index, score) in results {
        slots[index] = score;
    }
    let mut scores = Vec::new();
    let mut not_scored = Vec::new();
    for (name, slot) in targets.into_iter().zip(slots) {
        match slot {
            Some(score) => scores.push(score),
            None => not_scored.push(name),
        }
    }

    let cancelled = cancel.is_cancelled();
    let elapsed_ms = start.elapsed().as_millis() as u64;
    let failed = scores.iter().filter(|s| s.failed()).count();
    if cancelled {
        info!(
            job_id = %job_id,
            completed = scores.len(),
            discarded = not_scored.len(),
            "Scoring batch cancelled"
        );
        events.emit_lossy(SessionEvent::ScoringCancelled {
            job_id,
            completed: scores.len(),
            total,
            timestamp: Utc::now(),
        });
    } else {
        info!(
            job_id = %job_id,
            completed = scores.len(),
            failed,
            elapsed_ms,
            "Scoring batch completed"
        );
        events.emit_lossy(SessionEvent::ScoringCompleted {
            job_id,
            completed: scores.len(),
            failed,
            total,
            elapsed_ms,
            timestamp: Utc::now(),
        });
    }

    ScoringReport {
        job_id,
        centroid,
        threshold: query_mask.threshold(),
        methods,
        scores,
        skipped,
        not_scored,
        cancelled,
        elapsed_ms,
    }
}

async fn build_query_morphology(mask: Arc<BinaryMask>, params: NblastParams) -> QueryMorphology {
    let built = tokio::task::spawn_blocking(move || {
        let cleaned;
        let mask = if params.drop_fluff {
            cleaned = mask.largest_component();
            debug!(
                kept = cleaned.count(),
                dropped = mask.count() - cleaned.count(),
                "Dropped small query fragments"
            );
            &cleaned
        } else {
            mask.as_ref()
        };
        Dotprops::from_mask(mask, params.resample_um, params.k).map(|dp| Arc::new(IndexedDotprops::new(dp)))
    })
    .await;
    match built {
        Ok(Ok(query)) => {
            debug!(samples = query.dotprops().len(), "Query dotprops ready");
            Ok(query)
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Query dotprops unavailable, NBLAST scores will be absent");
            Err(e.to_string())
        }
        Err(e) => Err(format!("query dotprops task failed: {}", e)),
    }
}

/// Fetch atlas data for one candidate, then run the selected scorers
async fn score_candidate(
    atlas: &dyn HemilineageAtlas,
    hemilineage: &str,
    query_mask: Arc<BinaryMask>,
    query_morphology: Option<QueryMorphology>,
    methods: ScoringMethods,
    params: NblastParams,
    mirror_width_um: f64,
) -> CandidateScore {
    let tract: Option<Result<SparseMask>> = if methods.voxel {
        Some(atlas.mask(hemilineage, MaskKind::Tract).await)
    } else {
        None
    };
    let skeleton: Option<Result<Dotprops>> = match &query_morphology {
        Some(Ok(_)) => Some(atlas.skeleton(hemilineage).await),
        _ => None,
    };

    let computed = tokio::task::spawn_blocking(move || {
        let mut errors = Vec::new();

        let voxel_score = match tract {
            Some(Ok(sparse)) => {
                let score = voxel_overlap(&query_mask, &sparse);
                if score.is_none() {
                    errors.push("voxel: tract mask is empty".to_string());
                }
                score
            }
            Some(Err(e)) => {
                errors.push(format!("voxel: {}", e));
                None
            }
            None => None,
        };

        let nblast_score = match (query_morphology, skeleton) {
            (Some(Ok(query)), Some(Ok(skeleton))) => {
                let score = nblast_symmetric(&query, &skeleton, &params, mirror_width_um);
                if score.is_none() {
                    errors.push("nblast: skeleton is empty".to_string());
                }
                score
            }
            (Some(Ok(_)), Some(Err(e))) => {
                errors.push(format!("nblast: {}", e));
                None
            }
            (Some(Err(message)), _) => {
                errors.push(format!("nblast: {}", message));
                None
            }
            _ => None,
        };

        (voxel_score, nblast_score, errors)
    })
    .await;

    match computed {
        Ok((voxel_score, nblast_score, errors)) => CandidateScore {
            hemilineage: hemilineage.to_string(),
            voxel_score,
            nblast_score,
            error: (!errors.is_empty()).then(|| errors.join("; ")),
        },
        Err(e) => CandidateScore {
            hemilineage: hemilineage.to_string(),
            voxel_score: None,
            nblast_score: None,
            error: Some(format!("scoring task failed: {}", e)),
        },
    }
}
