//! In-memory atlas with failure and cancellation hooks

use async_trait::async_trait;
use hat_common::Point3;
use hat_match::atlas::{HemilineageAtlas, MaskKind, SomaPopulation};
use hat_match::error::{MatchError, Result};
use hat_match::scoring::Dotprops;
use hat_match::volume::SparseMask;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Entry {
    left: Vec<Point3>,
    right: Vec<Point3>,
    masks: HashMap<MaskKind, SparseMask>,
    skeleton: Option<Dotprops>,
}

#[derive(Default)]
pub struct MemoryAtlas {
    entries: BTreeMap<String, Entry>,
    failing: HashSet<String>,
    tract_lookups: AtomicUsize,
    cancel_at: Mutex<Option<(usize, CancellationToken)>>,
    closed: AtomicBool,
}

impl MemoryAtlas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hemilineage(
        mut self,
        name: &str,
        left: Vec<Point3>,
        right: Vec<Point3>,
        tract: SparseMask,
        skeleton: Dotprops,
    ) -> Self {
        let mut entry = Entry {
            left,
            right,
            skeleton: Some(skeleton),
            ..Default::default()
        };
        entry.masks.insert(MaskKind::Tract, tract);
        self.entries.insert(name.to_string(), entry);
        self
    }

    pub fn with_mask(mut self, name: &str, kind: MaskKind, mask: SparseMask) -> Self {
        self.entries.entry(name.to_string()).or_default().masks.insert(kind, mask);
        self
    }

    /// Every lookup for `name` fails with an atlas error
    pub fn failing(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    /// Cancel `token` when the `n`th tract lookup starts (1-based)
    pub fn cancel_on_tract_lookup(&self, n: usize, token: CancellationToken) {
        if let Ok(mut slot) = self.cancel_at.lock() {
            *slot = Some((n, token));
        }
    }

    pub fn tract_lookups(&self) -> usize {
        self.tract_lookups.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn entry(&self, name: &str) -> Result<&Entry> {
        if self.failing.contains(name) {
            return Err(MatchError::Atlas(format!("simulated lookup failure for {}", name)));
        }
        self.entries
            .get(name)
            .ok_or_else(|| MatchError::NotFound(format!("hemilineage {}", name)))
    }
}

#[async_trait]
impl HemilineageAtlas for MemoryAtlas {
    fn location(&self) -> String {
        "memory".to_string()
    }

    async fn hemilineages(&self) -> Result<Vec<String>> {
        Ok(self.entries.keys().cloned().collect())
    }

    async fn soma_populations(&self) -> Result<Vec<SomaPopulation>> {
        Ok(self
            .entries
            .iter()
            .map(|(name, e)| SomaPopulation {
                hemilineage: name.clone(),
                left: e.left.clone(),
                right: e.right.clone(),
            })
            .collect())
    }

    async fn mask(&self, hemilineage: &str, kind: MaskKind) -> Result<SparseMask> {
        if kind == MaskKind::Tract {
            let n = self.tract_lookups.fetch_add(1, Ordering::SeqCst) + 1;
            if let Ok(slot) = self.cancel_at.lock() {
                if let Some((at, token)) = slot.as_ref() {
                    if *at == n {
                        token.cancel();
                    }
                }
            }
        }
        self.entry(hemilineage)?
            .masks
            .get(&kind)
            .cloned()
            .ok_or_else(|| MatchError::NotFound(format!("{} mask for {}", kind, hemilineage)))
    }

    async fn skeleton(&self, hemilineage: &str) -> Result<Dotprops> {
        self.entry(hemilineage)?
            .skeleton
            .clone()
            .ok_or_else(|| MatchError::NotFound(format!("skeleton for {}", hemilineage)))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
