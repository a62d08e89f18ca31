//! Manifest-directory event source.
//!
//! Polls a directory of YAML resource manifests and turns what changed since
//! the previous scan into lifecycle events. The first scan reports every
//! manifest as a create.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use playop_core::{ParamSet, ResourceId};
use playop_events::LifecycleEvent;
use playop_reconciler::Controller;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const DEFAULT_NAMESPACE: &str = "default";

/// One custom-resource document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Metadata {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

impl Manifest {
    pub fn id(&self) -> ResourceId {
        let namespace = self
            .metadata
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(DEFAULT_NAMESPACE);
        ResourceId::new(&self.kind, namespace, &self.metadata.name)
    }

    pub fn params(&self) -> Result<ParamSet> {
        ParamSet::from_json(&self.spec)
            .with_context(|| format!("invalid spec for {}", self.id()))
    }
}

/// Parse every document in a YAML file. Empty documents are skipped.
pub fn read_manifests(path: &Path) -> Result<Vec<Manifest>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut manifests = Vec::new();
    for document in serde_yaml::Deserializer::from_str(&text) {
        let manifest = Option::<Manifest>::deserialize(document)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        manifests.extend(manifest);
    }
    Ok(manifests)
}

fn is_manifest_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
}

#[derive(Debug, Clone)]
struct Known {
    spec: ParamSet,
    generation: u64,
    file: PathBuf,
}

/// Directory watcher holding what was seen on the previous scan.
pub struct ManifestSource {
    dir: PathBuf,
    known: BTreeMap<ResourceId, Known>,
}

impl ManifestSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            known: BTreeMap::new(),
        }
    }

    /// Compare the directory against the previous scan.
    ///
    /// A file that fails to parse is skipped, and the resources it declared
    /// before are kept rather than deleted.
    pub fn scan(&mut self) -> Result<Vec<LifecycleEvent>> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list {}", self.dir.display()))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_manifest_file(path))
            .collect();
        files.sort();

        let mut seen: BTreeMap<ResourceId, (ParamSet, PathBuf)> = BTreeMap::new();
        let mut unreadable = BTreeSet::new();
        for file in files {
            let manifests = match read_manifests(&file) {
                Ok(manifests) => manifests,
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "Skipping unreadable manifest");
                    unreadable.insert(file);
                    continue;
                }
            };
            for manifest in manifests {
                let id = manifest.id();
                match manifest.params() {
                    Ok(spec) => {
                        if seen.insert(id.clone(), (spec, file.clone())).is_some() {
                            warn!(resource = %id, file = %file.display(), "Duplicate manifest, last one wins");
                        }
                    }
                    Err(e) => {
                        warn!(resource = %id, error = %e, "Skipping manifest");
                        unreadable.insert(file.clone());
                    }
                }
            }
        }

        let mut events = Vec::new();
        for (id, (spec, file)) in &seen {
            match self.known.get_mut(id) {
                None => {
                    self.known.insert(
                        id.clone(),
                        Known {
                            spec: spec.clone(),
                            generation: 1,
                            file: file.clone(),
                        },
                    );
                    events.push(LifecycleEvent::created(id.clone(), spec.clone(), 1));
                }
                Some(known) => {
                    known.file.clone_from(file);
                    if &known.spec != spec {
                        known.generation = known.generation.saturating_add(1);
                        known.spec = spec.clone();
                        events.push(LifecycleEvent::updated(
                            id.clone(),
                            spec.clone(),
                            known.generation,
                        ));
                    }
                }
            }
        }

        let gone: Vec<ResourceId> = self
            .known
            .iter()
            .filter(|(id, known)| !seen.contains_key(*id) && !unreadable.contains(&known.file))
            .map(|(id, _)| id.clone())
            .collect();
        for id in gone {
            if let Some(known) = self.known.remove(&id) {
                events.push(LifecycleEvent::deleted(id, known.spec, known.generation));
            }
        }

        Ok(events)
    }

    /// Poll until `stop_rx` flips, feeding every change to `controller`.
    pub async fn run(
        mut self,
        controller: Controller,
        interval: Duration,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        info!(dir = %self.dir.display(), interval_ms = interval.as_millis(), "Watching manifests");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop_rx.changed() => break,
            }
            let events = match self.scan() {
                Ok(events) => events,
                Err(e) => {
                    warn!(error = %e, "Manifest scan failed");
                    continue;
                }
            };
            for event in events {
                debug!(resource = %event.resource, event_type = %event.event_type, "Manifest change");
                if let Err(e) = controller.submit(event).await {
                    warn!(error = %e, "Event rejected");
                }
            }
        }
    }
}
