//! Per-profile identifier persistence.
//!
//! Each profile owns one JSON document at `profiles/{id}/identifiers.json`
//! holding the enabled flags, the global values, and per-app values. Every
//! mutation re-reads the document under an advisory lock, so several
//! processes injected into different apps can share a profile.

use std::collections::{BTreeMap, HashMap};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::generate::{Generator, OsVersion, StandardGenerator};
use super::system::SystemValues;
use super::validate::validate;
use super::{IdentifierKind, Scope};
use crate::error::IdentifierError;
use crate::lock::LockFile;
use crate::persist::{self, Loaded};
use crate::profile::ProfileContext;

const DOCUMENT_FILE: &str = "identifiers.json";
const LOCK_FILE: &str = "identifiers.lock";

/// Attempts at finding a value different from the previous one.
const MAX_DISTINCT_ATTEMPTS: usize = 8;

/// What a hook should hand back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Spoofed(String),
    /// The kind is disabled, or no profile is active: use the real value.
    Passthrough,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierRecord {
    pub value: String,
    pub generated_at: DateTime<Utc>,
}

impl IdentifierRecord {
    fn new(value: String) -> Self {
        Self {
            value,
            generated_at: Utc::now(),
        }
    }
}

/// One row of [`IdentifierStore::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindStatus {
    pub kind: IdentifierKind,
    pub enabled: bool,
    pub value: Option<String>,
}

/// On-disk layout. Keys are [`IdentifierKind::as_str`] names so that a
/// document written by a newer build with extra kinds still loads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ProfileDocument {
    #[serde(default)]
    enabled: BTreeMap<String, bool>,
    #[serde(default)]
    global: BTreeMap<String, IdentifierRecord>,
    #[serde(default)]
    apps: BTreeMap<String, BTreeMap<String, IdentifierRecord>>,
}

impl ProfileDocument {
    /// Kinds are enabled until explicitly disabled.
    fn is_enabled(&self, kind: IdentifierKind) -> bool {
        self.enabled.get(kind.as_str()).copied().unwrap_or(true)
    }

    fn record(&self, kind: IdentifierKind, bundle_id: &str) -> Option<&IdentifierRecord> {
        match kind.scope() {
            Scope::Global => self.global.get(kind.as_str()),
            Scope::App => self.apps.get(bundle_id)?.get(kind.as_str()),
        }
    }

    fn set_record(&mut self, kind: IdentifierKind, bundle_id: &str, value: String) {
        let record = IdentifierRecord::new(value);
        match kind.scope() {
            Scope::Global => self.global.insert(kind.as_str().to_string(), record),
            Scope::App => self
                .apps
                .entry(bundle_id.to_string())
                .or_default()
                .insert(kind.as_str().to_string(), record),
        };
    }
}

struct CachedDocument {
    document: ProfileDocument,
    stamp: Option<FileStamp>,
}

/// Identity of one on-disk version of a document. Every write replaces the
/// file by rename, so the inode changes even when the mtime tick does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    inode: u64,
    len: u64,
}

impl FileStamp {
    fn of(path: &Path) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        Some(Self {
            modified: meta.modified().ok()?,
            inode: meta.ino(),
            len: meta.len(),
        })
    }
}

pub struct IdentifierStore<G: Generator = StandardGenerator> {
    root: PathBuf,
    context: Arc<ProfileContext>,
    generator: G,
    cache: RwLock<HashMap<String, CachedDocument>>,
    last_error: Mutex<Option<String>>,
}

impl IdentifierStore<StandardGenerator> {
    pub fn new(root: impl Into<PathBuf>, context: Arc<ProfileContext>) -> Self {
        Self::with_generator(root, context, StandardGenerator)
    }
}

impl<G: Generator> IdentifierStore<G> {
    pub fn with_generator(root: impl Into<PathBuf>, context: Arc<ProfileContext>, generator: G) -> Self {
        Self {
            root: root.into(),
            context,
            generator,
            cache: RwLock::new(HashMap::new()),
            last_error: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &Arc<ProfileContext> {
        &self.context
    }

    /// A fresh value from the configured generator, unvalidated.
    pub fn generate(&self, kind: IdentifierKind) -> String {
        self.generator.generate(kind)
    }

    pub fn document_path(&self, profile_id: &str) -> PathBuf {
        self.profile_dir(profile_id).join(DOCUMENT_FILE)
    }

    /// The value to serve for `kind` in `bundle_id` under `profile_id`.
    ///
    /// A missing value is generated and persisted; a stored value that fails
    /// validation is discarded and regenerated once.
    pub fn current_value(
        &self,
        kind: IdentifierKind,
        bundle_id: &str,
        profile_id: &str,
    ) -> Result<Resolution, IdentifierError> {
        let fast = self.note(self.with_document(profile_id, |doc| {
            if !doc.is_enabled(kind) {
                return Some(Resolution::Passthrough);
            }
            doc.record(kind, bundle_id)
                .filter(|r| validate(kind, &r.value))
                .map(|r| Resolution::Spoofed(r.value.clone()))
        }))?;
        if let Some(resolution) = fast {
            return Ok(resolution);
        }

        let resolution = self.mutate(profile_id, |doc| {
            if !doc.is_enabled(kind) {
                return Ok((Resolution::Passthrough, false));
            }

            let value = match doc.record(kind, bundle_id) {
                Some(record) if validate(kind, &record.value) => {
                    return Ok((Resolution::Spoofed(record.value.clone()), false));
                }
                Some(record) => {
                    warn!(
                        "Discarding invalid stored {} for {} in profile {}: '{}'",
                        kind, bundle_id, profile_id, record.value
                    );
                    // The stored value already counts as one failure.
                    self.fresh_value(kind, 1, None)?
                }
                None => self.fresh_value(kind, 2, None)?,
            };

            debug!("Generated {} for {} in profile {}", kind, bundle_id, profile_id);
            doc.set_record(kind, bundle_id, value.clone());
            Ok((Resolution::Spoofed(value), true))
        });
        self.note(resolution)
    }

    /// Like [`current_value`](Self::current_value), falling back to what
    /// `system` reports when the kind passes through.
    pub fn current_value_or_system(
        &self,
        kind: IdentifierKind,
        bundle_id: &str,
        profile_id: &str,
        system: &dyn SystemValues,
    ) -> Result<Option<String>, IdentifierError> {
        match self.current_value(kind, bundle_id, profile_id)? {
            Resolution::Spoofed(value) => Ok(Some(value)),
            Resolution::Passthrough => Ok(system.system_value(kind, bundle_id)),
        }
    }

    /// Resolve against whichever profile is current. Passthrough when none is.
    pub fn resolve(&self, kind: IdentifierKind, bundle_id: &str) -> Result<Resolution, IdentifierError> {
        let guard = self.context.read();
        match guard.profile_id() {
            Some(profile_id) => self.current_value(kind, bundle_id, profile_id),
            None => Ok(Resolution::Passthrough),
        }
    }

    pub fn is_enabled(&self, kind: IdentifierKind, profile_id: &str) -> Result<bool, IdentifierError> {
        self.note(self.with_document(profile_id, |doc| doc.is_enabled(kind)))
    }

    /// Toggle spoofing for `kind`. Stored values survive a disable.
    pub fn set_enabled(
        &self,
        kind: IdentifierKind,
        profile_id: &str,
        enabled: bool,
    ) -> Result<(), IdentifierError> {
        let result = self.mutate(profile_id, |doc| {
            if doc.is_enabled(kind) == enabled {
                return Ok(((), false));
            }
            doc.enabled.insert(kind.as_str().to_string(), enabled);
            Ok(((), true))
        });
        if result.is_ok() {
            info!(
                "{} {} for profile {}",
                if enabled { "Enabled" } else { "Disabled" },
                kind,
                profile_id
            );
        }
        self.note(result)
    }

    /// Give every enabled kind a new value, for the global owner and every
    /// app that already has values. Returns how many values changed.
    pub fn regenerate_all(&self, profile_id: &str) -> Result<usize, IdentifierError> {
        let result = self.mutate(profile_id, |doc| {
            let mut changed = 0;
            let enabled: Vec<IdentifierKind> = IdentifierKind::ALL
                .into_iter()
                .filter(|k| doc.is_enabled(*k))
                .collect();
            for kind in enabled {
                let owners: Vec<String> = match kind.scope() {
                    Scope::Global => vec![String::new()],
                    Scope::App => doc.apps.keys().cloned().collect(),
                };
                for owner in owners {
                    let previous = doc.record(kind, &owner).map(|r| r.value.clone());
                    let value = self.fresh_value(kind, 2, previous.as_deref())?;
                    doc.set_record(kind, &owner, value);
                    changed += 1;
                }
            }
            Ok((changed, true))
        });
        if let Ok(changed) = result {
            info!("Regenerated {} identifiers for profile {}", changed, profile_id);
        }
        self.note(result)
    }

    /// Replace one value, enabled or not.
    pub fn regenerate(
        &self,
        kind: IdentifierKind,
        bundle_id: &str,
        profile_id: &str,
    ) -> Result<String, IdentifierError> {
        let result = self.mutate(profile_id, |doc| {
            let previous = doc.record(kind, bundle_id).map(|r| r.value.clone());
            let value = self.fresh_value(kind, 2, previous.as_deref())?;
            doc.set_record(kind, bundle_id, value.clone());
            Ok((value, true))
        });
        self.note(result)
    }

    /// Store an operator-chosen value. It must pass the kind's validator.
    pub fn set_value(
        &self,
        kind: IdentifierKind,
        bundle_id: &str,
        profile_id: &str,
        value: &str,
    ) -> Result<(), IdentifierError> {
        if !validate(kind, value) {
            return self.note(Err(IdentifierError::InvalidGeneratedValue {
                kind,
                value: value.to_string(),
            }));
        }
        let result = self.mutate(profile_id, |doc| {
            doc.set_record(kind, bundle_id, value.to_string());
            Ok(((), true))
        });
        self.note(result)
    }

    /// Enabled flag and stored value of every kind, as seen from `bundle_id`.
    pub fn status(&self, bundle_id: &str, profile_id: &str) -> Result<Vec<KindStatus>, IdentifierError> {
        self.note(self.with_document(profile_id, |doc| {
            IdentifierKind::ALL
                .into_iter()
                .map(|kind| KindStatus {
                    kind,
                    enabled: doc.is_enabled(kind),
                    value: doc.record(kind, bundle_id).map(|r| r.value.clone()),
                })
                .collect()
        }))
    }

    /// The spoofed OS version, or `None` while the kind is disabled.
    pub fn os_version(&self, profile_id: &str) -> Result<Option<OsVersion>, IdentifierError> {
        match self.current_value(IdentifierKind::OsVersion, "", profile_id)? {
            Resolution::Spoofed(value) => value.parse().map(Some),
            Resolution::Passthrough => Ok(None),
        }
    }

    /// Drop every cached document and load the new profile's one.
    pub fn profile_did_change(&self, profile_id: &str) -> Result<(), IdentifierError> {
        self.cache.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.note(self.with_document(profile_id, |_| ()))?;
        debug!("Identifier cache reloaded for profile {}", profile_id);
        Ok(())
    }

    /// Forget a profile and delete its identifier document.
    pub fn remove_profile(&self, profile_id: &str) -> Result<(), IdentifierError> {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(profile_id);

        for name in [DOCUMENT_FILE, LOCK_FILE] {
            let path = self.profile_dir(profile_id).join(name);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return self.note(Err(IdentifierError::PersistenceWriteFailed { path, source }));
                }
            }
        }
        Ok(())
    }

    /// Message of the most recent failed operation.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn profile_dir(&self, profile_id: &str) -> PathBuf {
        self.root.join("profiles").join(profile_id)
    }

    fn note<T>(&self, result: Result<T, IdentifierError>) -> Result<T, IdentifierError> {
        if let Err(e) = &result {
            *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(e.to_string());
        }
        result
    }

    /// Generate a valid value that differs from `previous` where possible.
    ///
    /// `budget` is how many consecutive validation failures are tolerated.
    fn fresh_value(
        &self,
        kind: IdentifierKind,
        budget: usize,
        previous: Option<&str>,
    ) -> Result<String, IdentifierError> {
        let mut failures = 0;
        let mut repeated = None;

        for _ in 0..MAX_DISTINCT_ATTEMPTS {
            let value = self.generator.generate(kind);
            if !validate(kind, &value) {
                warn!("Generated {} failed validation: '{}'", kind, value);
                failures += 1;
                if failures >= budget {
                    return Err(IdentifierError::RepeatedValidationFailure { kind });
                }
                continue;
            }
            failures = 0;

            if previous == Some(value.as_str()) {
                repeated = Some(value);
                continue;
            }
            return Ok(value);
        }

        debug!("No distinct {} found, keeping the previous value", kind);
        repeated.ok_or(IdentifierError::RepeatedValidationFailure { kind })
    }

    fn load(&self, profile_id: &str) -> Result<ProfileDocument, IdentifierError> {
        let path = self.document_path(profile_id);
        match persist::read_json::<ProfileDocument>(&path) {
            Ok(Loaded::Parsed(document)) => Ok(document),
            Ok(Loaded::Missing) => Ok(ProfileDocument::default()),
            Ok(Loaded::Unparseable(reason)) => match persist::quarantine(&path) {
                Ok(moved) => {
                    warn!(
                        "Identifier store {} is unreadable ({}), moved to {}",
                        path.display(),
                        reason,
                        moved.display()
                    );
                    Ok(ProfileDocument::default())
                }
                Err(e) => Err(IdentifierError::CorruptStore {
                    path,
                    reason: format!("{}; moving it aside failed: {}", reason, e),
                }),
            },
            Err(e) => Err(IdentifierError::CorruptStore {
                path,
                reason: e.to_string(),
            }),
        }
    }

    /// Run `f` against the cached document, reloading it when the file
    /// was replaced on disk since it was cached.
    fn with_document<R>(
        &self,
        profile_id: &str,
        f: impl FnOnce(&ProfileDocument) -> R,
    ) -> Result<R, IdentifierError> {
        let path = self.document_path(profile_id);
        let stamp = FileStamp::of(&path);

        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = cache.get(profile_id) {
                if entry.stamp == stamp {
                    return Ok(f(&entry.document));
                }
            }
        }

        let document = self.load(profile_id)?;
        let stamp = FileStamp::of(&path);
        let result = f(&document);
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(profile_id.to_string(), CachedDocument { document, stamp });
        Ok(result)
    }

    /// Read-modify-write under the profile's lock file. `f` returns whether
    /// the document changed; a failed write leaves the cache untouched.
    fn mutate<R>(
        &self,
        profile_id: &str,
        f: impl FnOnce(&mut ProfileDocument) -> Result<(R, bool), IdentifierError>,
    ) -> Result<R, IdentifierError> {
        let lock_path = self.profile_dir(profile_id).join(LOCK_FILE);
        let _lock = LockFile::acquire(&lock_path).map_err(|source| {
            IdentifierError::PersistenceWriteFailed {
                path: lock_path.clone(),
                source,
            }
        })?;

        let mut document = self.load(profile_id)?;
        let (result, dirty) = f(&mut document)?;

        let path = self.document_path(profile_id);
        if dirty {
            persist::write_json_atomic(&path, &document).map_err(|source| {
                IdentifierError::PersistenceWriteFailed {
                    path: path.clone(),
                    source,
                }
            })?;
        }

        let stamp = FileStamp::of(&path);
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(profile_id.to_string(), CachedDocument { document, stamp });
        Ok(result)
    }
}
