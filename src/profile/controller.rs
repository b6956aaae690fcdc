use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Profile, ProfileContext, new_profile_id, validate_profile_id};
use crate::error::ProfileError;
use crate::identifiers::{Generator, IdentifierStore, StandardGenerator};
use crate::lock::LockFile;
use crate::paths::PathTranslator;
use crate::persist::{self, Loaded};

const REGISTRY_FILE: &str = "profiles.json";
const REGISTRY_LOCK: &str = "profiles.lock";
const STATE_FILE: &str = "state.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Registry {
    #[serde(default)]
    profiles: Vec<Profile>,
}

/// Selection persisted across restarts.
#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    #[serde(skip_serializing_if = "Option::is_none")]
    current_profile: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
}

/// Owns the profile lifecycle and is the only writer of the current profile.
pub struct ProfileController<G: Generator = StandardGenerator> {
    root: PathBuf,
    context: Arc<ProfileContext>,
    translator: Arc<PathTranslator>,
    store: Arc<IdentifierStore<G>>,
}

impl<G: Generator> ProfileController<G> {
    pub fn new(
        root: impl Into<PathBuf>,
        context: Arc<ProfileContext>,
        translator: Arc<PathTranslator>,
        store: Arc<IdentifierStore<G>>,
    ) -> Self {
        Self {
            root: root.into(),
            context,
            translator,
            store,
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    pub fn current_profile_id(&self) -> Option<String> {
        self.context.current()
    }

    /// Create a profile with its directory tree and a full identifier set.
    /// A ULID is assigned when `id` is `None`.
    pub fn create_profile(&self, label: &str, id: Option<&str>) -> Result<Profile, ProfileError> {
        let id = id.map_or_else(new_profile_id, str::to_string);
        validate_profile_id(&id)?;

        let _lock = self.lock_registry()?;
        let mut registry = self.read_registry()?;
        if registry.profiles.iter().any(|p| p.id == id) {
            return Err(ProfileError::AlreadyExists(id));
        }

        let label = if label.is_empty() { id.as_str() } else { label };
        let profile = Profile::new(id.as_str(), label);
        registry.profiles.push(profile.clone());

        let created = self
            .translator
            .prepare_profile_directory(&id)
            .map_err(ProfileError::from)
            .and_then(|_| self.store.regenerate_all(&id).map_err(ProfileError::from))
            .and_then(|_| self.write_registry(&registry));
        if let Err(e) = created {
            self.discard_partial(&id);
            return Err(e);
        }

        info!("Created profile {} ({})", profile.id, profile.label);
        Ok(profile)
    }

    pub fn list_profiles(&self) -> Result<Vec<Profile>, ProfileError> {
        let mut profiles = self.read_registry()?.profiles;
        profiles.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(profiles)
    }

    pub fn profile(&self, id: &str) -> Result<Profile, ProfileError> {
        self.read_registry()?
            .profiles
            .into_iter()
            .find(|p| p.id == id)
            .ok_or_else(|| ProfileError::NotFound(id.to_string()))
    }

    /// Remove a profile, its identifiers and its storage. The current
    /// profile, in this process or persisted for the next one, is refused.
    pub fn delete_profile(&self, id: &str) -> Result<(), ProfileError> {
        validate_profile_id(id)?;

        let _lock = self.lock_registry()?;
        let current = self.context.current();
        let persisted = self.read_state()?.current_profile;
        if current.as_deref() == Some(id) || persisted.as_deref() == Some(id) {
            return Err(ProfileError::DeleteCurrent(id.to_string()));
        }

        let mut registry = self.read_registry()?;
        let before = registry.profiles.len();
        registry.profiles.retain(|p| p.id != id);
        if registry.profiles.len() == before {
            return Err(ProfileError::NotFound(id.to_string()));
        }

        self.store.remove_profile(id)?;
        self.translator.remove_profile(id);

        let dir = self.translator.profile_base_path(id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(ProfileError::Persistence { path: dir, source }),
        }

        self.write_registry(&registry)?;
        info!("Deleted profile {}", id);
        Ok(())
    }

    /// Make `id` current, creating it first when unknown.
    ///
    /// Caches are invalidated and the directory tree prepared while the
    /// context is write-locked; on any failure the previous profile stays
    /// current. Returns `false` when `id` was already current.
    ///
    /// Lock order is the registry lock, then the context.
    pub fn switch_profile(&self, id: &str) -> Result<bool, ProfileError> {
        validate_profile_id(id)?;

        if self.context.current().as_deref() == Some(id) {
            return Ok(false);
        }

        match self.profile(id) {
            Ok(_) => {}
            Err(ProfileError::NotFound(_)) => {
                self.create_profile(id, Some(id))?;
            }
            Err(e) => return Err(e),
        }

        let _lock = self.lock_registry()?;
        // Deleted by someone else since the check above.
        if !self.read_registry()?.profiles.iter().any(|p| p.id == id) {
            return Err(ProfileError::NotFound(id.to_string()));
        }
        self.context.publish(id, |id| {
            self.translator.profile_did_change(id)?;
            self.store.profile_did_change(id)?;
            self.write_state(Some(id))
        })
    }

    /// Reactivate the profile selected by a previous process, if any,
    /// leaving `state.json` as it is.
    pub fn resume(&self) -> Result<Option<String>, ProfileError> {
        let Some(id) = self.read_state()?.current_profile else {
            return Ok(None);
        };

        match self.profile(&id) {
            Ok(_) => {
                self.context.publish(&id, |id| {
                    self.translator.profile_did_change(id)?;
                    self.store.profile_did_change(id).map_err(ProfileError::from)
                })?;
                Ok(Some(id))
            }
            Err(ProfileError::NotFound(_)) => {
                warn!("Persisted profile {} no longer exists, staying uninitialized", id);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// The selection persisted in `state.json`.
    pub fn persisted_profile_id(&self) -> Result<Option<String>, ProfileError> {
        Ok(self.read_state()?.current_profile)
    }

    /// Best-effort removal of a profile whose creation failed halfway.
    fn discard_partial(&self, id: &str) {
        if let Err(e) = self.store.remove_profile(id) {
            warn!("Failed to remove identifiers of half-created profile {}: {}", id, e);
        }
        self.translator.remove_profile(id);
        let dir = self.translator.profile_base_path(id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", dir.display(), e),
        }
    }

    /// Guards `profiles.json` and `state.json`.
    fn lock_registry(&self) -> Result<LockFile, ProfileError> {
        let path = self.root.join(REGISTRY_LOCK);
        LockFile::acquire(&path).map_err(|source| ProfileError::Persistence { path, source })
    }

    fn read_registry(&self) -> Result<Registry, ProfileError> {
        read_document(&self.registry_path())
    }

    fn write_registry(&self, registry: &Registry) -> Result<(), ProfileError> {
        let path = self.registry_path();
        persist::write_json_atomic(&path, registry)
            .map_err(|source| ProfileError::Persistence { path, source })
    }

    fn read_state(&self) -> Result<State, ProfileError> {
        read_document(&self.state_path())
    }

    fn write_state(&self, current: Option<&str>) -> Result<(), ProfileError> {
        let state = State {
            current_profile: current.map(str::to_string),
            updated_at: Some(Utc::now()),
        };
        let path = self.state_path();
        persist::write_json_atomic(&path, &state)
            .map_err(|source| ProfileError::Persistence { path, source })
    }
}

fn read_document<T: Default + serde::de::DeserializeOwned>(path: &Path) -> Result<T, ProfileError> {
    match persist::read_json(path) {
        Ok(Loaded::Parsed(value)) => Ok(value),
        Ok(Loaded::Missing) => Ok(T::default()),
        Ok(Loaded::Unparseable(reason)) => Err(ProfileError::CorruptRegistry {
            path: path.to_path_buf(),
            reason,
        }),
        Err(source) => Err(ProfileError::Persistence {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::{IdentifierKind, Resolution};
    use tempfile::TempDir;

    struct Harness {
        context: Arc<ProfileContext>,
        translator: Arc<PathTranslator>,
        store: Arc<IdentifierStore>,
        controller: ProfileController,
    }

    fn harness(temp_dir: &TempDir) -> Harness {
        let context = Arc::new(ProfileContext::new());
        let translator = Arc::new(PathTranslator::new(temp_dir.path(), context.clone()));
        let store = Arc::new(IdentifierStore::new(temp_dir.path(), context.clone()));
        let controller = ProfileController::new(
            temp_dir.path(),
            context.clone(),
            translator.clone(),
            store.clone(),
        );
        Harness {
            context,
            translator,
            store,
            controller,
        }
    }

    #[test]
    fn create_builds_tree_and_identifiers() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(&temp_dir);

        let profile = h.controller.create_profile("Work", None).unwrap();
        assert_eq!(profile.label, "Work");
        assert_eq!(profile.id.len(), 26);
        assert!(h.translator.profile_base_path(&profile.id).join("apps").is_dir());
        assert!(h.store.document_path(&profile.id).exists());

        let listed = h.controller.list_profiles().unwrap();
        assert_eq!(listed, vec![profile.clone()]);
        assert_eq!(h.controller.profile(&profile.id).unwrap(), profile);
    }

    #[test]
    fn duplicate_and_invalid_ids_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(&temp_dir);
        h.controller.create_profile("one", Some("p1")).unwrap();

        assert!(matches!(
            h.controller.create_profile("again", Some("p1")),
            Err(ProfileError::AlreadyExists(_))
        ));
        assert!(matches!(
            h.controller.create_profile("bad", Some("../etc")),
            Err(ProfileError::InvalidId(_))
        ));
        assert!(matches!(
            h.controller.profile("missing"),
            Err(ProfileError::NotFound(_))
        ));
    }

    #[test]
    fn switch_publishes_and_persists() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(&temp_dir);
        h.controller.create_profile("one", Some("p1")).unwrap();

        assert!(h.controller.switch_profile("p1").unwrap());
        assert_eq!(h.context.current().as_deref(), Some("p1"));
        assert_eq!(h.context.version(), 1);
        assert_eq!(h.controller.persisted_profile_id().unwrap().as_deref(), Some("p1"));

        // Switching to the current profile changes nothing.
        assert!(!h.controller.switch_profile("p1").unwrap());
        assert_eq!(h.context.version(), 1);
    }

    #[test]
    fn switch_to_unknown_profile_creates_it() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(&temp_dir);
        h.controller.switch_profile("fresh").unwrap();
        assert_eq!(h.controller.profile("fresh").unwrap().label, "fresh");
        assert!(matches!(
            h.store.resolve(IdentifierKind::Idfa, "app").unwrap(),
            Resolution::Spoofed(_)
        ));
    }

    #[test]
    fn failed_switch_keeps_previous_profile() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(&temp_dir);
        h.controller.create_profile("one", Some("p1")).unwrap();
        h.controller.create_profile("two", Some("p2")).unwrap();
        h.controller.switch_profile("p1").unwrap();

        // Block p2's apps directory with a file.
        let apps = h.translator.profile_base_path("p2").join("apps");
        std::fs::remove_dir_all(&apps).unwrap();
        std::fs::write(&apps, b"").unwrap();

        assert!(h.controller.switch_profile("p2").is_err());
        assert_eq!(h.context.current().as_deref(), Some("p1"));
        assert_eq!(h.controller.persisted_profile_id().unwrap().as_deref(), Some("p1"));
    }

    #[test]
    fn delete_refuses_current_and_removes_others() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(&temp_dir);
        h.controller.create_profile("one", Some("p1")).unwrap();
        h.controller.create_profile("two", Some("p2")).unwrap();
        h.controller.switch_profile("p1").unwrap();

        assert!(matches!(
            h.controller.delete_profile("p1"),
            Err(ProfileError::DeleteCurrent(_))
        ));

        h.controller.delete_profile("p2").unwrap();
        assert!(!h.translator.profile_base_path("p2").exists());
        assert_eq!(h.controller.list_profiles().unwrap().len(), 1);
        assert!(matches!(
            h.controller.delete_profile("p2"),
            Err(ProfileError::NotFound(_))
        ));
    }

    #[test]
    fn resume_restores_persisted_selection() {
        let temp_dir = TempDir::new().unwrap();
        {
            let h = harness(&temp_dir);
            h.controller.create_profile("one", Some("p1")).unwrap();
            h.controller.switch_profile("p1").unwrap();
        }

        let h = harness(&temp_dir);
        assert_eq!(h.context.current(), None);
        assert_eq!(h.controller.resume().unwrap().as_deref(), Some("p1"));
        assert_eq!(h.context.current().as_deref(), Some("p1"));
    }

    #[test]
    fn failed_create_leaves_nothing_behind() {
        struct Garbage;
        impl Generator for Garbage {
            fn generate(&self, _kind: IdentifierKind) -> String {
                "garbage".to_string()
            }
        }

        let temp_dir = TempDir::new().unwrap();
        let context = Arc::new(ProfileContext::new());
        let translator = Arc::new(PathTranslator::new(temp_dir.path(), context.clone()));
        let store = Arc::new(IdentifierStore::with_generator(temp_dir.path(), context.clone(), Garbage));
        let controller = ProfileController::new(temp_dir.path(), context, translator.clone(), store);

        assert!(matches!(
            controller.create_profile("one", Some("p1")),
            Err(ProfileError::Identifier(_))
        ));
        assert!(!translator.profile_base_path("p1").exists());
        assert!(controller.list_profiles().unwrap().is_empty());
    }

    #[test]
    fn delete_refuses_profile_selected_by_another_instance() {
        let temp_dir = TempDir::new().unwrap();
        let first = harness(&temp_dir);
        first.controller.create_profile("one", Some("p1")).unwrap();
        first.controller.switch_profile("p1").unwrap();

        let second = harness(&temp_dir);
        assert_eq!(second.context.current(), None);
        assert!(matches!(
            second.controller.delete_profile("p1"),
            Err(ProfileError::DeleteCurrent(_))
        ));
        assert!(second.translator.profile_base_path("p1").exists());
    }

    #[test]
    fn concurrent_switches_keep_state_readable() {
        let temp_dir = TempDir::new().unwrap();
        let a = harness(&temp_dir);
        let b = harness(&temp_dir);
        a.controller.create_profile("one", Some("p1")).unwrap();
        a.controller.create_profile("two", Some("p2")).unwrap();

        std::thread::scope(|scope| {
            for h in [&a, &b] {
                scope.spawn(move || {
                    for i in 0..20 {
                        let id = if i % 2 == 0 { "p1" } else { "p2" };
                        h.controller.switch_profile(id).unwrap();
                    }
                });
            }
        });

        let persisted = a.controller.persisted_profile_id().unwrap();
        assert!(matches!(persisted.as_deref(), Some("p1" | "p2")));
        assert!(!temp_dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn corrupt_registry_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let h = harness(&temp_dir);
        std::fs::write(h.controller.registry_path(), "[oops").unwrap();
        assert!(matches!(
            h.controller.list_profiles(),
            Err(ProfileError::CorruptRegistry { .. })
        ));
    }
}
