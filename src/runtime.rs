//! One-stop facade over profiles, identifiers and path translation, bound
//! to a single host application.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::error::{ProfileError, Result};
use crate::identifiers::{HostSystem, IdentifierKind, IdentifierStore, KindStatus, Resolution, SystemValues};
use crate::paths::PathTranslator;
use crate::profile::{Profile, ProfileContext, ProfileController};

pub struct Runtime {
    bundle_id: String,
    context: Arc<ProfileContext>,
    translator: Arc<PathTranslator>,
    store: Arc<IdentifierStore>,
    controller: ProfileController,
    system: Box<dyn SystemValues>,
}

impl Runtime {
    pub fn new(config: &Config) -> Self {
        Self::with_system(config, HostSystem)
    }

    pub fn with_system(config: &Config, system: impl SystemValues + 'static) -> Self {
        let context = Arc::new(ProfileContext::new());
        let translator = Arc::new(
            PathTranslator::new(&config.root, context.clone())
                .with_system_apps(config.system_apps.iter().cloned()),
        );
        let store = Arc::new(IdentifierStore::new(&config.root, context.clone()));
        let controller =
            ProfileController::new(&config.root, context.clone(), translator.clone(), store.clone());

        Self {
            bundle_id: config.bundle_id.clone(),
            context,
            translator,
            store,
            controller,
            system: Box::new(system),
        }
    }

    /// Build a runtime and reactivate the previously selected profile.
    pub fn start(config: &Config) -> Result<Self> {
        let runtime = Self::new(config);
        match runtime.controller.resume()? {
            Some(id) => info!("Resumed profile {} for {}", id, runtime.bundle_id),
            None => info!("No profile selected for {}", runtime.bundle_id),
        }
        Ok(runtime)
    }

    pub fn bundle_id(&self) -> &str {
        &self.bundle_id
    }

    pub fn context(&self) -> &Arc<ProfileContext> {
        &self.context
    }

    pub fn translator(&self) -> &PathTranslator {
        &self.translator
    }

    pub fn store(&self) -> &IdentifierStore {
        &self.store
    }

    pub fn controller(&self) -> &ProfileController {
        &self.controller
    }

    pub fn current_profile_id(&self) -> Option<String> {
        self.context.current()
    }

    /// Switch to `profile_id`. Returns `false` if it was already current.
    pub fn profile_did_change(&self, profile_id: &str) -> Result<bool> {
        Ok(self.controller.switch_profile(profile_id)?)
    }

    pub fn create_profile(&self, label: &str, id: Option<&str>) -> Result<Profile> {
        Ok(self.controller.create_profile(label, id)?)
    }

    pub fn list_profiles(&self) -> Result<Vec<Profile>> {
        Ok(self.controller.list_profiles()?)
    }

    pub fn delete_profile(&self, profile_id: &str) -> Result<()> {
        Ok(self.controller.delete_profile(profile_id)?)
    }

    pub fn is_identifier_enabled(&self, kind: IdentifierKind) -> Result<bool> {
        self.with_active(|id| Ok(self.store.is_enabled(kind, id)?))
    }

    pub fn set_identifier_enabled(&self, kind: IdentifierKind, enabled: bool) -> Result<()> {
        self.with_active(|id| Ok(self.store.set_enabled(kind, id, enabled)?))
    }

    /// The value the host app should see: spoofed when enabled and a
    /// profile is active, the real one otherwise.
    pub fn current_value_for_identifier(&self, kind: IdentifierKind) -> Result<Option<String>> {
        match self.store.resolve(kind, &self.bundle_id)? {
            Resolution::Spoofed(value) => Ok(Some(value)),
            Resolution::Passthrough => Ok(self.system.system_value(kind, &self.bundle_id)),
        }
    }

    pub fn regenerate_all_enabled_identifiers(&self) -> Result<usize> {
        self.with_active(|id| Ok(self.store.regenerate_all(id)?))
    }

    pub fn regenerate_identifier(&self, kind: IdentifierKind) -> Result<String> {
        self.with_active(|id| Ok(self.store.regenerate(kind, &self.bundle_id, id)?))
    }

    pub fn identifier_status(&self) -> Result<Vec<KindStatus>> {
        self.with_active(|id| Ok(self.store.status(&self.bundle_id, id)?))
    }

    pub fn app_data_path(&self, bundle_id: &str, profile_id: &str) -> PathBuf {
        self.translator.app_data_path(bundle_id, profile_id)
    }

    pub fn is_path_redirectable(&self, path: &Path, bundle_id: &str) -> bool {
        self.translator.is_path_redirectable(path, bundle_id)
    }

    /// Translate `path` for this runtime's app under the current profile.
    pub fn translate_path(&self, path: &Path) -> Result<PathBuf> {
        Ok(self.translator.redirect(path, &self.bundle_id)?)
    }

    /// Run `f` with the current profile id, read-locked for the duration.
    fn with_active<R>(&self, f: impl FnOnce(&str) -> Result<R>) -> Result<R> {
        let guard = self.context.read();
        let id = guard.profile_id().ok_or(ProfileError::NotActive)?;
        f(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tempfile::TempDir;

    struct FakeSystem;

    impl SystemValues for FakeSystem {
        fn system_value(&self, kind: IdentifierKind, _bundle_id: &str) -> Option<String> {
            (kind == IdentifierKind::DeviceName).then(|| "Real Device".to_string())
        }
    }

    fn runtime(temp_dir: &TempDir) -> Runtime {
        let config = Config {
            root: temp_dir.path().to_path_buf(),
            bundle_id: "com.example.app".to_string(),
            system_apps: Vec::new(),
        };
        Runtime::with_system(&config, FakeSystem)
    }

    #[test]
    fn inactive_runtime_passes_everything_through() {
        let temp_dir = TempDir::new().unwrap();
        let rt = runtime(&temp_dir);

        assert_eq!(rt.current_profile_id(), None);
        assert_eq!(
            rt.current_value_for_identifier(IdentifierKind::DeviceName).unwrap().as_deref(),
            Some("Real Device")
        );
        assert!(matches!(
            rt.is_identifier_enabled(IdentifierKind::Idfa),
            Err(Error::Profile(ProfileError::NotActive))
        ));

        let path = Path::new("/var/mobile/Containers/Data/Application/3F2504E0-4F89-41D3-9A0C-0305E82C3301/Documents");
        assert_eq!(rt.translate_path(path).unwrap(), path);
    }

    #[test]
    fn switching_profiles_changes_identity_and_storage() {
        let temp_dir = TempDir::new().unwrap();
        let rt = runtime(&temp_dir);
        let path = Path::new(
            "/var/mobile/Containers/Data/Application/3F2504E0-4F89-41D3-9A0C-0305E82C3301/Library/Preferences",
        );

        rt.create_profile("First", Some("p1")).unwrap();
        rt.create_profile("Second", Some("p2")).unwrap();

        assert!(rt.profile_did_change("p1").unwrap());
        let idfa_p1 = rt.current_value_for_identifier(IdentifierKind::Idfa).unwrap().unwrap();
        let path_p1 = rt.translate_path(path).unwrap();

        assert!(rt.profile_did_change("p2").unwrap());
        let idfa_p2 = rt.current_value_for_identifier(IdentifierKind::Idfa).unwrap().unwrap();
        assert_eq!(
            rt.translate_path(path).unwrap(),
            temp_dir
                .path()
                .join("profiles/p2/apps/com.example.app/data/Library/Preferences")
        );

        assert_ne!(idfa_p1, idfa_p2);
        assert!(path_p1.starts_with(temp_dir.path().join("profiles/p1")));
        assert_eq!(
            rt.app_data_path("com.example.app", "p2"),
            temp_dir.path().join("profiles/p2/apps/com.example.app/data")
        );
    }

    #[test]
    fn disabled_identifier_reports_real_value() {
        let temp_dir = TempDir::new().unwrap();
        let rt = runtime(&temp_dir);
        rt.profile_did_change("p1").unwrap();

        let spoofed = rt.current_value_for_identifier(IdentifierKind::DeviceName).unwrap().unwrap();
        assert_ne!(spoofed, "Real Device");

        rt.set_identifier_enabled(IdentifierKind::DeviceName, false).unwrap();
        assert!(!rt.is_identifier_enabled(IdentifierKind::DeviceName).unwrap());
        assert_eq!(
            rt.current_value_for_identifier(IdentifierKind::DeviceName).unwrap().as_deref(),
            Some("Real Device")
        );

        rt.set_identifier_enabled(IdentifierKind::DeviceName, true).unwrap();
        assert_eq!(
            rt.current_value_for_identifier(IdentifierKind::DeviceName).unwrap(),
            Some(spoofed)
        );
    }

    #[test]
    fn regenerate_all_changes_values() {
        let temp_dir = TempDir::new().unwrap();
        let rt = runtime(&temp_dir);
        rt.profile_did_change("p1").unwrap();

        let before = rt.current_value_for_identifier(IdentifierKind::Idfa).unwrap();
        assert!(rt.regenerate_all_enabled_identifiers().unwrap() > 0);
        assert_ne!(rt.current_value_for_identifier(IdentifierKind::Idfa).unwrap(), before);
    }

    #[test]
    fn start_resumes_previous_selection() {
        let temp_dir = TempDir::new().unwrap();
        runtime(&temp_dir).profile_did_change("p1").unwrap();

        let config = Config {
            root: temp_dir.path().to_path_buf(),
            bundle_id: "com.example.app".to_string(),
            system_apps: Vec::new(),
        };
        let rt = Runtime::start(&config).unwrap();
        assert_eq!(rt.current_profile_id().as_deref(), Some("p1"));
        assert!(rt.list_profiles().unwrap().iter().any(|p| p.id == "p1"));
    }
}
