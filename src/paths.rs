//! Redirection of app container paths into per-profile storage.
//!
//! An app's sandbox lives under one of a few container roots, each followed
//! by a UUID directory. A recognized path is rewritten to
//! `{root}/profiles/{profile}/apps/{bundle}/{kind}/{rest}`; anything else is
//! left alone.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::PathError;
use crate::profile::ProfileContext;

/// Prefix of jailbreak-owned files on rootless installs.
pub const ROOTLESS_PREFIX: &str = "/var/jb";

/// Where jailbreak-owned files live on this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallLayout {
    Rootful,
    Rootless,
}

impl InstallLayout {
    pub fn detect() -> Self {
        if Path::new(ROOTLESS_PREFIX).is_dir() {
            InstallLayout::Rootless
        } else {
            InstallLayout::Rootful
        }
    }

    /// Detected on first use, fixed for the life of the process.
    pub fn current() -> Self {
        static LAYOUT: OnceLock<InstallLayout> = OnceLock::new();
        *LAYOUT.get_or_init(|| {
            let layout = InstallLayout::detect();
            debug!("Install layout: {:?}", layout);
            layout
        })
    }

    /// Prefix `path` with [`ROOTLESS_PREFIX`] when this layout needs it.
    /// User data under `/var/mobile` and relative paths are never prefixed.
    pub fn translate(self, path: &Path) -> PathBuf {
        let needs_prefix = self == InstallLayout::Rootless
            && path.is_absolute()
            && !path.starts_with(ROOTLESS_PREFIX)
            && !path.starts_with("/var/mobile")
            && !path.starts_with("/private/var/mobile");

        if !needs_prefix {
            return path.to_path_buf();
        }
        let relative = path.strip_prefix("/").unwrap_or(path);
        Path::new(ROOTLESS_PREFIX).join(relative)
    }
}

/// [`InstallLayout::translate`] with the process's detected layout.
pub fn translate_path_for_environment(path: impl AsRef<Path>) -> PathBuf {
    InstallLayout::current().translate(path.as_ref())
}

/// Which part of an app's sandbox a path belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    Data,
    Bundle,
    Group(String),
}

impl ContainerKind {
    /// Directory under the app's base path.
    pub fn dir_name(&self) -> PathBuf {
        match self {
            ContainerKind::Data => PathBuf::from("data"),
            ContainerKind::Bundle => PathBuf::from("bundle"),
            ContainerKind::Group(uuid) => Path::new("group").join(uuid),
        }
    }
}

struct ContainerRoot {
    prefix: &'static str,
    /// The signed `*.app` directory sits beside the data in these roots.
    excludes_app_dir: bool,
    kind: fn(&str) -> ContainerKind,
}

const CONTAINER_ROOTS: &[ContainerRoot] = &[
    ContainerRoot {
        prefix: "/var/mobile/Containers/Data/Application",
        excludes_app_dir: false,
        kind: |_| ContainerKind::Data,
    },
    ContainerRoot {
        prefix: "/var/mobile/Containers/Bundle/Application",
        excludes_app_dir: true,
        kind: |_| ContainerKind::Bundle,
    },
    ContainerRoot {
        prefix: "/var/mobile/Containers/Shared/AppGroup",
        excludes_app_dir: false,
        kind: |uuid| ContainerKind::Group(uuid.to_string()),
    },
    ContainerRoot {
        prefix: "/var/mobile/Applications",
        excludes_app_dir: true,
        kind: |_| ContainerKind::Data,
    },
];

/// Apple apps that always see the real filesystem.
const SYSTEM_APPS: &[&str] = &[
    "com.apple.springboard",
    "com.apple.backboardd",
    "com.apple.Preferences",
    "com.apple.mobilesafari",
    "com.apple.MobileSMS",
    "com.apple.mobilephone",
    "com.apple.mobilemail",
    "com.apple.mobileslideshow",
    "com.apple.camera",
    "com.apple.AppStore",
    "com.apple.Maps",
    "com.apple.mobilenotes",
    "com.apple.MobileAddressBook",
    "com.apple.mobilecal",
    "com.apple.Health",
    "com.apple.Passbook",
    "com.apple.findmy",
    "com.apple.DocumentsApp",
    "com.apple.weather",
    "com.apple.mobiletimer",
];

/// Hyphenated 8-4-4-4-12 form, either case.
fn is_container_uuid(s: &str) -> bool {
    s.len() == 36 && Uuid::try_parse(s).is_ok()
}

/// Split a container path into its kind and the part below the UUID directory.
fn classify(path: &Path) -> Option<(ContainerKind, PathBuf)> {
    if !path.is_absolute() || path.components().any(|c| c == Component::ParentDir) {
        return None;
    }
    let normalized;
    let path = match path.strip_prefix("/private") {
        Ok(rest) => {
            normalized = Path::new("/").join(rest);
            normalized.as_path()
        }
        Err(_) => path,
    };

    for root in CONTAINER_ROOTS {
        let Ok(rest) = path.strip_prefix(root.prefix) else {
            continue;
        };
        let mut components = rest.components();
        let uuid = components.next()?.as_os_str().to_str()?;
        if !is_container_uuid(uuid) {
            return None;
        }
        let rest: PathBuf = components.collect();

        if root.excludes_app_dir {
            let first = rest.components().next().and_then(|c| c.as_os_str().to_str());
            if first.is_some_and(|name| name.ends_with(".app")) {
                return None;
            }
        }
        return Some(((root.kind)(uuid), rest));
    }
    None
}

pub struct PathTranslator {
    root: PathBuf,
    context: Arc<ProfileContext>,
    extra_system_apps: HashSet<String>,
    /// Kind directories known to exist, per profile.
    prepared: RwLock<HashMap<String, HashSet<PathBuf>>>,
}

impl PathTranslator {
    pub fn new(root: impl Into<PathBuf>, context: Arc<ProfileContext>) -> Self {
        Self {
            root: root.into(),
            context,
            extra_system_apps: HashSet::new(),
            prepared: RwLock::new(HashMap::new()),
        }
    }

    /// Also treat `bundles` as system apps.
    pub fn with_system_apps<I, S>(mut self, bundles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_system_apps.extend(bundles.into_iter().map(Into::into));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.root.join("profiles")
    }

    pub fn profile_base_path(&self, profile_id: &str) -> PathBuf {
        self.profiles_dir().join(profile_id)
    }

    pub fn app_base_path(&self, profile_id: &str, bundle_id: &str) -> PathBuf {
        self.profile_base_path(profile_id).join("apps").join(bundle_id)
    }

    pub fn app_data_path(&self, bundle_id: &str, profile_id: &str) -> PathBuf {
        self.app_base_path(profile_id, bundle_id).join("data")
    }

    pub fn is_system_app(&self, bundle_id: &str) -> bool {
        SYSTEM_APPS.contains(&bundle_id) || self.extra_system_apps.contains(bundle_id)
    }

    /// True when `path` belongs to `bundle_id`'s sandbox and may be redirected.
    pub fn is_path_redirectable(&self, path: &Path, bundle_id: &str) -> bool {
        is_safe_component(bundle_id)
            && !self.is_system_app(bundle_id)
            && !path.starts_with(self.profiles_dir())
            && classify(path).is_some()
    }

    /// Where `path` lives inside `profile_id`, without touching the disk.
    pub fn physical_path(
        &self,
        path: &Path,
        bundle_id: &str,
        profile_id: &str,
    ) -> Result<PathBuf, PathError> {
        let (kind, rest) =
            classify(path).ok_or_else(|| PathError::UnrecognizedContainerRoot(path.to_path_buf()))?;
        Ok(self
            .app_base_path(profile_id, bundle_id)
            .join(kind.dir_name())
            .join(rest))
    }

    /// Rewrite `path` into `profile_id`'s storage, creating the container
    /// kind directory on first use. Non-redirectable paths come back as-is.
    pub fn translate_path(
        &self,
        path: &Path,
        bundle_id: &str,
        profile_id: &str,
    ) -> Result<PathBuf, PathError> {
        if !self.is_path_redirectable(path, bundle_id) {
            return Ok(path.to_path_buf());
        }

        let (kind, rest) =
            classify(path).ok_or_else(|| PathError::UnrecognizedContainerRoot(path.to_path_buf()))?;
        let kind_dir = self.app_base_path(profile_id, bundle_id).join(kind.dir_name());
        self.ensure_dir(profile_id, &kind_dir)?;

        let translated = kind_dir.join(rest);
        debug!("Redirected {} -> {}", path.display(), translated.display());
        Ok(translated)
    }

    /// Translate against whichever profile is current. Unchanged when none is.
    pub fn redirect(&self, path: &Path, bundle_id: &str) -> Result<PathBuf, PathError> {
        let guard = self.context.read();
        match guard.profile_id() {
            Some(profile_id) => self.translate_path(path, bundle_id, profile_id),
            None => Ok(path.to_path_buf()),
        }
    }

    /// Forget prepared directories and set up the new profile's tree.
    pub fn profile_did_change(&self, profile_id: &str) -> Result<(), PathError> {
        self.prepared
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.prepare_profile_directory(profile_id)
    }

    pub fn prepare_profile_directory(&self, profile_id: &str) -> Result<(), PathError> {
        let apps = self.profile_base_path(profile_id).join("apps");
        std::fs::create_dir_all(&apps).map_err(|source| PathError::DirectoryCreationFailed {
            path: apps.clone(),
            source,
        })?;
        info!("Prepared profile directory {}", apps.display());
        Ok(())
    }

    pub fn remove_profile(&self, profile_id: &str) {
        self.prepared
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(profile_id);
    }

    fn ensure_dir(&self, profile_id: &str, dir: &Path) -> Result<(), PathError> {
        let known = self
            .prepared
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(profile_id)
            .is_some_and(|dirs| dirs.contains(dir));
        if known {
            return Ok(());
        }

        std::fs::create_dir_all(dir).map_err(|source| PathError::DirectoryCreationFailed {
            path: dir.to_path_buf(),
            source,
        })?;
        self.prepared
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(profile_id.to_string())
            .or_default()
            .insert(dir.to_path_buf());
        Ok(())
    }
}

/// A bundle id usable as one directory name.
fn is_safe_component(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\0')
}
