//! Masque - per-profile device identities for hooked applications
//!
//! This library keeps several isolated "profiles" of an app side by side:
//! each profile has its own set of device identifiers and its own copy of
//! the app's container storage. The injected shim (`masque-shim`) patches
//! filesystem and identity functions in the host process and answers them
//! from the current profile.

pub mod bindings;
pub mod config;
pub mod error;
pub mod hook;
pub mod identifiers;
pub mod lock;
pub mod paths;
pub mod persist;
pub mod profile;
pub mod runtime;

// Re-export commonly used types
pub use bindings::{Binding, BindingRegistry, LibloadingResolver, ReentrancyGuard, SymbolResolver};
pub use config::Config;
pub use error::{Error, HookError, IdentifierError, PathError, ProfileError, Result};
pub use hook::HookEngine;
pub use identifiers::{DeviceModel, IdentifierKind, IdentifierStore, OsVersion, Resolution, WifiInfo};
pub use paths::{InstallLayout, PathTranslator, translate_path_for_environment};
pub use profile::{Profile, ProfileContext, ProfileController};
pub use runtime::Runtime;
