//! Error types for hooking, path virtualization, identifiers and profiles.
//!
//! Hook errors are fatal only to the single hook attempt: callers log them and
//! leave the target unpatched. Path and identifier errors surface to the
//! caller so that an unverified location or an invalid value is never used.

use std::path::PathBuf;

use thiserror::Error;

use crate::identifiers::IdentifierKind;

/// Failure to install or remove an inline hook.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    #[error("function at {target:#x} ends after {available} bytes, {required} needed for the branch")]
    PrologueTooShort {
        target: usize,
        available: usize,
        required: usize,
    },

    #[error("memory protection change refused for {addr:#x} (+{len}): errno {errno}")]
    ProtectionDenied { addr: usize, len: usize, errno: i32 },

    #[error("target {0:#x} is already hooked")]
    AlreadyHooked(usize),

    #[error("target {0:#x} is not hooked")]
    TargetNotHooked(usize),

    #[error("instruction {insn:#x} at {addr:#x} cannot be relocated into a trampoline")]
    UnsupportedInstruction { addr: usize, insn: u64 },

    #[error("failed to allocate executable memory: errno {0}")]
    AllocationFailed(i32),

    #[error("inline hooking is not supported on this architecture")]
    UnsupportedArchitecture,

    #[error("null target or replacement address")]
    NullAddress,
}

/// Failure to map a path into a profile's storage.
#[derive(Error, Debug)]
pub enum PathError {
    #[error("'{0}' is not inside a recognized app container")]
    UnrecognizedContainerRoot(PathBuf),

    #[error("failed to create directory '{path}': {source}")]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure to produce, load or store an identifier value.
#[derive(Error, Debug)]
pub enum IdentifierError {
    #[error("generated value for {kind} failed validation: '{value}'")]
    InvalidGeneratedValue { kind: IdentifierKind, value: String },

    #[error("failed to persist identifiers to '{path}': {source}")]
    PersistenceWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{kind} failed validation twice in a row; disable it until the generator is fixed")]
    RepeatedValidationFailure { kind: IdentifierKind },

    #[error("identifier store '{path}' is unreadable: {reason}")]
    CorruptStore { path: PathBuf, reason: String },

    #[error("unknown identifier type '{0}'")]
    UnknownKind(String),
}

/// Failure in profile lifecycle management.
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("profile '{0}' does not exist")]
    NotFound(String),

    #[error("profile '{0}' already exists")]
    AlreadyExists(String),

    #[error("invalid profile id '{0}': use 1-64 characters from [A-Za-z0-9_-]")]
    InvalidId(String),

    #[error("cannot delete '{0}' while it is the current profile")]
    DeleteCurrent(String),

    #[error("no profile is active")]
    NotActive,

    #[error("failed to persist profile state to '{path}': {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("profile registry '{path}' is unreadable: {reason}")]
    CorruptRegistry { path: PathBuf, reason: String },

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Identifier(#[from] IdentifierError),
}

/// Top-level error for the [`Runtime`](crate::Runtime) facade.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Identifier(#[from] IdentifierError),

    #[error(transparent)]
    Profile(#[from] ProfileError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
