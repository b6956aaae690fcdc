//! The process-wide "current profile" value.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard};

use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProfileState {
    #[default]
    Uninitialized,
    Active(String),
}

/// Versioned holder of the current profile.
///
/// Lookups hold a read guard for their whole duration, and a switch holds
/// the write guard while caches are invalidated, so no caller ever sees a
/// half-switched profile. Lock order is the registry lock file, then the
/// context, then any store or translator cache.
#[derive(Debug, Default)]
pub struct ProfileContext {
    state: RwLock<ProfileState>,
    version: AtomicU64,
}

/// Read access to the published profile, held for one lookup.
pub struct ProfileGuard<'a> {
    guard: RwLockReadGuard<'a, ProfileState>,
}

impl ProfileGuard<'_> {
    pub fn profile_id(&self) -> Option<&str> {
        match &*self.guard {
            ProfileState::Active(id) => Some(id),
            ProfileState::Uninitialized => None,
        }
    }
}

impl ProfileContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn with_active(profile_id: impl Into<String>) -> Self {
        Self {
            state: RwLock::new(ProfileState::Active(profile_id.into())),
            version: AtomicU64::new(1),
        }
    }

    pub fn read(&self) -> ProfileGuard<'_> {
        ProfileGuard {
            guard: self.state.read().unwrap_or_else(|e| e.into_inner()),
        }
    }

    pub fn state(&self) -> ProfileState {
        self.read().guard.clone()
    }

    pub fn current(&self) -> Option<String> {
        self.read().profile_id().map(str::to_string)
    }

    /// Incremented on every published switch.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Publish `profile_id` as current.
    ///
    /// `prepare` runs under the write lock before publication; if it fails,
    /// the previous state stays published. Returns `Ok(false)` without
    /// calling `prepare` when `profile_id` is already current.
    pub fn publish<E>(
        &self,
        profile_id: &str,
        prepare: impl FnOnce(&str) -> Result<(), E>,
    ) -> Result<bool, E> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if matches!(&*state, ProfileState::Active(current) if current == profile_id) {
            return Ok(false);
        }

        prepare(profile_id)?;

        let previous = std::mem::replace(&mut *state, ProfileState::Active(profile_id.to_string()));
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        info!(
            "Profile switched: {:?} -> {} (version {})",
            previous, profile_id, version
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn starts_uninitialized() {
        let ctx = ProfileContext::new();
        assert_eq!(ctx.state(), ProfileState::Uninitialized);
        assert_eq!(ctx.current(), None);
        assert_eq!(ctx.version(), 0);
    }

    #[test]
    fn publish_is_idempotent_for_same_profile() {
        let ctx = ProfileContext::new();
        let mut calls = 0;
        assert!(ctx.publish::<()>("p1", |_| {
            calls += 1;
            Ok(())
        })
        .unwrap());
        assert!(!ctx.publish::<()>("p1", |_| {
            calls += 1;
            Ok(())
        })
        .unwrap());
        assert_eq!(calls, 1);
        assert_eq!(ctx.version(), 1);
    }

    #[test]
    fn failed_prepare_keeps_previous_profile() {
        let ctx = ProfileContext::with_active("p1");
        let err = ctx.publish("p2", |_| Err("disk full")).unwrap_err();
        assert_eq!(err, "disk full");
        assert_eq!(ctx.current().as_deref(), Some("p1"));
        assert_eq!(ctx.version(), 1);
    }

    #[test]
    fn readers_never_see_a_torn_switch() {
        let ctx = Arc::new(ProfileContext::with_active("a"));
        let writer = {
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    let next = if i % 2 == 0 { "b" } else { "a" };
                    ctx.publish::<()>(next, |_| Ok(())).unwrap();
                }
            })
        };
        for _ in 0..2000 {
            let guard = ctx.read();
            let id = guard.profile_id().unwrap().to_string();
            assert!(id == "a" || id == "b");
            // The value cannot change while the guard is held.
            assert_eq!(guard.profile_id(), Some(id.as_str()));
        }
        writer.join().unwrap();
    }
}
