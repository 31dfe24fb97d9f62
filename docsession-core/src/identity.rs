//! Ownership checks for sessions and recovery snapshots.
//!
//! Identities are produced elsewhere (an upstream auth layer, or the process
//! environment) and only consumed here. Two pure functions decide access:
//! [`can_access`] gates visibility and [`storage_key`] buckets persisted
//! snapshots by owner.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use docsession_types::{Identity, IsolationMode};

/// Bucket used whenever ownership is not enforced.
pub const ANONYMOUS_STORAGE_KEY: &str = "__anonymous__";

/// Environment variable read by [`EnvIdentityProvider`] for the group id.
pub const GROUP_ENV: &str = "DOCSESSION_GROUP_ID";
/// Environment variable read by [`EnvIdentityProvider`] for the user id.
pub const USER_ENV: &str = "DOCSESSION_USER_ID";

/// The component an identity is compared on under [`IsolationMode::Group`].
#[derive(Debug, PartialEq, Eq)]
enum Scope<'a> {
    Group(&'a str),
    User(&'a str),
}

fn scope(identity: &Identity) -> Option<Scope<'_>> {
    match (identity.group_id(), identity.user_id()) {
        (Some(group), _) => Some(Scope::Group(group)),
        (None, Some(user)) => Some(Scope::User(user)),
        (None, None) => None,
    }
}

/// Whether `requestor` may act on a resource owned by `owner`.
///
/// Anonymous identities never block and are never blocked.
pub fn can_access(requestor: &Identity, owner: &Identity, mode: IsolationMode) -> bool {
    if mode == IsolationMode::None {
        return true;
    }
    match (scope(requestor), scope(owner)) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

/// Directory-safe bucket name for artifacts owned by `identity`.
///
/// Components are URL-safe base64 so ids containing `/`, `..` or other
/// separators cannot escape the temp directory or collide with each other.
pub fn storage_key(identity: &Identity, mode: IsolationMode) -> String {
    if mode == IsolationMode::None {
        return ANONYMOUS_STORAGE_KEY.to_string();
    }
    match scope(identity) {
        Some(Scope::Group(group)) => format!("g_{}", URL_SAFE_NO_PAD.encode(group)),
        Some(Scope::User(user)) => format!("u_{}", URL_SAFE_NO_PAD.encode(user)),
        None => ANONYMOUS_STORAGE_KEY.to_string(),
    }
}

/// Source of the identity making the current call.
pub trait IdentityProvider: Send + Sync {
    fn current_identity(&self) -> Identity;
}

/// Always returns the same identity.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityProvider(pub Identity);

impl IdentityProvider for StaticIdentityProvider {
    fn current_identity(&self) -> Identity {
        self.0.clone()
    }
}

/// Identity taken from the process environment (single-tenant deployments).
#[derive(Debug, Clone)]
pub struct EnvIdentityProvider {
    group_var: String,
    user_var: String,
}

impl EnvIdentityProvider {
    pub fn new(group_var: impl Into<String>, user_var: impl Into<String>) -> Self {
        Self {
            group_var: group_var.into(),
            user_var: user_var.into(),
        }
    }
}

impl Default for EnvIdentityProvider {
    fn default() -> Self {
        Self::new(GROUP_ENV, USER_ENV)
    }
}

impl IdentityProvider for EnvIdentityProvider {
    fn current_identity(&self) -> Identity {
        Identity::new(
            std::env::var(&self.group_var).ok(),
            std::env::var(&self.user_var).ok(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_only(g: &str) -> Identity {
        Identity::new(Some(g.into()), None)
    }

    #[test]
    fn test_none_mode_always_allows() {
        let a = Identity::user("a", "alice");
        let b = Identity::user("b", "bob");
        assert!(can_access(&a, &b, IsolationMode::None));
    }

    #[test]
    fn test_anonymous_is_permissive_both_ways() {
        let a = Identity::user("a", "alice");
        let anon = Identity::anonymous();
        assert!(can_access(&anon, &a, IsolationMode::Group));
        assert!(can_access(&a, &anon, IsolationMode::Group));
    }

    #[test]
    fn test_group_mode_compares_groups() {
        let alice = Identity::user("a", "alice");
        let carol = Identity::user("a", "carol");
        let bob = Identity::user("b", "bob");
        assert!(can_access(&alice, &carol, IsolationMode::Group));
        assert!(!can_access(&alice, &bob, IsolationMode::Group));
        assert!(!can_access(&bob, &group_only("a"), IsolationMode::Group));
    }

    #[test]
    fn test_group_mode_falls_back_to_user_without_group() {
        let u1 = Identity::new(None, Some("alice".into()));
        let u2 = Identity::new(None, Some("bob".into()));
        assert!(can_access(&u1, &u1.clone(), IsolationMode::Group));
        assert!(!can_access(&u1, &u2, IsolationMode::Group));
        // a bare user never matches a group with the same name
        assert!(!can_access(&u1, &group_only("alice"), IsolationMode::Group));
    }

    #[test]
    fn test_storage_key_permissive_cases() {
        let a = Identity::user("a", "alice");
        assert_eq!(storage_key(&a, IsolationMode::None), ANONYMOUS_STORAGE_KEY);
        assert_eq!(
            storage_key(&Identity::anonymous(), IsolationMode::Group),
            ANONYMOUS_STORAGE_KEY
        );
    }

    #[test]
    fn test_storage_key_is_path_safe_and_distinct() {
        let hostile = group_only("../../etc");
        let key = storage_key(&hostile, IsolationMode::Group);
        assert!(!key.contains('/'));
        assert!(!key.contains(".."));

        let g = storage_key(&group_only("x"), IsolationMode::Group);
        let u = storage_key(&Identity::new(None, Some("x".into())), IsolationMode::Group);
        assert_ne!(g, u);
        assert_eq!(g, storage_key(&Identity::user("x", "someone"), IsolationMode::Group));
    }

    #[test]
    fn test_static_provider() {
        let provider = StaticIdentityProvider(Identity::user("g", "u"));
        assert_eq!(provider.current_identity(), Identity::user("g", "u"));
    }

    #[test]
    fn test_env_provider_reads_named_vars() {
        let provider = EnvIdentityProvider::new(
            "DOCSESSION_TEST_GROUP_UNSET_7F3A",
            "DOCSESSION_TEST_USER_UNSET_7F3A",
        );
        assert!(provider.current_identity().is_anonymous());
    }
}
