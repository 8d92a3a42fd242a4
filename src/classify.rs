//! Decides which keys are mirrored to the remote table and which stay in
//! the current session only.
//!
//! Login flags, the signed-in user's identity and UI preferences such as the
//! theme belong to one browser session. Broadcasting them would let one
//! person's login state leak into every other open session.

use crate::error::Result;
use regex::{RegexSet, RegexSetBuilder};
use std::collections::HashSet;

/// Naming conventions treated as session-local. Matched case-insensitively.
pub const DEFAULT_SESSION_LOCAL_PATTERNS: &[&str] = &[
    // teacherAuth, principalAuth, isAuth
    r"auth$",
    r"^(is_?)?logged_?in$",
    r"token",
    r"session",
    r"^current_?user",
    r"^user_?(id|name|email|role|avatar|profile)$",
    r"^(teacher|principal)_?(id|name|email|profile)$",
    r"theme",
    r"dark_?mode",
    // keys owned by the backend SDK and framework internals
    r"^(sb|supabase)[-_.]",
    r"^__",
];

/// Pure key-name classifier.
///
/// The answer depends on the key string alone, so every session classifies
/// the same key the same way.
#[derive(Debug, Clone)]
pub struct KeyClassifier {
    patterns: RegexSet,
    exact: HashSet<String>,
}

impl KeyClassifier {
    /// Start configuring a classifier. The default deny-list is on unless
    /// [`without_defaults`](KeyClassifierBuilder::without_defaults) is called.
    pub fn builder() -> KeyClassifierBuilder {
        KeyClassifierBuilder::default()
    }

    /// `true` when `key` should be mirrored to the remote table.
    #[must_use]
    pub fn should_sync(&self, key: &str) -> bool {
        !(self.exact.contains(key) || self.patterns.is_match(key))
    }

    /// Inverse of [`should_sync`](Self::should_sync).
    #[must_use]
    pub fn is_session_local(&self, key: &str) -> bool {
        !self.should_sync(key)
    }

    fn allow_all() -> Self {
        Self {
            patterns: RegexSet::empty(),
            exact: HashSet::new(),
        }
    }
}

impl Default for KeyClassifier {
    fn default() -> Self {
        // Built-in patterns are constants covered by the unit tests.
        Self::builder()
            .build()
            .unwrap_or_else(|_| Self::allow_all())
    }
}

/// Configures a [`KeyClassifier`].
#[derive(Debug, Clone)]
pub struct KeyClassifierBuilder {
    defaults: bool,
    patterns: Vec<String>,
    exact: HashSet<String>,
}

impl Default for KeyClassifierBuilder {
    fn default() -> Self {
        Self {
            defaults: true,
            patterns: Vec::new(),
            exact: HashSet::new(),
        }
    }
}

impl KeyClassifierBuilder {
    /// Drop the built-in naming-convention deny-list and rely only on what is
    /// registered explicitly.
    pub fn without_defaults(mut self) -> Self {
        self.defaults = false;
        self
    }

    /// Keep the built-in deny-list on or off.
    pub fn defaults(mut self, yes: bool) -> Self {
        self.defaults = yes;
        self
    }

    /// Register one exact key as session-local (case-sensitive).
    pub fn session_local_key(mut self, key: impl Into<String>) -> Self {
        self.exact.insert(key.into());
        self
    }

    /// Register an extra case-insensitive regex.
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    /// Compile the patterns. Fails with [`Error::Config`](crate::Error::Config)
    /// on an invalid regex.
    pub fn build(self) -> Result<KeyClassifier> {
        let mut all: Vec<String> = Vec::new();
        if self.defaults {
            all.extend(DEFAULT_SESSION_LOCAL_PATTERNS.iter().map(|p| p.to_string()));
        }
        all.extend(self.patterns);

        let patterns = RegexSetBuilder::new(&all).case_insensitive(true).build()?;
        Ok(KeyClassifier {
            patterns,
            exact: self.exact,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_patterns_compile() {
        assert!(KeyClassifier::builder().build().is_ok());
    }

    #[test]
    fn auth_flags_stay_local() {
        let c = KeyClassifier::default();
        for key in ["teacherAuth", "principalAuth", "TEACHERAUTH", "isLoggedIn"] {
            assert!(!c.should_sync(key), "{key} should be session-local");
        }
    }

    #[test]
    fn identity_and_preferences_stay_local() {
        let c = KeyClassifier::default();
        for key in [
            "currentUser",
            "current_user_id",
            "userEmail",
            "teacherName",
            "theme",
            "darkMode",
            "accessToken",
            "sb-project-auth-token",
            "__next_internal",
        ] {
            assert!(!c.should_sync(key), "{key} should be session-local");
        }
    }

    #[test]
    fn content_keys_sync() {
        let c = KeyClassifier::default();
        for key in ["course-list", "gallery", "admissions", "topScorers", "author"] {
            assert!(c.should_sync(key), "{key} should sync");
        }
    }

    #[test]
    fn answer_depends_on_the_key_alone() {
        let c = KeyClassifier::default();
        let keys = ["gallery", "teacherAuth", "course-list", "theme", "gallery"];
        let first: Vec<bool> = keys.iter().map(|k| c.should_sync(k)).collect();
        let reversed: Vec<bool> = keys.iter().rev().map(|k| c.should_sync(k)).collect();
        let fresh: Vec<bool> = keys
            .iter()
            .map(|k| KeyClassifier::default().should_sync(k))
            .collect();

        assert_eq!(first, reversed.into_iter().rev().collect::<Vec<_>>());
        assert_eq!(first, fresh);
        assert_eq!(first[0], first[4]);
    }

    #[test]
    fn explicit_registration_without_defaults() {
        let c = KeyClassifier::builder()
            .without_defaults()
            .session_local_key("draft")
            .build()
            .unwrap();
        assert!(!c.should_sync("draft"));
        assert!(c.should_sync("teacherAuth"));
    }

    #[test]
    fn bad_pattern_is_config_error() {
        let err = KeyClassifier::builder().pattern("(").build().unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }
}
