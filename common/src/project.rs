use std::collections::HashSet;
use std::fmt::Formatter;
use std::str::FromStr;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::deployment::Environment;

/// A URL-safe, unique short name for a project, used for routing and
/// container naming. Slugs become hostname labels with preview and staging
/// suffixes appended (`{slug}-pr-{n}`, `{slug}-staging`), so they get a
/// tighter budget than the 63-char label limit.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct ProjectSlug(String);

/// Longest slug that still leaves room for environment suffixes inside one
/// hostname label.
const MAX_SLUG_LENGTH: usize = 39;

#[derive(Debug, thiserror::Error)]
#[error("invalid project slug: must be 1-39 lowercase alphanumeric or dash characters, not starting or ending with a dash, and not a reserved name")]
pub struct InvalidProjectSlug;

impl ProjectSlug {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

fn is_reserved(slug: &str) -> bool {
    static INSTANCE: OnceCell<HashSet<&'static str>> = OnceCell::new();

    INSTANCE
        .get_or_init(|| HashSet::from(["zyphron", "www", "api", "admin", "registry", "status"]))
        .contains(slug)
}

impl FromStr for ProjectSlug {
    type Err = InvalidProjectSlug;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn is_valid_char(byte: u8) -> bool {
            matches!(byte, b'a'..=b'z' | b'0'..=b'9' | b'-')
        }

        if s.is_empty()
            || s.len() > MAX_SLUG_LENGTH
            || s.starts_with('-')
            || s.ends_with('-')
            || s.bytes().any(|byte| !is_valid_char(byte))
            || is_reserved(s)
        {
            return Err(InvalidProjectSlug);
        }

        Ok(Self(s.to_string()))
    }
}

impl<'de> Deserialize<'de> for ProjectSlug {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer)?
            .parse()
            .map_err(<D::Error as serde::de::Error>::custom)
    }
}

impl std::fmt::Display for ProjectSlug {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A project as the core sees it. Read-only from the orchestrator's
/// perspective; ownership, team membership and editing live elsewhere.
#[derive(Clone, Debug, Deserialize, Serialize, sqlx::FromRow)]
pub struct Project {
    pub id: Uuid,
    pub slug: ProjectSlug,
    pub repo_url: String,
    pub default_branch: String,
    pub auto_deploy: bool,
    pub root_directory: Option<String>,
    pub custom_domain: Option<String>,
    pub webhook_secret: Option<String>,
}

/// A single environment variable attached to a project.
///
/// Values are stored opaquely; the core only ever consumes plaintext at
/// build and launch time.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, sqlx::FromRow)]
pub struct EnvVar {
    pub project_id: Uuid,
    pub key: String,
    pub value: String,
    pub environment: Environment,
    pub is_secret: bool,
}

impl EnvVar {
    /// Keys follow the POSIX-ish convention `^[A-Z][A-Z0-9_]*$`.
    pub fn is_valid_key(key: &str) -> bool {
        let mut bytes = key.bytes();

        match bytes.next() {
            Some(b'A'..=b'Z') => {}
            _ => return false,
        }

        bytes.all(|byte| matches!(byte, b'A'..=b'Z' | b'0'..=b'9' | b'_'))
    }
}
