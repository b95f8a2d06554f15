//! Build-context preparation: a gzipped tar of the source tree with
//! `.dockerignore` honored.

use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use super::dockerfile::DEFAULT_DOCKERIGNORE;
use super::BuilderError;

/// The subset of `.dockerignore` syntax the context builder understands:
/// bare names matching any path component, path prefixes, and `*.ext`
/// suffix globs. Negations are not supported.
pub struct IgnoreRules {
    rules: Vec<String>,
}

impl IgnoreRules {
    pub fn parse(content: &str) -> Self {
        let rules = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
            .map(|line| line.trim_end_matches('/').to_string())
            .collect();

        Self { rules }
    }

    /// Loads the tree's `.dockerignore`, or the defaults when absent.
    pub fn for_tree(root: &Path) -> Self {
        match std::fs::read_to_string(root.join(".dockerignore")) {
            Ok(content) => Self::parse(&content),
            Err(_) => Self::parse(DEFAULT_DOCKERIGNORE),
        }
    }

    pub fn is_ignored(&self, relative: &Path) -> bool {
        let as_string = relative.to_string_lossy().replace('\\', "/");

        self.rules.iter().any(|rule| {
            if let Some(extension) = rule.strip_prefix("*.") {
                return relative
                    .file_name()
                    .map(|name| name.to_string_lossy().ends_with(&format!(".{extension}")))
                    .unwrap_or(false);
            }

            as_string == *rule
                || as_string.starts_with(&format!("{rule}/"))
                || relative
                    .components()
                    .any(|component| component.as_os_str().to_string_lossy() == *rule)
        })
    }
}

/// Writes a default `.dockerignore` if the tree has none. The user's own
/// file is left alone.
pub async fn ensure_dockerignore(root: &Path) -> Result<(), BuilderError> {
    let path = root.join(".dockerignore");
    if !path.exists() {
        debug!("writing default .dockerignore");
        tokio::fs::write(&path, DEFAULT_DOCKERIGNORE).await?;
    }
    Ok(())
}

/// Tars and gzips the source tree, skipping ignored paths.
pub fn build_context(root: &Path) -> Result<Vec<u8>, BuilderError> {
    let ignore = IgnoreRules::for_tree(root);

    let encoder = GzEncoder::new(Vec::new(), Compression::fast());
    let mut archive = tar::Builder::new(encoder);
    archive.follow_symlinks(false);

    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let relative = path
                .strip_prefix(root)
                .expect("walked path is always under the root")
                .to_path_buf();

            // The recipe and ignore file always ship, whatever the rules say.
            let always_kept = relative == Path::new(".dockerignore")
                || relative == Path::new("Dockerfile")
                || relative == Path::new(super::dockerfile::SYNTHETIC_DOCKERFILE);

            if !always_kept && ignore.is_ignored(&relative) {
                continue;
            }

            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                archive.append_path_with_name(&path, &relative)?;
            }
        }
    }

    let encoder = archive
        .into_inner()
        .map_err(|e| BuilderError::Driver(format!("failed to assemble build context: {e}")))?;
    encoder
        .finish()
        .map_err(|e| BuilderError::Driver(format!("failed to compress build context: {e}")))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use flate2::read::GzDecoder;
    use tar::Archive;

    use super::*;

    #[test]
    fn ignore_rules_match_components_prefixes_and_globs() {
        let rules = IgnoreRules::parse("node_modules\n*.pyc\ndist/\n# comment\n\n!negated\n");

        assert!(rules.is_ignored(Path::new("node_modules")));
        assert!(rules.is_ignored(Path::new("node_modules/express/index.js")));
        assert!(rules.is_ignored(Path::new("packages/a/node_modules/x.js")));
        assert!(rules.is_ignored(Path::new("app/__init__.pyc")));
        assert!(rules.is_ignored(Path::new("dist/bundle.js")));

        assert!(!rules.is_ignored(Path::new("src/index.js")));
        assert!(!rules.is_ignored(Path::new("negated")));
    }

    #[test]
    fn context_excludes_ignored_trees() {
        let dir = tempfile::Builder::new()
            .prefix("zyphron-context-test")
            .tempdir()
            .unwrap();
        let root = dir.path();

        fs::write(root.join("index.js"), "console.log(1)").unwrap();
        fs::write(root.join(".dockerignore"), "node_modules\n").unwrap();
        fs::create_dir_all(root.join("node_modules/express")).unwrap();
        fs::write(root.join("node_modules/express/index.js"), "x").unwrap();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("src/app.js"), "y").unwrap();

        let context = build_context(root).unwrap();

        let mut names = Vec::new();
        let mut archive = Archive::new(GzDecoder::new(context.as_slice()));
        for entry in archive.entries().unwrap() {
            names.push(
                entry
                    .unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .to_string(),
            );
        }
        names.sort();

        assert_eq!(names, vec![".dockerignore", "index.js", "src/app.js"]);
    }

    #[tokio::test]
    async fn default_dockerignore_is_only_written_when_absent() {
        let dir = tempfile::Builder::new()
            .prefix("zyphron-ignore-test")
            .tempdir()
            .unwrap();

        ensure_dockerignore(dir.path()).await.unwrap();
        let written = fs::read_to_string(dir.path().join(".dockerignore")).unwrap();
        assert!(written.contains("node_modules"));

        fs::write(dir.path().join(".dockerignore"), "custom\n").unwrap();
        ensure_dockerignore(dir.path()).await.unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join(".dockerignore")).unwrap(),
            "custom\n"
        );
    }
}
