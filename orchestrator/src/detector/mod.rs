//! Priority-ordered inference of a [`BuildProfile`] from a source tree.
//!
//! Detectors are consulted in descending priority, registration order
//! breaking ties; the first match wins. A user-authored Dockerfile beats
//! everything. Detection never fails: an unclassifiable tree degrades to a
//! low-confidence `unknown` profile with best-effort commands.

mod docker;
mod node;
mod python;
mod static_site;
mod systems;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::{debug, instrument};

pub use docker::{parse_exposed_port, DockerfileDetector};

/// The frameworks the platform knows how to build
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Framework {
    Docker,
    Next,
    Nuxt,
    React,
    Vue,
    Angular,
    Svelte,
    Nest,
    Express,
    Node,
    Django,
    Fastapi,
    Flask,
    Python,
    Go,
    Rust,
    Maven,
    Gradle,
    Php,
    Ruby,
    Static,
    Unknown,
}

#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProjectType {
    Static,
    Frontend,
    Backend,
    Fullstack,
    Unknown,
}

#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PackageManager {
    Bun,
    Pnpm,
    Yarn,
    Npm,
    Poetry,
    Pip,
    Cargo,
    #[strum(serialize = "go mod")]
    #[serde(rename = "go mod")]
    GoMod,
    Maven,
    Gradle,
    Composer,
    Bundler,
    None,
}

/// Everything the builder and lifecycle manager need to know about a source
/// tree: how to install, build and start it, and where it listens.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BuildProfile {
    pub framework: Framework,
    pub language: String,
    pub package_manager: PackageManager,
    pub project_type: ProjectType,
    pub install_cmd: String,
    pub build_cmd: Option<String>,
    pub start_cmd: Option<String>,
    pub output_dir: Option<String>,
    pub runtime_version: Option<String>,
    pub listen_port: u16,
    pub env_additions: BTreeMap<String, String>,
    pub has_user_dockerfile: bool,
    /// 0-100; how sure the detector is about this classification
    pub confidence: u8,
}

impl BuildProfile {
    fn unknown() -> Self {
        Self {
            framework: Framework::Unknown,
            language: "unknown".to_string(),
            package_manager: PackageManager::None,
            project_type: ProjectType::Unknown,
            install_cmd: String::new(),
            build_cmd: None,
            start_cmd: None,
            output_dir: None,
            runtime_version: None,
            listen_port: 3000,
            env_additions: BTreeMap::new(),
            has_user_dockerfile: false,
            confidence: 10,
        }
    }
}

/// A read-only view of the tree being classified, with the manifest parses
/// detectors keep asking for done once.
pub struct SourceTree {
    root: PathBuf,
    package_json: Option<serde_json::Value>,
    pyproject: Option<toml::Value>,
}

impl SourceTree {
    pub fn load(root: &Path) -> Self {
        let package_json = std::fs::read_to_string(root.join("package.json"))
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok());
        let pyproject = std::fs::read_to_string(root.join("pyproject.toml"))
            .ok()
            .and_then(|raw| raw.parse().ok());

        Self {
            root: root.to_path_buf(),
            package_json,
            pyproject,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.root.join(name).is_file()
    }

    pub fn read(&self, name: &str) -> Option<String> {
        std::fs::read_to_string(self.root.join(name)).ok()
    }

    pub fn package_json(&self) -> Option<&serde_json::Value> {
        self.package_json.as_ref()
    }

    /// Is `name` in dependencies or devDependencies of package.json?
    pub fn has_node_dependency(&self, name: &str) -> bool {
        self.package_json
            .as_ref()
            .map(|manifest| {
                ["dependencies", "devDependencies"]
                    .iter()
                    .any(|table| manifest[table].get(name).is_some())
            })
            .unwrap_or(false)
    }

    pub fn node_script(&self, name: &str) -> Option<String> {
        self.package_json
            .as_ref()
            .and_then(|manifest| manifest["scripts"][name].as_str())
            .map(str::to_string)
    }

    pub fn engines_node(&self) -> Option<String> {
        self.package_json
            .as_ref()
            .and_then(|manifest| manifest["engines"]["node"].as_str())
            .map(|constraint| constraint.trim_start_matches(['^', '~', '>', '=', ' ']).to_string())
    }

    pub fn pyproject(&self) -> Option<&toml::Value> {
        self.pyproject.as_ref()
    }

    /// Does any python requirements source mention `package`?
    pub fn has_python_dependency(&self, package: &str) -> bool {
        if let Some(requirements) = self.read("requirements.txt") {
            if requirements
                .lines()
                .any(|line| line.trim().to_ascii_lowercase().starts_with(package))
            {
                return true;
            }
        }

        self.pyproject
            .as_ref()
            .and_then(|manifest| manifest.get("tool"))
            .and_then(|tool| tool.get("poetry"))
            .and_then(|poetry| poetry.get("dependencies"))
            .and_then(|deps| deps.as_table())
            .map(|deps| deps.keys().any(|key| key.eq_ignore_ascii_case(package)))
            .unwrap_or(false)
            || self
                .pyproject
                .as_ref()
                .and_then(|manifest| manifest.get("project"))
                .and_then(|project| project.get("dependencies"))
                .and_then(|deps| deps.as_array())
                .map(|deps| {
                    deps.iter().any(|dep| {
                        dep.as_str()
                            .map(|s| s.to_ascii_lowercase().starts_with(package))
                            .unwrap_or(false)
                    })
                })
                .unwrap_or(false)
    }
}

/// One classification rule. Returns a full profile on match, nothing
/// otherwise.
pub trait FrameworkDetector: Send + Sync {
    fn priority(&self) -> i32;

    fn detect(&self, tree: &SourceTree) -> Option<BuildProfile>;
}

/// The registry the orchestrator consults once per deployment.
pub struct Detector {
    detectors: Vec<Box<dyn FrameworkDetector>>,
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector {
    /// The standard registry, highest priority first after sorting.
    pub fn new() -> Self {
        let mut detector = Self {
            detectors: Vec::new(),
        };

        detector.register(Box::new(docker::DockerfileDetector));
        detector.register(Box::new(node::NextDetector));
        detector.register(Box::new(node::NuxtDetector));
        detector.register(Box::new(node::NestDetector));
        detector.register(Box::new(node::AngularDetector));
        detector.register(Box::new(node::SvelteDetector));
        detector.register(Box::new(node::VueDetector));
        detector.register(Box::new(node::ReactDetector));
        detector.register(Box::new(python::DjangoDetector));
        detector.register(Box::new(python::FastapiDetector));
        detector.register(Box::new(python::FlaskDetector));
        detector.register(Box::new(node::ExpressDetector));
        detector.register(Box::new(systems::GoDetector));
        detector.register(Box::new(systems::RustDetector));
        detector.register(Box::new(systems::MavenDetector));
        detector.register(Box::new(systems::GradleDetector));
        detector.register(Box::new(systems::ComposerDetector));
        detector.register(Box::new(systems::BundlerDetector));
        detector.register(Box::new(node::NodeDetector));
        detector.register(Box::new(python::PythonDetector));
        detector.register(Box::new(static_site::StaticSiteDetector));

        detector
    }

    pub fn register(&mut self, detector: Box<dyn FrameworkDetector>) {
        self.detectors.push(detector);
        // Stable sort preserves registration order between equal priorities.
        self.detectors.sort_by_key(|d| std::cmp::Reverse(d.priority()));
    }

    /// Classify a source tree. Never fails; the worst case is an `unknown`
    /// profile with confidence 10.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn detect(&self, path: &Path) -> BuildProfile {
        let tree = SourceTree::load(path);

        for detector in &self.detectors {
            if let Some(profile) = detector.detect(&tree) {
                debug!(
                    framework = %profile.framework,
                    confidence = profile.confidence,
                    "classified source tree"
                );
                return profile;
            }
        }

        // Nothing matched; scrape what we can from a package manifest.
        let mut profile = BuildProfile::unknown();
        if tree.package_json().is_some() {
            profile.language = "javascript".to_string();
            profile.package_manager = node::package_manager(&tree);
            profile.install_cmd = node::install_cmd(profile.package_manager);
            profile.build_cmd = tree.node_script("build");
            profile.start_cmd = tree.node_script("start");
            profile.runtime_version = Some(node::runtime_version(&tree));
        }

        debug!("source tree did not match any detector");
        profile
    }
}
