use std::collections::BTreeMap;

use super::{BuildProfile, Framework, FrameworkDetector, PackageManager, ProjectType, SourceTree};

/// Plain HTML trees: an `index.html` at the root, or under `public/`.
pub struct StaticSiteDetector;

impl FrameworkDetector for StaticSiteDetector {
    fn priority(&self) -> i32 {
        20
    }

    fn detect(&self, tree: &SourceTree) -> Option<BuildProfile> {
        let output_dir = if tree.has_file("index.html") {
            None
        } else if tree.has_file("public/index.html") {
            Some("public".to_string())
        } else {
            return None;
        };

        Some(BuildProfile {
            framework: Framework::Static,
            language: "html".to_string(),
            package_manager: PackageManager::None,
            project_type: ProjectType::Static,
            install_cmd: String::new(),
            build_cmd: None,
            start_cmd: None,
            output_dir,
            runtime_version: None,
            listen_port: 80,
            env_additions: BTreeMap::new(),
            has_user_dockerfile: false,
            confidence: 60,
        })
    }
}
