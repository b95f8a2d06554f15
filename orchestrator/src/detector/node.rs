//! Detectors for the Node ecosystem, from meta-frameworks down to a bare
//! package.json.

use std::collections::BTreeMap;

use super::{BuildProfile, Framework, FrameworkDetector, PackageManager, ProjectType, SourceTree};

/// Fallback Node version when the manifest does not pin one (current LTS)
const DEFAULT_NODE_VERSION: &str = "20";

/// Lockfile preference order: bun > pnpm > yarn > npm, defaulting to npm.
pub fn package_manager(tree: &SourceTree) -> PackageManager {
    if tree.has_file("bun.lockb") || tree.has_file("bun.lock") {
        PackageManager::Bun
    } else if tree.has_file("pnpm-lock.yaml") {
        PackageManager::Pnpm
    } else if tree.has_file("yarn.lock") {
        PackageManager::Yarn
    } else {
        PackageManager::Npm
    }
}

pub fn install_cmd(package_manager: PackageManager) -> String {
    match package_manager {
        PackageManager::Bun => "bun install",
        PackageManager::Pnpm => "pnpm install --frozen-lockfile",
        PackageManager::Yarn => "yarn install --frozen-lockfile",
        _ => "npm install",
    }
    .to_string()
}

pub fn runtime_version(tree: &SourceTree) -> String {
    tree.engines_node()
        .map(|constraint| {
            // "18.17.0" or ">=18" both pin the major image tag.
            constraint
                .split('.')
                .next()
                .unwrap_or(DEFAULT_NODE_VERSION)
                .to_string()
        })
        .unwrap_or_else(|| DEFAULT_NODE_VERSION.to_string())
}

fn base_profile(tree: &SourceTree, framework: Framework) -> BuildProfile {
    let package_manager = package_manager(tree);

    BuildProfile {
        framework,
        language: "javascript".to_string(),
        package_manager,
        project_type: ProjectType::Backend,
        install_cmd: install_cmd(package_manager),
        build_cmd: tree.node_script("build"),
        start_cmd: tree.node_script("start"),
        output_dir: None,
        runtime_version: Some(runtime_version(tree)),
        listen_port: 3000,
        env_additions: BTreeMap::new(),
        has_user_dockerfile: false,
        confidence: 85,
    }
}

pub struct NextDetector;

impl FrameworkDetector for NextDetector {
    fn priority(&self) -> i32 {
        90
    }

    fn detect(&self, tree: &SourceTree) -> Option<BuildProfile> {
        if !tree.has_node_dependency("next") {
            return None;
        }

        let mut profile = base_profile(tree, Framework::Next);
        profile.project_type = ProjectType::Fullstack;
        profile.build_cmd = profile.build_cmd.or_else(|| Some("next build".to_string()));
        profile.start_cmd = profile.start_cmd.or_else(|| Some("next start".to_string()));
        profile.output_dir = Some(".next".to_string());
        profile
            .env_additions
            .insert("NEXT_TELEMETRY_DISABLED".to_string(), "1".to_string());
        profile.confidence = 95;
        Some(profile)
    }
}

pub struct NuxtDetector;

impl FrameworkDetector for NuxtDetector {
    fn priority(&self) -> i32 {
        89
    }

    fn detect(&self, tree: &SourceTree) -> Option<BuildProfile> {
        if !tree.has_node_dependency("nuxt") && !tree.has_node_dependency("nuxt3") {
            return None;
        }

        let mut profile = base_profile(tree, Framework::Nuxt);
        profile.project_type = ProjectType::Fullstack;
        profile.build_cmd = profile.build_cmd.or_else(|| Some("nuxt build".to_string()));
        profile.start_cmd = profile
            .start_cmd
            .or_else(|| Some("node .output/server/index.mjs".to_string()));
        profile.output_dir = Some(".output".to_string());
        profile.confidence = 95;
        Some(profile)
    }
}

pub struct NestDetector;

impl FrameworkDetector for NestDetector {
    fn priority(&self) -> i32 {
        88
    }

    fn detect(&self, tree: &SourceTree) -> Option<BuildProfile> {
        if !tree.has_node_dependency("@nestjs/core") {
            return None;
        }

        let mut profile = base_profile(tree, Framework::Nest);
        profile.build_cmd = profile.build_cmd.or_else(|| Some("nest build".to_string()));
        profile.start_cmd = profile
            .start_cmd
            .or_else(|| Some("node dist/main.js".to_string()));
        profile.output_dir = Some("dist".to_string());
        profile.confidence = 90;
        Some(profile)
    }
}

pub struct AngularDetector;

impl FrameworkDetector for AngularDetector {
    fn priority(&self) -> i32 {
        87
    }

    fn detect(&self, tree: &SourceTree) -> Option<BuildProfile> {
        if !tree.has_node_dependency("@angular/core") {
            return None;
        }

        let mut profile = base_profile(tree, Framework::Angular);
        profile.project_type = ProjectType::Frontend;
        profile.build_cmd = profile.build_cmd.or_else(|| Some("ng build".to_string()));
        profile.start_cmd = None;
        profile.output_dir = Some("dist".to_string());
        profile.listen_port = 80;
        profile.confidence = 90;
        Some(profile)
    }
}

pub struct SvelteDetector;

impl FrameworkDetector for SvelteDetector {
    fn priority(&self) -> i32 {
        86
    }

    fn detect(&self, tree: &SourceTree) -> Option<BuildProfile> {
        if !tree.has_node_dependency("svelte") {
            return None;
        }

        let mut profile = base_profile(tree, Framework::Svelte);
        profile.project_type = ProjectType::Frontend;
        profile.build_cmd = profile.build_cmd.or_else(|| Some("vite build".to_string()));
        profile.start_cmd = None;
        profile.output_dir = Some("dist".to_string());
        profile.listen_port = 80;
        Some(profile)
    }
}

pub struct VueDetector;

impl FrameworkDetector for VueDetector {
    fn priority(&self) -> i32 {
        85
    }

    fn detect(&self, tree: &SourceTree) -> Option<BuildProfile> {
        if !tree.has_node_dependency("vue") {
            return None;
        }

        let mut profile = base_profile(tree, Framework::Vue);
        profile.project_type = ProjectType::Frontend;
        profile.build_cmd = profile.build_cmd.or_else(|| Some("vite build".to_string()));
        profile.start_cmd = None;
        profile.output_dir = Some("dist".to_string());
        profile.listen_port = 80;
        Some(profile)
    }
}

pub struct ReactDetector;

impl FrameworkDetector for ReactDetector {
    fn priority(&self) -> i32 {
        84
    }

    fn detect(&self, tree: &SourceTree) -> Option<BuildProfile> {
        if !tree.has_node_dependency("react") {
            return None;
        }

        let mut profile = base_profile(tree, Framework::React);
        profile.project_type = ProjectType::Frontend;
        profile.build_cmd = profile.build_cmd.or_else(|| Some("vite build".to_string()));
        profile.start_cmd = None;
        // create-react-app emits build/, everything else dist/
        profile.output_dir = Some(
            if tree.has_node_dependency("react-scripts") {
                "build"
            } else {
                "dist"
            }
            .to_string(),
        );
        profile.listen_port = 80;
        Some(profile)
    }
}

pub struct ExpressDetector;

impl FrameworkDetector for ExpressDetector {
    fn priority(&self) -> i32 {
        75
    }

    fn detect(&self, tree: &SourceTree) -> Option<BuildProfile> {
        if !tree.has_node_dependency("express") {
            return None;
        }

        let mut profile = base_profile(tree, Framework::Express);
        profile.start_cmd = profile
            .start_cmd
            .or_else(|| Some("node index.js".to_string()));
        Some(profile)
    }
}

/// Any remaining tree with a package.json
pub struct NodeDetector;

impl FrameworkDetector for NodeDetector {
    fn priority(&self) -> i32 {
        30
    }

    fn detect(&self, tree: &SourceTree) -> Option<BuildProfile> {
        tree.package_json()?;

        let mut profile = base_profile(tree, Framework::Node);
        profile.confidence = 50;
        Some(profile)
    }
}
