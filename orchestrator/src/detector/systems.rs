//! Detectors keyed on a single manifest file: Go, Rust, the JVM build
//! tools, PHP and Ruby.

use std::collections::BTreeMap;

use super::{BuildProfile, Framework, FrameworkDetector, PackageManager, ProjectType, SourceTree};

fn manifest_profile(
    framework: Framework,
    language: &str,
    package_manager: PackageManager,
    install_cmd: &str,
    listen_port: u16,
) -> BuildProfile {
    BuildProfile {
        framework,
        language: language.to_string(),
        package_manager,
        project_type: ProjectType::Backend,
        install_cmd: install_cmd.to_string(),
        build_cmd: None,
        start_cmd: None,
        output_dir: None,
        runtime_version: None,
        listen_port,
        env_additions: BTreeMap::new(),
        has_user_dockerfile: false,
        confidence: 85,
    }
}

pub struct GoDetector;

impl FrameworkDetector for GoDetector {
    fn priority(&self) -> i32 {
        65
    }

    fn detect(&self, tree: &SourceTree) -> Option<BuildProfile> {
        if !tree.has_file("go.mod") {
            return None;
        }

        let mut profile = manifest_profile(
            Framework::Go,
            "go",
            PackageManager::GoMod,
            "go mod download",
            8080,
        );
        profile.build_cmd = Some("go build -o /bin/app .".to_string());
        profile.start_cmd = Some("/bin/app".to_string());
        Some(profile)
    }
}

pub struct RustDetector;

impl FrameworkDetector for RustDetector {
    fn priority(&self) -> i32 {
        64
    }

    fn detect(&self, tree: &SourceTree) -> Option<BuildProfile> {
        if !tree.has_file("Cargo.toml") {
            return None;
        }

        let mut profile = manifest_profile(
            Framework::Rust,
            "rust",
            PackageManager::Cargo,
            "cargo fetch",
            8000,
        );
        profile.build_cmd = Some("cargo build --release".to_string());
        Some(profile)
    }
}

pub struct MavenDetector;

impl FrameworkDetector for MavenDetector {
    fn priority(&self) -> i32 {
        63
    }

    fn detect(&self, tree: &SourceTree) -> Option<BuildProfile> {
        if !tree.has_file("pom.xml") {
            return None;
        }

        let mut profile = manifest_profile(
            Framework::Maven,
            "java",
            PackageManager::Maven,
            "mvn -q dependency:go-offline",
            8080,
        );
        profile.build_cmd = Some("mvn -q package -DskipTests".to_string());
        Some(profile)
    }
}

pub struct GradleDetector;

impl FrameworkDetector for GradleDetector {
    fn priority(&self) -> i32 {
        62
    }

    fn detect(&self, tree: &SourceTree) -> Option<BuildProfile> {
        if !tree.has_file("build.gradle") && !tree.has_file("build.gradle.kts") {
            return None;
        }

        let mut profile = manifest_profile(
            Framework::Gradle,
            "java",
            PackageManager::Gradle,
            "gradle dependencies",
            8080,
        );
        profile.build_cmd = Some("gradle build -x test".to_string());
        Some(profile)
    }
}

pub struct ComposerDetector;

impl FrameworkDetector for ComposerDetector {
    fn priority(&self) -> i32 {
        61
    }

    fn detect(&self, tree: &SourceTree) -> Option<BuildProfile> {
        if !tree.has_file("composer.json") {
            return None;
        }

        Some(manifest_profile(
            Framework::Php,
            "php",
            PackageManager::Composer,
            "composer install --no-dev --optimize-autoloader",
            80,
        ))
    }
}

pub struct BundlerDetector;

impl FrameworkDetector for BundlerDetector {
    fn priority(&self) -> i32 {
        60
    }

    fn detect(&self, tree: &SourceTree) -> Option<BuildProfile> {
        if !tree.has_file("Gemfile") {
            return None;
        }

        let mut profile = manifest_profile(
            Framework::Ruby,
            "ruby",
            PackageManager::Bundler,
            "bundle install",
            3000,
        );
        profile.start_cmd = Some("bundle exec rails server -b 0.0.0.0".to_string());
        Some(profile)
    }
}
