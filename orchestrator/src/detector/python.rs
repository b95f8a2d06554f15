//! Detectors for the Python ecosystem.

use std::collections::BTreeMap;

use super::{BuildProfile, Framework, FrameworkDetector, PackageManager, ProjectType, SourceTree};

fn package_manager(tree: &SourceTree) -> Option<PackageManager> {
    if tree.pyproject().is_some() {
        Some(PackageManager::Poetry)
    } else if tree.has_file("requirements.txt") {
        Some(PackageManager::Pip)
    } else {
        None
    }
}

fn install_cmd(package_manager: PackageManager) -> String {
    match package_manager {
        PackageManager::Poetry => "poetry install --no-root --only main",
        _ => "pip install --no-cache-dir -r requirements.txt",
    }
    .to_string()
}

fn base_profile(tree: &SourceTree, framework: Framework) -> Option<BuildProfile> {
    let package_manager = package_manager(tree)?;

    Some(BuildProfile {
        framework,
        language: "python".to_string(),
        package_manager,
        project_type: ProjectType::Backend,
        install_cmd: install_cmd(package_manager),
        build_cmd: None,
        start_cmd: None,
        output_dir: None,
        runtime_version: Some("3.11".to_string()),
        listen_port: 8000,
        env_additions: BTreeMap::from([(
            "PYTHONUNBUFFERED".to_string(),
            "1".to_string(),
        )]),
        has_user_dockerfile: false,
        confidence: 85,
    })
}

pub struct DjangoDetector;

impl FrameworkDetector for DjangoDetector {
    fn priority(&self) -> i32 {
        80
    }

    fn detect(&self, tree: &SourceTree) -> Option<BuildProfile> {
        if !tree.has_python_dependency("django") && !tree.has_file("manage.py") {
            return None;
        }

        let mut profile = base_profile(tree, Framework::Django)?;
        profile.start_cmd = Some("gunicorn --bind 0.0.0.0:8000 config.wsgi".to_string());
        profile.confidence = 90;
        Some(profile)
    }
}

pub struct FastapiDetector;

impl FrameworkDetector for FastapiDetector {
    fn priority(&self) -> i32 {
        79
    }

    fn detect(&self, tree: &SourceTree) -> Option<BuildProfile> {
        if !tree.has_python_dependency("fastapi") {
            return None;
        }

        let mut profile = base_profile(tree, Framework::Fastapi)?;
        profile.start_cmd = Some("uvicorn main:app --host 0.0.0.0 --port 8000".to_string());
        profile.confidence = 90;
        Some(profile)
    }
}

pub struct FlaskDetector;

impl FrameworkDetector for FlaskDetector {
    fn priority(&self) -> i32 {
        78
    }

    fn detect(&self, tree: &SourceTree) -> Option<BuildProfile> {
        if !tree.has_python_dependency("flask") {
            return None;
        }

        let mut profile = base_profile(tree, Framework::Flask)?;
        profile.listen_port = 5000;
        profile.start_cmd = Some("gunicorn --bind 0.0.0.0:5000 app:app".to_string());
        Some(profile)
    }
}

/// Any remaining tree that looks like Python
pub struct PythonDetector;

impl FrameworkDetector for PythonDetector {
    fn priority(&self) -> i32 {
        25
    }

    fn detect(&self, tree: &SourceTree) -> Option<BuildProfile> {
        let mut profile = base_profile(tree, Framework::Python)?;
        profile.start_cmd = Some("python main.py".to_string());
        profile.confidence = 50;
        Some(profile)
    }
}
