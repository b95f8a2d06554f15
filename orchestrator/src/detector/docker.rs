use std::collections::BTreeMap;

use super::{BuildProfile, Framework, FrameworkDetector, PackageManager, ProjectType, SourceTree};

/// A user-authored Dockerfile wins outright: the builder honors it instead
/// of synthesizing one, and its `EXPOSE` directive governs routing.
pub struct DockerfileDetector;

/// Returns the first port exposed by a Dockerfile, if any.
pub fn parse_exposed_port(dockerfile: &str) -> Option<u16> {
    dockerfile
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| {
            let rest = line.strip_prefix("EXPOSE")?;
            rest.split_whitespace()
                .next()?
                .split('/')
                .next()?
                .parse()
                .ok()
        })
}

impl FrameworkDetector for DockerfileDetector {
    fn priority(&self) -> i32 {
        100
    }

    fn detect(&self, tree: &SourceTree) -> Option<BuildProfile> {
        let dockerfile = tree.read("Dockerfile")?;

        Some(BuildProfile {
            framework: Framework::Docker,
            language: "unknown".to_string(),
            package_manager: PackageManager::None,
            project_type: ProjectType::Unknown,
            install_cmd: String::new(),
            build_cmd: None,
            start_cmd: None,
            output_dir: None,
            runtime_version: None,
            listen_port: parse_exposed_port(&dockerfile).unwrap_or(3000),
            env_additions: BTreeMap::new(),
            has_user_dockerfile: true,
            confidence: 100,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expose_parsing() {
        assert_eq!(parse_exposed_port("FROM node\nEXPOSE 4000\n"), Some(4000));
        assert_eq!(
            parse_exposed_port("EXPOSE 8080/tcp 9090/udp"),
            Some(8080)
        );
        assert_eq!(
            parse_exposed_port("# EXPOSE 1234\nFROM scratch\n"),
            None
        );
        assert_eq!(parse_exposed_port("FROM scratch\n"), None);
        assert_eq!(parse_exposed_port("EXPOSE not-a-port\n"), None);
    }
}
