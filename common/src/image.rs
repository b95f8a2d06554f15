use std::fmt::Formatter;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deployment::short_tag;
use crate::project::ProjectSlug;

/// A fully qualified reference to a built image.
///
/// One image per deployment attempt: the tag is derived from the deployment
/// id, so a retry (a fresh id) always produces a fresh tag.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn for_deployment(registry: &str, project_id: &Uuid, deployment_id: &Uuid) -> Self {
        Self {
            registry: registry.to_string(),
            repository: format!("zyphron/{project_id}"),
            tag: short_tag(deployment_id),
        }
    }

    /// The name passed to the daemon and the registry, without the tag.
    pub fn name(&self) -> String {
        if self.registry.is_empty() {
            self.repository.clone()
        } else {
            format!("{}/{}", self.registry, self.repository)
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name(), self.tag)
    }
}

/// A handle to a container created for a deployment
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ContainerRef {
    pub id: String,
    pub name: String,
    pub host_port: u16,
}

impl ContainerRef {
    /// Container names are unique across the runtime because the short tag
    /// is unique per deployment attempt.
    pub fn name_for(slug: &ProjectSlug, deployment_id: &Uuid) -> String {
        format!("zyphron-{}-{}", slug, short_tag(deployment_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_ref_formatting() {
        let project_id = Uuid::new_v4();
        let deployment_id = Uuid::new_v4();
        let image = ImageRef::for_deployment("registry.local:5000", &project_id, &deployment_id);

        assert_eq!(image.repository, format!("zyphron/{project_id}"));
        assert_eq!(image.tag.len(), 8);
        assert_eq!(
            image.to_string(),
            format!(
                "registry.local:5000/zyphron/{project_id}:{}",
                short_tag(&deployment_id)
            )
        );
    }

    #[test]
    fn image_ref_without_registry_is_local() {
        let image = ImageRef {
            registry: String::new(),
            repository: "zyphron/p".to_string(),
            tag: "cafe0123".to_string(),
        };
        assert_eq!(image.to_string(), "zyphron/p:cafe0123");
    }

    #[test]
    fn container_names_carry_slug_and_tag() {
        let slug: ProjectSlug = "blog".parse().unwrap();
        let id = Uuid::new_v4();
        let name = ContainerRef::name_for(&slug, &id);

        assert!(name.starts_with("zyphron-blog-"));
        assert_eq!(name.len(), "zyphron-blog-".len() + 8);
    }
}
