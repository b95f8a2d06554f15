pub mod deployment;
pub mod event;
pub mod image;
pub mod limits;
pub mod log;
pub mod project;

pub use deployment::{Deployment, DeploymentState, Environment, ErrorKind};
pub use event::{Event, EventType};
pub use image::{ContainerRef, ImageRef};
pub use log::{BuildStep, LogEntry, LogLevel};
pub use project::{EnvVar, Project, ProjectSlug};
