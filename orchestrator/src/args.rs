use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Program to take git refs to running containers: clone, classify, build,
/// publish, launch and health-gate each deployment of every project.
#[derive(Clone, Debug, Parser)]
#[clap(author, version, about)]
pub struct Args {
    /// Address to serve the deployment API on
    #[clap(long, default_value = "0.0.0.0:7100")]
    pub api_address: SocketAddr,

    /// How many pipelines may run in parallel
    #[clap(long, env = "MAX_CONCURRENT_PIPELINES", default_value = "5")]
    pub max_concurrent_pipelines: usize,

    /// How many image builds may run in parallel (second-level gate inside
    /// the pipeline)
    #[clap(long, env = "MAX_CONCURRENT_BUILDS", default_value = "5")]
    pub max_concurrent_builds: usize,

    /// Deadline for the build step, in seconds
    #[clap(long, env = "BUILD_TIMEOUT_SECS", default_value = "1800")]
    pub build_timeout_secs: u64,

    /// Domain under which project hostnames are formed
    #[clap(long, env = "BASE_DOMAIN", default_value = "zyphron.local")]
    pub base_domain: String,

    /// Registry to push built images to. Empty means local images only.
    #[clap(long, env = "CONTAINER_REGISTRY", default_value = "")]
    pub container_registry: String,

    /// Root directory for cloned working trees
    #[clap(long, env = "PROJECTS_DIR", default_value = "/var/lib/zyphron/projects")]
    pub projects_dir: PathBuf,

    /// Lowest host port the lifecycle manager may allocate
    #[clap(long, env = "PORT_BASE", default_value = "20000")]
    pub port_base: u16,

    /// How many successful deployments to keep per project
    #[clap(long, env = "KEEP_LAST_DEPLOYMENTS", default_value = "3")]
    pub keep_last_deployments: usize,

    /// Memory cap for builds and runtime containers ("512m", "2g")
    #[clap(long, env = "RESOURCE_MEMORY_LIMIT", default_value = "2g")]
    pub memory_limit: String,

    /// CPU cap for builds and runtime containers ("0.5", "2")
    #[clap(long, env = "RESOURCE_CPU_LIMIT", default_value = "2")]
    pub cpu_limit: String,

    /// Name of the shared bridge network containers are attached to
    #[clap(long, default_value = "zyphron-network")]
    pub network_name: String,

    /// Path of the orchestrator state database
    #[clap(long, default_value = "zyphron.sqlite")]
    pub state: PathBuf,
}
