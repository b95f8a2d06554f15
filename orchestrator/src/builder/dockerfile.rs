//! Dockerfile synthesis: one template per framework family, multi-stage
//! where a build step exists, single-stage for plain runtimes.
//!
//! Synthesized files are written as [`SYNTHETIC_DOCKERFILE`] next to the
//! source and removed after the build; a user's own `Dockerfile` is never
//! touched.

use crate::detector::{BuildProfile, Framework, PackageManager};

use super::BuilderError;

/// Filename the synthesized recipe is written under. Distinct from
/// `Dockerfile` so a user-authored one can never be overwritten.
pub const SYNTHETIC_DOCKERFILE: &str = "Dockerfile.zyphron";

/// Entries written into a `.dockerignore` when the repository has none.
pub const DEFAULT_DOCKERIGNORE: &str = "\
.git
.gitignore
node_modules
dist
build
.next
.output
target
__pycache__
*.pyc
.venv
venv
.DS_Store
";

fn node_image(profile: &BuildProfile) -> String {
    let version = profile.runtime_version.as_deref().unwrap_or("20");
    format!("node:{version}-alpine")
}

fn python_image(profile: &BuildProfile) -> String {
    let version = profile.runtime_version.as_deref().unwrap_or("3.11");
    format!("python:{version}-slim")
}

fn env_lines(profile: &BuildProfile) -> String {
    profile
        .env_additions
        .iter()
        .map(|(key, value)| format!("ENV {key}={value}\n"))
        .collect()
}

/// Frontend frameworks build to static assets and are served by nginx.
fn frontend_template(profile: &BuildProfile) -> String {
    let image = node_image(profile);
    let install = &profile.install_cmd;
    let build = profile.build_cmd.as_deref().unwrap_or("npm run build");
    let output = profile.output_dir.as_deref().unwrap_or("dist");
    let env = env_lines(profile);

    format!(
        "FROM {image} AS build\n\
         WORKDIR /app\n\
         COPY . .\n\
         {env}\
         RUN {install}\n\
         RUN {build}\n\
         \n\
         FROM nginx:1.25-alpine\n\
         COPY --from=build /app/{output} /usr/share/nginx/html\n\
         EXPOSE {port}\n\
         CMD [\"nginx\", \"-g\", \"daemon off;\"]\n",
        port = profile.listen_port,
    )
}

fn static_template(profile: &BuildProfile) -> String {
    let source = profile
        .output_dir
        .as_deref()
        .map(|dir| format!("{dir}/"))
        .unwrap_or_default();

    format!(
        "FROM nginx:1.25-alpine\n\
         COPY {source} /usr/share/nginx/html\n\
         EXPOSE {port}\n\
         CMD [\"nginx\", \"-g\", \"daemon off;\"]\n",
        port = profile.listen_port,
    )
}

/// Next and Nuxt need their build output plus a Node runtime.
fn node_fullstack_template(profile: &BuildProfile) -> String {
    let image = node_image(profile);
    let install = &profile.install_cmd;
    let build = profile.build_cmd.as_deref().unwrap_or("npm run build");
    let start = profile.start_cmd.as_deref().unwrap_or("npm start");
    let env = env_lines(profile);

    format!(
        "FROM {image} AS build\n\
         WORKDIR /app\n\
         COPY . .\n\
         {env}\
         RUN {install}\n\
         RUN {build}\n\
         \n\
         FROM {image}\n\
         WORKDIR /app\n\
         ENV NODE_ENV=production\n\
         {env}\
         COPY --from=build /app .\n\
         USER node\n\
         EXPOSE {port}\n\
         CMD {start}\n",
        port = profile.listen_port,
    )
}

fn node_backend_template(profile: &BuildProfile) -> String {
    let image = node_image(profile);
    let install = &profile.install_cmd;
    let start = profile.start_cmd.as_deref().unwrap_or("npm start");
    let env = env_lines(profile);
    let build = profile
        .build_cmd
        .as_deref()
        .map(|cmd| format!("RUN {cmd}\n"))
        .unwrap_or_default();

    format!(
        "FROM {image}\n\
         WORKDIR /app\n\
         ENV NODE_ENV=production\n\
         {env}\
         COPY . .\n\
         RUN {install}\n\
         {build}\
         USER node\n\
         EXPOSE {port}\n\
         CMD {start}\n",
        port = profile.listen_port,
    )
}

fn python_template(profile: &BuildProfile) -> String {
    let image = python_image(profile);
    let install = &profile.install_cmd;
    let start = profile
        .start_cmd
        .as_deref()
        .unwrap_or("python main.py");
    let env = env_lines(profile);
    let poetry_bootstrap = if profile.package_manager == PackageManager::Poetry {
        "RUN pip install --no-cache-dir poetry && poetry config virtualenvs.create false\n"
    } else {
        ""
    };

    format!(
        "FROM {image}\n\
         WORKDIR /app\n\
         {env}\
         COPY . .\n\
         {poetry_bootstrap}\
         RUN {install}\n\
         RUN useradd --create-home zyphron\n\
         USER zyphron\n\
         EXPOSE {port}\n\
         CMD {start}\n",
        port = profile.listen_port,
    )
}

fn go_template(profile: &BuildProfile) -> String {
    format!(
        "FROM golang:1.21-alpine AS build\n\
         WORKDIR /src\n\
         COPY . .\n\
         RUN go mod download\n\
         RUN CGO_ENABLED=0 go build -o /bin/app .\n\
         \n\
         FROM alpine:3.19\n\
         COPY --from=build /bin/app /bin/app\n\
         RUN adduser -D zyphron\n\
         USER zyphron\n\
         EXPOSE {port}\n\
         CMD [\"/bin/app\"]\n",
        port = profile.listen_port,
    )
}

fn rust_template(profile: &BuildProfile) -> String {
    format!(
        "FROM rust:1 AS build\n\
         WORKDIR /src\n\
         COPY . .\n\
         RUN cargo install --path . --root /out\n\
         \n\
         FROM debian:bookworm-slim\n\
         COPY --from=build /out/bin /usr/local/bin\n\
         EXPOSE {port}\n\
         CMD [\"/bin/sh\", \"-c\", \"exec /usr/local/bin/*\"]\n",
        port = profile.listen_port,
    )
}

fn jvm_template(profile: &BuildProfile) -> String {
    let (builder_image, build_cmd, artifact_glob) = match profile.framework {
        Framework::Gradle => (
            "gradle:8-jdk17",
            "gradle build -x test",
            "build/libs/*.jar",
        ),
        _ => ("maven:3-eclipse-temurin-17", "mvn -q package -DskipTests", "target/*.jar"),
    };

    format!(
        "FROM {builder_image} AS build\n\
         WORKDIR /src\n\
         COPY . .\n\
         RUN {build_cmd}\n\
         \n\
         FROM eclipse-temurin:17-jre\n\
         COPY --from=build /src/{artifact_glob} /opt/app.jar\n\
         EXPOSE {port}\n\
         CMD [\"java\", \"-jar\", \"/opt/app.jar\"]\n",
        port = profile.listen_port,
    )
}

fn php_template(profile: &BuildProfile) -> String {
    format!(
        "FROM php:8.2-apache\n\
         COPY . /var/www/html/\n\
         EXPOSE {port}\n",
        port = profile.listen_port,
    )
}

fn ruby_template(profile: &BuildProfile) -> String {
    let start = profile
        .start_cmd
        .as_deref()
        .unwrap_or("bundle exec rails server -b 0.0.0.0");

    format!(
        "FROM ruby:3.2\n\
         WORKDIR /app\n\
         COPY . .\n\
         RUN bundle install\n\
         EXPOSE {port}\n\
         CMD {start}\n",
        port = profile.listen_port,
    )
}

/// Renders the Dockerfile for a profile.
///
/// Fails for a tree carrying its own Dockerfile (the builder must honor it,
/// not synthesize) and for trees too unclassified to guess a runtime for.
pub fn synthesize(profile: &BuildProfile) -> Result<String, BuilderError> {
    if profile.has_user_dockerfile {
        return Err(BuilderError::Synthesis(
            "refusing to synthesize over a user-authored Dockerfile".to_string(),
        ));
    }

    let rendered = match profile.framework {
        Framework::Docker => {
            return Err(BuilderError::Synthesis(
                "docker profiles use the repository Dockerfile".to_string(),
            ))
        }
        Framework::Next | Framework::Nuxt => node_fullstack_template(profile),
        Framework::React | Framework::Vue | Framework::Angular | Framework::Svelte => {
            frontend_template(profile)
        }
        Framework::Static => static_template(profile),
        Framework::Nest | Framework::Express | Framework::Node => node_backend_template(profile),
        Framework::Django | Framework::Fastapi | Framework::Flask | Framework::Python => {
            python_template(profile)
        }
        Framework::Go => go_template(profile),
        Framework::Rust => rust_template(profile),
        Framework::Maven | Framework::Gradle => jvm_template(profile),
        Framework::Php => php_template(profile),
        Framework::Ruby => ruby_template(profile),
        Framework::Unknown => {
            return Err(BuilderError::Synthesis(
                "source tree could not be classified; add a Dockerfile".to_string(),
            ))
        }
    };

    Ok(rendered)
}
