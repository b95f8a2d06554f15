//! VCS webhook contract: HMAC-SHA256 verification over the raw body, then
//! mapping push / pull-request payloads onto deployment submissions.

use ring::hmac;
use serde::Deserialize;

use zyphron_common::{Environment, Project};

use crate::deployment::DeployRequest;

/// Header carrying the signature, `sha256=<hex>`
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Header naming the event kind (`push`, `pull_request`)
pub const EVENT_HEADER: &str = "x-github-event";

/// Verifies `sha256=<hex>` over the raw body with the project's webhook
/// secret. The comparison is constant time.
pub fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_digest) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hmac::verify(&key, body, &expected).is_ok()
}

/// Signs a body the way a sender would. Used by tests and the local
/// delivery tool.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let tag = hmac::sign(&key, body);
    format!("sha256={}", hex::encode(tag.as_ref()))
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    action: String,
    number: u32,
    pull_request: PullRequestDetails,
}

#[derive(Debug, Deserialize)]
struct PullRequestDetails {
    head: PullRequestHead,
}

#[derive(Debug, Deserialize)]
struct PullRequestHead {
    #[serde(rename = "ref")]
    branch: String,
    sha: String,
}

/// What a verified webhook delivery translates to
#[derive(Debug)]
pub enum WebhookCommand {
    Deploy(DeployRequest),
    Ignored(&'static str),
}

/// Maps a verified event payload onto a deployment submission.
///
/// Pushes to the configured branch deploy to production when the project
/// has auto-deploy on; opened/synchronized/reopened pull requests deploy to
/// an isolated preview.
pub fn interpret(project: &Project, event: &str, body: &[u8]) -> WebhookCommand {
    match event {
        "push" => {
            let Ok(payload) = serde_json::from_slice::<PushPayload>(body) else {
                return WebhookCommand::Ignored("unparseable push payload");
            };

            let Some(branch) = payload.git_ref.strip_prefix("refs/heads/") else {
                return WebhookCommand::Ignored("push to a non-branch ref");
            };
            if branch != project.default_branch {
                return WebhookCommand::Ignored("push to a non-deployed branch");
            }
            if !project.auto_deploy {
                return WebhookCommand::Ignored("auto-deploy is off");
            }

            WebhookCommand::Deploy(DeployRequest {
                project_id: project.id,
                branch: Some(branch.to_string()),
                commit_sha: payload.after,
                environment: Environment::Production,
                force: false,
                pr_number: None,
            })
        }
        "pull_request" => {
            let Ok(payload) = serde_json::from_slice::<PullRequestPayload>(body) else {
                return WebhookCommand::Ignored("unparseable pull_request payload");
            };

            if !matches!(
                payload.action.as_str(),
                "opened" | "synchronize" | "reopened"
            ) {
                return WebhookCommand::Ignored("uninteresting pull_request action");
            }

            WebhookCommand::Deploy(DeployRequest {
                project_id: project.id,
                branch: Some(payload.pull_request.head.branch),
                commit_sha: Some(payload.pull_request.head.sha),
                environment: Environment::Preview,
                force: false,
                pr_number: Some(payload.number),
            })
        }
        _ => WebhookCommand::Ignored("unhandled event kind"),
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn project(auto_deploy: bool) -> Project {
        Project {
            id: Uuid::new_v4(),
            slug: "blog".parse().unwrap(),
            repo_url: "https://github.com/acme/blog.git".to_string(),
            default_branch: "main".to_string(),
            auto_deploy,
            root_directory: None,
            custom_domain: None,
            webhook_secret: Some("wh-secret".to_string()),
        }
    }

    #[test]
    fn signature_round_trip() {
        let body = br#"{"ref":"refs/heads/main"}"#;
        let signature = sign("wh-secret", body);

        assert!(verify_signature("wh-secret", body, &signature));
    }

    #[test]
    fn tampered_bodies_and_wrong_secrets_fail() {
        let body = br#"{"ref":"refs/heads/main"}"#;
        let signature = sign("wh-secret", body);

        assert!(!verify_signature("wh-secret", b"{}", &signature));
        assert!(!verify_signature("other-secret", body, &signature));
        assert!(!verify_signature("wh-secret", body, "sha256=feedface"));
        assert!(!verify_signature("wh-secret", body, "nonsense"));
    }

    #[test]
    fn push_on_default_branch_deploys_production() {
        let project = project(true);
        let body = br#"{"ref":"refs/heads/main","after":"abc123"}"#;

        let command = interpret(&project, "push", body);

        match command {
            WebhookCommand::Deploy(request) => {
                assert_eq!(request.project_id, project.id);
                assert_eq!(request.branch.as_deref(), Some("main"));
                assert_eq!(request.commit_sha.as_deref(), Some("abc123"));
                assert_eq!(request.environment, Environment::Production);
                assert_eq!(request.pr_number, None);
            }
            other => panic!("expected a deploy, got {other:?}"),
        }
    }

    #[test]
    fn push_to_other_branches_is_ignored() {
        let command = interpret(
            &project(true),
            "push",
            br#"{"ref":"refs/heads/feature","after":"abc123"}"#,
        );
        assert!(matches!(command, WebhookCommand::Ignored(_)));
    }

    #[test]
    fn push_without_auto_deploy_is_ignored() {
        let command = interpret(
            &project(false),
            "push",
            br#"{"ref":"refs/heads/main","after":"abc123"}"#,
        );
        assert!(matches!(command, WebhookCommand::Ignored(_)));
    }

    #[test]
    fn opened_pull_request_deploys_a_preview() {
        let project = project(true);
        let body = br#"{
            "action": "opened",
            "number": 42,
            "pull_request": { "head": { "ref": "feature-x", "sha": "abc123" } }
        }"#;

        let command = interpret(&project, "pull_request", body);

        match command {
            WebhookCommand::Deploy(request) => {
                assert_eq!(request.environment, Environment::Preview);
                assert_eq!(request.branch.as_deref(), Some("feature-x"));
                assert_eq!(request.commit_sha.as_deref(), Some("abc123"));
                assert_eq!(request.pr_number, Some(42));
            }
            other => panic!("expected a preview deploy, got {other:?}"),
        }
    }

    #[test]
    fn closed_pull_requests_are_ignored() {
        let body = br#"{
            "action": "closed",
            "number": 42,
            "pull_request": { "head": { "ref": "feature-x", "sha": "abc123" } }
        }"#;
        assert!(matches!(
            interpret(&project(true), "pull_request", body),
            WebhookCommand::Ignored(_)
        ));
    }

    #[test]
    fn unknown_events_are_ignored() {
        assert!(matches!(
            interpret(&project(true), "issues", b"{}"),
            WebhookCommand::Ignored(_)
        ));
    }
}
