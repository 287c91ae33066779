use async_trait::async_trait;
use chrono::{DateTime, Utc};
use octocrab::models::CommentId;
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{find_marker, MirrorAdapter, MirrorError, RemoteComment};
use crate::config::{MirrorConfig, RepoSlug};

const PAGE_SIZE: u8 = 100;

/// Mirror backed by the pull request's issue comments.
#[derive(Debug, Clone)]
pub struct GitHubMirror {
    octocrab: Octocrab,
    repo: RepoSlug,
    pr_number: u64,
}

#[derive(Debug, Deserialize)]
struct CommentPayload {
    id: u64,
    #[serde(default)]
    body: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    html_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct CommentBody<'a> {
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct PageQuery {
    per_page: u8,
    page: u32,
}

impl GitHubMirror {
    pub fn new(
        settings: &MirrorConfig,
        repo: RepoSlug,
        pr_number: u64,
    ) -> Result<Self, MirrorError> {
        if !settings.enabled {
            return Err(MirrorError::Disabled);
        }
        let token = settings
            .token
            .clone()
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                MirrorError::TokenNotFound(
                    "No GitHub token found in GITHUB_TOKEN, GH_TOKEN or mirror.token".to_string(),
                )
            })?;

        let octocrab = Octocrab::builder()
            .base_uri(settings.api_base.as_str())?
            .personal_token(token)
            .build()?;

        Ok(Self {
            octocrab,
            repo,
            pr_number,
        })
    }

    fn thread_route(&self) -> String {
        format!(
            "/repos/{}/{}/issues/{}/comments",
            self.repo.owner, self.repo.name, self.pr_number
        )
    }

    fn comment_route(&self, id: u64) -> String {
        format!(
            "/repos/{}/{}/issues/comments/{id}",
            self.repo.owner, self.repo.name
        )
    }
}

fn parse_remote_id(remote_id: &str) -> Result<u64, MirrorError> {
    remote_id
        .trim()
        .parse::<u64>()
        .map_err(|_| MirrorError::InvalidRemoteId(remote_id.to_string()))
}

fn classify(err: octocrab::Error, remote_id: &str) -> MirrorError {
    let missing = matches!(
        &err,
        octocrab::Error::GitHub { source, .. } if source.status_code.as_u16() == 404
    );
    if missing {
        MirrorError::NotFound {
            remote_id: remote_id.to_string(),
        }
    } else {
        MirrorError::ApiError(err)
    }
}

#[async_trait]
impl MirrorAdapter for GitHubMirror {
    async fn publish(&self, content: &str) -> Result<String, MirrorError> {
        let comment: CommentPayload = self
            .octocrab
            .post(self.thread_route(), Some(&CommentBody { body: content }))
            .await?;

        info!(
            repo = %self.repo,
            pr = self.pr_number,
            comment_id = comment.id,
            "💬 Published review comment"
        );
        Ok(comment.id.to_string())
    }

    async fn fetch(&self, remote_id: &str) -> Result<String, MirrorError> {
        let id = parse_remote_id(remote_id)?;
        let comment: CommentPayload = self
            .octocrab
            .get(self.comment_route(id), None::<&()>)
            .await
            .map_err(|err| classify(err, remote_id))?;
        Ok(comment.body.unwrap_or_default())
    }

    async fn update(&self, remote_id: &str, content: &str) -> Result<(), MirrorError> {
        let id = parse_remote_id(remote_id)?;
        let _comment: CommentPayload = self
            .octocrab
            .patch(self.comment_route(id), Some(&CommentBody { body: content }))
            .await
            .map_err(|err| classify(err, remote_id))?;

        info!(comment_id = id, "✏️  Updated review comment");
        Ok(())
    }

    async fn delete(&self, remote_id: &str) -> Result<(), MirrorError> {
        let id = parse_remote_id(remote_id)?;
        self.octocrab
            .issues(&self.repo.owner, &self.repo.name)
            .delete_comment(CommentId(id))
            .await
            .map_err(|err| classify(err, remote_id))?;

        info!(comment_id = id, "🗑️  Deleted review comment");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RemoteComment>, MirrorError> {
        let mut found = Vec::new();
        let mut page = 1u32;

        loop {
            let batch: Vec<CommentPayload> = self
                .octocrab
                .get(
                    self.thread_route(),
                    Some(&PageQuery {
                        per_page: PAGE_SIZE,
                        page,
                    }),
                )
                .await?;
            let fetched = batch.len();

            found.extend(batch.into_iter().filter_map(|comment| {
                let body = comment.body.unwrap_or_default();
                let marker = find_marker(&body)?;
                Some(RemoteComment {
                    remote_id: comment.id.to_string(),
                    marker,
                    created_at: comment.created_at,
                    url: comment.html_url,
                    body,
                })
            }));

            if fetched < PAGE_SIZE as usize {
                break;
            }
            page += 1;
        }

        debug!(count = found.len(), pages = page, "Listed duo comments");
        Ok(found)
    }
}
