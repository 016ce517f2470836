use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

use super::error::ErrorKind;

#[derive(Debug, Error)]
pub enum GitHostError {
    #[error("git host request failed: {0}")]
    Http(String),
    #[error("git host returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("git host request timed out")]
    Timeout,
}

impl GitHostError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GitHostError::Timeout => ErrorKind::Timeout,
            _ => ErrorKind::External,
        }
    }
}

fn from_reqwest(err: reqwest::Error) -> GitHostError {
    if err.is_timeout() {
        GitHostError::Timeout
    } else {
        // reqwest errors may embed the full request URL; the URL never
        // carries the token (it travels in a header), so this is safe.
        GitHostError::Http(err.to_string())
    }
}

/// Provider families differ only in their auth header scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
pub enum ProviderFamily {
    GitHub,
    GitLab,
}

#[derive(Debug, Clone, Serialize, TS)]
pub struct CreatedRepo {
    pub name: String,
    pub clone_url: String,
}

#[derive(Debug, Deserialize)]
struct GitHubRepoResponse {
    name: String,
    clone_url: String,
}

#[derive(Debug, Deserialize)]
struct GitLabRepoResponse {
    name: String,
    http_url_to_repo: String,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    name: String,
}

/// Minimal client for the provider HTTP APIs the core consumes: create-repo
/// and list-branches. Tokens are opaque secrets and never logged.
pub struct GitHostClient {
    http: reqwest::Client,
    family: ProviderFamily,
    base_url: String,
    token: SecretString,
}

impl GitHostClient {
    pub fn new(
        family: ProviderFamily,
        base_url: impl Into<String>,
        token: SecretString,
    ) -> Result<Self, GitHostError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            http,
            family,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.family {
            ProviderFamily::GitHub => request.header(
                "Authorization",
                format!("token {}", self.token.expose_secret()),
            ),
            ProviderFamily::GitLab => {
                request.header("PRIVATE-TOKEN", self.token.expose_secret())
            }
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, GitHostError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message: String = response
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(300)
            .collect();
        Err(GitHostError::Api {
            status: status.as_u16(),
            message,
        })
    }

    pub async fn create_repo(
        &self,
        name: &str,
        private: bool,
    ) -> Result<CreatedRepo, GitHostError> {
        match self.family {
            ProviderFamily::GitHub => {
                let response = self
                    .authed(self.http.post(format!("{}/user/repos", self.base_url)))
                    .json(&serde_json::json!({ "name": name, "private": private }))
                    .send()
                    .await
                    .map_err(from_reqwest)?;
                let body: GitHubRepoResponse = Self::check(response)
                    .await?
                    .json()
                    .await
                    .map_err(from_reqwest)?;
                Ok(CreatedRepo {
                    name: body.name,
                    clone_url: body.clone_url,
                })
            }
            ProviderFamily::GitLab => {
                let visibility = if private { "private" } else { "public" };
                let response = self
                    .authed(self.http.post(format!("{}/projects", self.base_url)))
                    .json(&serde_json::json!({ "name": name, "visibility": visibility }))
                    .send()
                    .await
                    .map_err(from_reqwest)?;
                let body: GitLabRepoResponse = Self::check(response)
                    .await?
                    .json()
                    .await
                    .map_err(from_reqwest)?;
                Ok(CreatedRepo {
                    name: body.name,
                    clone_url: body.http_url_to_repo,
                })
            }
        }
    }

    /// `repo` is `owner/name` for GitHub and the url-encoded project id or
    /// path for GitLab.
    pub async fn list_branches(&self, repo: &str) -> Result<Vec<String>, GitHostError> {
        let url = match self.family {
            ProviderFamily::GitHub => format!("{}/repos/{}/branches", self.base_url, repo),
            ProviderFamily::GitLab => {
                format!("{}/projects/{}/repository/branches", self.base_url, repo)
            }
        };
        let response = self
            .authed(self.http.get(url))
            .send()
            .await
            .map_err(from_reqwest)?;
        let body: Vec<NamedRef> = Self::check(response)
            .await?
            .json()
            .await
            .map_err(from_reqwest)?;
        Ok(body.into_iter().map(|b| b.name).collect())
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header, method, path},
    };

    use super::*;

    #[tokio::test]
    async fn github_uses_token_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/user/repos"))
            .and(header("Authorization", "token gh-secret"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "name": "demo",
                "clone_url": "https://github.com/me/demo.git"
            })))
            .mount(&server)
            .await;

        let client = GitHostClient::new(
            ProviderFamily::GitHub,
            server.uri(),
            SecretString::from("gh-secret".to_string()),
        )
        .unwrap();
        let repo = client.create_repo("demo", true).await.unwrap();
        assert_eq!(repo.clone_url, "https://github.com/me/demo.git");
    }

    #[tokio::test]
    async fn gitlab_uses_private_token_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/projects/42/repository/branches"))
            .and(header("PRIVATE-TOKEN", "gl-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"name": "main"}, {"name": "develop"}
            ])))
            .mount(&server)
            .await;

        let client = GitHostClient::new(
            ProviderFamily::GitLab,
            server.uri(),
            SecretString::from("gl-secret".to_string()),
        )
        .unwrap();
        let branches = client.list_branches("42").await.unwrap();
        assert_eq!(branches, vec!["main", "develop"]);
    }

    #[tokio::test]
    async fn api_errors_surface_status_and_head_of_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/me/demo/branches"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
            .mount(&server)
            .await;

        let client = GitHostClient::new(
            ProviderFamily::GitHub,
            server.uri(),
            SecretString::from("t".to_string()),
        )
        .unwrap();
        let err = client.list_branches("me/demo").await.unwrap_err();
        assert!(matches!(err, GitHostError::Api { status: 404, .. }));
        assert_eq!(err.kind(), ErrorKind::External);
    }
}
