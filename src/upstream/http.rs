//! HTTP fetcher for the origin repository.
//!
//! The client never follows redirects on its own.  A 301/302/303 from the
//! origin is followed exactly once, by a fresh request that carries no
//! credentials: origins commonly redirect to signed CDN URLs on another host,
//! and the origin password must never reach that host.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{ACCEPT, LOCATION};
use reqwest::{Response, StatusCode, Url};
use tracing::{debug, instrument, warn};

use super::{FetchError, Fetched, NetworkErrorKind, Upstream};
use crate::config::OriginConfig;
use crate::content_type;

/// Basic-auth credentials for the origin.
#[derive(Clone)]
pub struct OriginCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for OriginCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

pub struct RemoteFetcher {
    client: reqwest::Client,
    base_url: Url,
    credentials: Option<OriginCredentials>,
}

impl RemoteFetcher {
    pub fn new(config: &OriginConfig, credentials: Option<OriginCredentials>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to build origin HTTP client")?;
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("invalid origin base_url: {}", config.base_url))?;
        anyhow::ensure!(
            !base_url.cannot_be_a_base(),
            "origin base_url cannot carry a path: {base_url}"
        );
        Ok(Self {
            client,
            base_url,
            credentials,
        })
    }

    /// Origin URL for a repository path.  Each path segment is appended
    /// percent-encoded, so `#`, `?` and `%` stay part of the path.
    fn url_for(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(path.strip_prefix('/').unwrap_or(path).split('/'));
        }
        url
    }
}

#[async_trait::async_trait]
impl Upstream for RemoteFetcher {
    #[instrument(skip(self), fields(%path))]
    async fn fetch(&self, path: &str) -> Result<Fetched, FetchError> {
        let content_type = content_type::resolve(path);
        let url = self.url_for(path);
        debug!(%url, "fetching artifact from origin");

        let mut request = self.client.get(url).header(ACCEPT, content_type);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        let response = request.send().await.map_err(network_error)?;

        let status = response.status();
        if !is_followed_redirect(status) {
            return read_artifact(response, content_type).await;
        }

        let target = redirect_target(&response)?;
        debug!(%status, host = target.host_str().unwrap_or_default(), "following origin redirect without credentials");

        // Deliberately a new request: no basic_auth, no Authorization header.
        let redirected = self
            .client
            .get(target)
            .header(ACCEPT, content_type)
            .send()
            .await
            .map_err(network_error)?;

        let redirected_status = redirected.status();
        if redirected_status.is_redirection() {
            warn!(status = %redirected_status, "redirect target redirected again");
            return Err(FetchError::Redirect {
                status: redirected_status.as_u16(),
                reason: "only one redirect hop is followed".to_string(),
            });
        }
        read_artifact(redirected, content_type).await
    }

    async fn check(&self) -> Result<()> {
        let response = self
            .client
            .head(self.base_url.clone())
            .send()
            .await
            .with_context(|| format!("HEAD {} failed", self.base_url))?;
        let status = response.status();
        anyhow::ensure!(
            !status.is_server_error(),
            "HEAD {} returned {status}",
            self.base_url
        );
        Ok(())
    }
}

fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER
    )
}

/// Resolve the `Location` header into an absolute, percent-encoded URL.
fn redirect_target(response: &Response) -> Result<Url, FetchError> {
    let status = response.status().as_u16();
    let location = response
        .headers()
        .get(LOCATION)
        .ok_or_else(|| FetchError::Redirect {
            status,
            reason: "missing Location header".to_string(),
        })?
        .to_str()
        .map_err(|_| FetchError::Redirect {
            status,
            reason: "Location header is not valid ASCII".to_string(),
        })?;

    let target = response
        .url()
        .join(location)
        .map_err(|e| FetchError::Redirect {
            status,
            reason: format!("malformed Location header: {e}"),
        })?;

    if !matches!(target.scheme(), "http" | "https") {
        return Err(FetchError::Redirect {
            status,
            reason: format!("unsupported redirect scheme: {}", target.scheme()),
        });
    }
    Ok(target)
}

async fn read_artifact(response: Response, content_type: &str) -> Result<Fetched, FetchError> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        debug!("origin reported artifact not found");
        return Err(FetchError::NotFound);
    }
    if !status.is_success() {
        warn!(%status, "origin returned non-success status");
        return Err(FetchError::Status {
            status: status.as_u16(),
        });
    }

    let content = response.bytes().await.map_err(network_error)?;
    debug!(%status, bytes = content.len(), "artifact fetched from origin");
    Ok(Fetched {
        content,
        content_type: content_type.to_string(),
    })
}

fn network_error(err: reqwest::Error) -> FetchError {
    let kind = if err.is_timeout() {
        NetworkErrorKind::Timeout
    } else {
        NetworkErrorKind::Connection
    };
    FetchError::Network {
        kind,
        message: err.without_url().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const JAR: &str = "/org/a/b/1.0/b-1.0.jar";

    fn origin_config(base_url: &str, timeout_secs: u64) -> OriginConfig {
        OriginConfig {
            base_url: base_url.to_string(),
            username: Some("user".to_string()),
            password_env: "UNUSED".to_string(),
            request_timeout_secs: timeout_secs,
            user_agent: "mavencache-test".to_string(),
        }
    }

    fn credentials() -> Option<OriginCredentials> {
        Some(OriginCredentials {
            username: "user".to_string(),
            password: "pass".to_string(),
        })
    }

    fn fetcher(server: &MockServer, creds: Option<OriginCredentials>) -> RemoteFetcher {
        RemoteFetcher::new(&origin_config(&server.uri(), 5), creds).unwrap()
    }

    #[tokio::test]
    async fn test_direct_hit_sends_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(JAR))
            // base64("user:pass")
            .and(header("authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"JARBYTES".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let fetched = fetcher(&server, credentials()).fetch(JAR).await.unwrap();
        assert_eq!(fetched.content.as_ref(), b"JARBYTES");
        assert_eq!(fetched.content_type, "application/octet-stream");
    }

    #[tokio::test]
    async fn test_no_credentials_sends_no_authorization() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/g/a/1.0/a-1.0.pom"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<project/>"))
            .mount(&server)
            .await;

        let fetched = fetcher(&server, None).fetch("/g/a/1.0/a-1.0.pom").await.unwrap();
        assert_eq!(fetched.content_type, "text/xml");

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_redirect_is_followed_without_credentials() {
        let server = MockServer::start().await;
        let signed = format!("{}/cdn/signed?x=1", server.uri());
        Mock::given(method("GET"))
            .and(path(JAR))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", signed.as_str()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cdn/signed"))
            .and(query_param("x", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ABC"))
            .expect(1)
            .mount(&server)
            .await;

        let fetched = fetcher(&server, credentials()).fetch(JAR).await.unwrap();
        assert_eq!(fetched.content.as_ref(), b"ABC");

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].headers.get("authorization").is_some());
        assert_eq!(requests[1].url.path(), "/cdn/signed");
        assert!(requests[1].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_relative_location_resolves_against_origin() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(JAR))
            .respond_with(ResponseTemplate::new(301).insert_header("Location", "/mirror/b-1.0.jar"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/mirror/b-1.0.jar"))
            .respond_with(ResponseTemplate::new(200).set_body_string("M"))
            .mount(&server)
            .await;

        let fetched = fetcher(&server, credentials()).fetch(JAR).await.unwrap();
        assert_eq!(fetched.content.as_ref(), b"M");
    }

    #[tokio::test]
    async fn test_see_other_is_followed() {
        let server = MockServer::start().await;
        let target = format!("{}/other", server.uri());
        Mock::given(path(JAR))
            .respond_with(ResponseTemplate::new(303).insert_header("Location", target.as_str()))
            .mount(&server)
            .await;
        Mock::given(path("/other"))
            .respond_with(ResponseTemplate::new(200).set_body_string("O"))
            .mount(&server)
            .await;

        assert!(fetcher(&server, None).fetch(JAR).await.is_ok());
    }

    #[tokio::test]
    async fn test_second_redirect_is_error() {
        let server = MockServer::start().await;
        let hop1 = format!("{}/hop1", server.uri());
        let hop2 = format!("{}/hop2", server.uri());
        Mock::given(path(JAR))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", hop1.as_str()))
            .mount(&server)
            .await;
        Mock::given(path("/hop1"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", hop2.as_str()))
            .mount(&server)
            .await;
        Mock::given(path("/hop2"))
            .respond_with(ResponseTemplate::new(200).set_body_string("never"))
            .expect(0)
            .mount(&server)
            .await;

        let err = fetcher(&server, None).fetch(JAR).await.unwrap_err();
        assert!(matches!(err, FetchError::Redirect { status: 302, .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_redirect_without_location_is_error() {
        let server = MockServer::start().await;
        Mock::given(path(JAR))
            .respond_with(ResponseTemplate::new(302))
            .mount(&server)
            .await;

        let err = fetcher(&server, None).fetch(JAR).await.unwrap_err();
        assert_eq!(
            err,
            FetchError::Redirect {
                status: 302,
                reason: "missing Location header".to_string()
            }
        );
    }

    #[test]
    fn test_url_for_keeps_base_path() {
        for base in ["https://repo.example.com/maven2", "https://repo.example.com/maven2/"] {
            let f = RemoteFetcher::new(&origin_config(base, 5), None).unwrap();
            assert_eq!(
                f.url_for("/g/a/1.0/a-1.0.jar").as_str(),
                "https://repo.example.com/maven2/g/a/1.0/a-1.0.jar"
            );
        }
    }

    #[test]
    fn test_url_for_encodes_reserved_characters() {
        let f = RemoteFetcher::new(&origin_config("https://repo.example.com", 5), None).unwrap();
        let url = f.url_for("/g/a#b?c=d%41.jar");
        assert_eq!(url.path(), "/g/a%23b%3Fc=d%2541.jar");
        assert!(url.query().is_none());
        assert!(url.fragment().is_none());
    }

    #[tokio::test]
    async fn test_fragment_character_stays_in_origin_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/g/a%23b.jar"))
            .respond_with(ResponseTemplate::new(200).set_body_string("RIGHT"))
            .expect(1)
            .mount(&server)
            .await;

        let fetched = fetcher(&server, None).fetch("/g/a#b.jar").await.unwrap();
        assert_eq!(fetched.content.as_ref(), b"RIGHT");
    }

    #[tokio::test]
    async fn test_temporary_redirect_is_not_followed() {
        let server = MockServer::start().await;
        Mock::given(path(JAR))
            .respond_with(ResponseTemplate::new(307).insert_header("Location", "/elsewhere"))
            .mount(&server)
            .await;

        let err = fetcher(&server, None).fetch(JAR).await.unwrap_err();
        assert_eq!(err, FetchError::Status { status: 307 });
    }

    #[tokio::test]
    async fn test_not_found() {
        let server = MockServer::start().await;
        Mock::given(path(JAR))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = fetcher(&server, credentials()).fetch(JAR).await.unwrap_err();
        assert_eq!(err, FetchError::NotFound);
    }

    #[tokio::test]
    async fn test_not_found_after_redirect() {
        let server = MockServer::start().await;
        let target = format!("{}/gone", server.uri());
        Mock::given(path(JAR))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", target.as_str()))
            .mount(&server)
            .await;
        Mock::given(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = fetcher(&server, None).fetch(JAR).await.unwrap_err();
        assert_eq!(err, FetchError::NotFound);
    }

    #[tokio::test]
    async fn test_server_error_status_is_preserved() {
        let server = MockServer::start().await;
        Mock::given(path(JAR))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = fetcher(&server, None).fetch(JAR).await.unwrap_err();
        assert_eq!(err, FetchError::Status { status: 503 });
    }

    #[tokio::test]
    async fn test_forbidden_status_is_preserved() {
        let server = MockServer::start().await;
        Mock::given(path(JAR))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let err = fetcher(&server, credentials()).fetch(JAR).await.unwrap_err();
        assert_eq!(err, FetchError::Status { status: 403 });
    }

    #[tokio::test]
    async fn test_timeout_is_network_error() {
        let server = MockServer::start().await;
        Mock::given(path(JAR))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let fetcher = RemoteFetcher::new(&origin_config(&server.uri(), 1), None).unwrap();
        let err = fetcher.fetch(JAR).await.unwrap_err();
        assert!(
            matches!(
                err,
                FetchError::Network {
                    kind: NetworkErrorKind::Timeout,
                    ..
                }
            ),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        // Port 1 is reserved and nothing listens on it.
        let fetcher = RemoteFetcher::new(&origin_config("http://127.0.0.1:1", 2), None).unwrap();
        let err = fetcher.fetch(JAR).await.unwrap_err();
        assert!(
            matches!(
                err,
                FetchError::Network {
                    kind: NetworkErrorKind::Connection,
                    ..
                }
            ),
            "{err:?}"
        );
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = OriginCredentials {
            username: "user".to_string(),
            password: "s3cret".to_string(),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("user"));
        assert!(!rendered.contains("s3cret"));
    }
}
