//! HTTP-backed [`Session`] against the source's JSON API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::harvest::config_loader::{Api, Credentials};
use crate::harvest::source::{
    FeedItem, Page, Session, SourceError, SourceResult, TrackedAccount, Tray,
};

const LOGIN_ENDPOINT: &str = "accounts/login";
const LOGOUT_ENDPOINT: &str = "accounts/logout";
const TRAY_ENDPOINT: &str = "feed/reels_tray";

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoggedInUser {
    pk: i64,
    #[serde(default)]
    username: String,
}

#[derive(Deserialize)]
struct LoginResponse {
    logged_in_user: LoggedInUser,
    token: String,
}

#[derive(Deserialize)]
struct FollowingResponse {
    #[serde(default)]
    users: Vec<TrackedAccount>,
    #[serde(default)]
    next_max_id: Option<String>,
}

#[derive(Deserialize)]
struct FeedResponse {
    #[serde(default)]
    items: Vec<FeedItem>,
    #[serde(default)]
    next_max_id: Option<String>,
}

/// One logged-in identity talking to the API over HTTP
pub struct HttpSession {
    client: Client,
    base_url: String,
    token: String,
    handle: String,
    account_id: i64,
}

impl HttpSession {
    /// Log in with `credentials` and return the authenticated session.
    #[instrument(skip(api, credentials), fields(username = %credentials.username))]
    pub async fn login(api: &Api, credentials: &Credentials, timeout: Duration) -> SourceResult<Self> {
        let client = Client::builder()
            .user_agent(&api.user_agent)
            .timeout(timeout)
            .build()?;
        let base_url = api.base_url.trim_end_matches('/').to_string();

        let response = client
            .post(format!("{}/{}", base_url, LOGIN_ENDPOINT))
            .json(&LoginRequest {
                username: &credentials.username,
                password: &credentials.password,
            })
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SourceError::Auth(credentials.username.clone()));
        }
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                endpoint: LOGIN_ENDPOINT.to_string(),
            });
        }

        let body = response.bytes().await?;
        let login: LoginResponse = serde_json::from_slice(&body)?;
        let handle = if login.logged_in_user.username.is_empty() {
            credentials.username.clone()
        } else {
            login.logged_in_user.username
        };

        info!(account_id = login.logged_in_user.pk, "Logged in as {}", handle);

        Ok(Self {
            client,
            base_url,
            token: login.token,
            handle,
            account_id: login.logged_in_user.pk,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: RequestBuilder,
    ) -> SourceResult<T> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                endpoint: endpoint.to_string(),
            });
        }

        let body = response.bytes().await?;
        debug!(endpoint, bytes = body.len(), "Response received");
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl Session for HttpSession {
    fn handle(&self) -> &str {
        &self.handle
    }

    fn account_id(&self) -> i64 {
        self.account_id
    }

    async fn fetch_following(&self, cursor: Option<&str>) -> SourceResult<Page<TrackedAccount>> {
        let endpoint = format!("friendships/{}/following", self.account_id);
        let mut request = self.client.get(self.url(&endpoint));
        if let Some(cursor) = cursor {
            request = request.query(&[("max_id", cursor)]);
        }

        let response: FollowingResponse = self.get_json(&endpoint, request).await?;
        Ok(Page::new(response.users, response.next_max_id))
    }

    async fn fetch_user_feed(
        &self,
        user_id: i64,
        cursor: Option<&str>,
        since: Option<i64>,
    ) -> SourceResult<Page<FeedItem>> {
        let endpoint = format!("feed/user/{}", user_id);
        let mut request = self.client.get(self.url(&endpoint));
        if let Some(cursor) = cursor {
            request = request.query(&[("max_id", cursor)]);
        }
        if let Some(since) = since {
            request = request.query(&[("min_timestamp", since)]);
        }

        let response: FeedResponse = self.get_json(&endpoint, request).await?;
        Ok(Page::new(response.items, response.next_max_id))
    }

    async fn fetch_story_tray(&self) -> SourceResult<Tray> {
        let request = self.client.get(self.url(TRAY_ENDPOINT));
        self.get_json(TRAY_ENDPOINT, request).await
    }

    async fn logout(&self) -> SourceResult<()> {
        let response = self
            .client
            .post(self.url(LOGOUT_ENDPOINT))
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "Logout rejected for {}", self.handle);
            return Err(SourceError::Status {
                status: status.as_u16(),
                endpoint: LOGOUT_ENDPOINT.to_string(),
            });
        }

        info!("Logged out {}", self.handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api(server: &MockServer) -> Api {
        Api {
            base_url: format!("{}/", server.uri()),
            user_agent: "harvester-test".to_string(),
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            username: "main".to_string(),
            password: "secret".to_string(),
        }
    }

    async fn logged_in(server: &MockServer) -> HttpSession {
        Mock::given(method("POST"))
            .and(path("/accounts/login"))
            .and(body_json(json!({"username": "main", "password": "secret"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "logged_in_user": {"pk": 42, "username": "main"},
                "token": "tok"
            })))
            .mount(server)
            .await;

        HttpSession::login(&api(server), &credentials(), Duration::from_secs(5))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn login_records_identity() {
        let server = MockServer::start().await;
        let session = logged_in(&server).await;
        assert_eq!(session.handle(), "main");
        assert_eq!(session.account_id(), 42);
    }

    #[tokio::test]
    async fn rejected_login_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/accounts/login"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let result = HttpSession::login(&api(&server), &credentials(), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(SourceError::Auth(name)) if name == "main"));
    }

    #[tokio::test]
    async fn following_pages_carry_cursor_and_token() {
        let server = MockServer::start().await;
        let session = logged_in(&server).await;

        Mock::given(method("GET"))
            .and(path("/friendships/42/following"))
            .and(query_param("max_id", "c1"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "users": [{"pk": 7, "username": "alice", "is_private": true}],
                "next_max_id": ""
            })))
            .mount(&server)
            .await;

        let page = session.fetch_following(Some("c1")).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].handle, "alice");
        assert!(page.items[0].is_private);
        assert_eq!(page.next_cursor(), None);
    }

    #[tokio::test]
    async fn feed_passes_min_timestamp() {
        let server = MockServer::start().await;
        let session = logged_in(&server).await;

        Mock::given(method("GET"))
            .and(path("/feed/user/7"))
            .and(query_param("min_timestamp", "1600000000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"id": "a", "device_timestamp": 1600000100, "user": {"username": "alice"}}],
                "next_max_id": "next"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let page = session.fetch_user_feed(7, None, Some(1_600_000_000)).await.unwrap();
        assert_eq!(page.items[0].captured_at, 1_600_000_100);
        assert_eq!(page.next_cursor(), Some("next"));
    }

    #[tokio::test]
    async fn tray_error_status_is_reported() {
        let server = MockServer::start().await;
        let session = logged_in(&server).await;

        Mock::given(method("GET"))
            .and(path("/feed/reels_tray"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let result = session.fetch_story_tray().await;
        assert!(matches!(result, Err(SourceError::Status { status: 500, .. })));
    }

    #[tokio::test]
    async fn logout_posts_with_token() {
        let server = MockServer::start().await;
        let session = logged_in(&server).await;

        Mock::given(method("POST"))
            .and(path("/accounts/logout"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        session.logout().await.unwrap();
    }
}
