//! Authenticated transport to the transaction backend
//!
//! Every call carries the stored access token. A 401 triggers one token
//! refresh shared by all callers that were rejected with the same token, after
//! which the original request is replayed exactly once.

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use xmrpos_common::models::RefreshRequest;
use xmrpos_common::{Credentials, Error, Result, TokenPair};

/// Body of `POST /auth/login-pos`
#[derive(Debug, Serialize)]
struct LoginPosRequest<'a> {
    name: &'a str,
    password: &'a str,
    vendor_id: u64,
}

pub struct AuthClient {
    credentials: Credentials,

    /// Transport for authenticated API calls
    http: Client,

    /// Bare transport used only for login and refresh
    refresh_http: Client,

    /// Held while a refresh is in flight
    refresh_lock: Mutex<()>,
}

impl AuthClient {
    pub fn new(credentials: Credentials, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(network_error)?;
        let refresh_http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(network_error)?;

        Ok(Self {
            credentials,
            http,
            refresh_http,
            refresh_lock: Mutex::new(()),
        })
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Base URL of the backend, read from the store on every call
    pub async fn base_url(&self) -> Result<String> {
        self.credentials
            .backend_url()
            .await?
            .ok_or_else(|| Error::Configuration("Backend URL is not set".to_string()))
    }

    /// Current access token, empty when none is stored
    pub async fn access_token(&self) -> Result<String> {
        Ok(self.credentials.access_token().await?.unwrap_or_default())
    }

    /// Log a POS device in and persist the backend URL and issued tokens.
    pub async fn login_pos(
        &self,
        base_url: &str,
        name: &str,
        password: &str,
        vendor_id: u64,
    ) -> Result<()> {
        let base_url = base_url.trim_end_matches('/');
        let url = format!("{}/auth/login-pos", base_url);
        debug!("Logging in POS '{}' at {}", name, url);

        let response = self
            .refresh_http
            .post(&url)
            .json(&LoginPosRequest {
                name,
                password,
                vendor_id,
            })
            .send()
            .await
            .map_err(network_error)?;

        let tokens: TokenPair = decode(ensure_success(response).await?).await?;

        self.credentials.set_backend_url(base_url).await?;
        self.credentials.save_tokens(&tokens).await?;
        info!("Logged in POS '{}'", name);

        Ok(())
    }

    /// Send an authenticated request and return the successful response.
    ///
    /// # Errors
    /// * `Network` - transport failure
    /// * `Unauthenticated` - no session could be established
    /// * `Remote` - any other non-2xx status
    pub async fn request<B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<Response>
    where
        B: Serialize + ?Sized,
    {
        let body = body.map(serde_json::to_vec).transpose()?;
        let url = format!("{}{}", self.base_url().await?, path);
        let token = self.access_token().await?;

        let response = self.send(&method, &url, &token, body.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return ensure_success(response).await;
        }

        debug!("{} {} rejected with 401, refreshing session", method, path);
        let token = self.refresh_after_rejection(&token).await?;

        let response = self.send(&method, &url, &token, body.as_deref()).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!("{} {} still rejected after token refresh", method, path);
            return Err(Error::Unauthenticated);
        }

        ensure_success(response).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.request::<()>(Method::GET, path, None).await?;
        decode(response).await
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.request(Method::POST, path, Some(body)).await?;
        decode(response).await
    }

    /// Obtain a usable access token after `rejected` was refused.
    ///
    /// Callers arriving while a refresh is in flight wait for it and reuse its
    /// outcome instead of refreshing again. A failed refresh clears the stored
    /// session.
    pub async fn refresh_after_rejection(&self, rejected: &str) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;

        if let Some(current) = self.credentials.access_token().await? {
            if current != rejected {
                debug!("Session already refreshed by a concurrent request");
                return Ok(current);
            }
        }

        match self.refresh_tokens().await {
            Ok(tokens) => {
                info!("Access token refreshed");
                Ok(tokens.access_token)
            }
            Err(e) => {
                warn!("Token refresh failed, clearing session: {}", e);
                if let Err(e) = self.credentials.clear_session().await {
                    error!("Failed to clear session: {}", e);
                }
                Err(Error::Unauthenticated)
            }
        }
    }

    async fn refresh_tokens(&self) -> Result<TokenPair> {
        let refresh_token = self
            .credentials
            .refresh_token()
            .await?
            .ok_or(Error::Unauthenticated)?;
        let url = format!("{}/auth/refresh", self.base_url().await?);

        let response = self
            .refresh_http
            .post(&url)
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            })
            .send()
            .await
            .map_err(network_error)?;

        let tokens: TokenPair = decode(ensure_success(response).await?).await?;
        self.credentials.save_tokens(&tokens).await?;

        Ok(tokens)
    }

    async fn send(
        &self,
        method: &Method,
        url: &str,
        token: &str,
        body: Option<&[u8]>,
    ) -> Result<Response> {
        let mut request = self.http.request(method.clone(), url);
        if !token.is_empty() {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_vec());
        }

        request.send().await.map_err(network_error)
    }
}

pub(crate) fn network_error(e: reqwest::Error) -> Error {
    Error::Network(e.to_string())
}

/// Turn a non-2xx response into `Error::Remote`
pub(crate) async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(Error::Remote {
        status: status.as_u16(),
        body,
    })
}

pub(crate) async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let bytes = response.bytes().await.map_err(network_error)?;
    Ok(serde_json::from_slice(&bytes)?)
}
