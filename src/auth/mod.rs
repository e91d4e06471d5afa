//! Authenticator set (C3).
//!
//! One [`Authenticator`] per configured [`AuthConfig`] variant. Each caches
//! its credential behind a `tokio::sync::Mutex` and refreshes it
//! single-flight: the first caller to find the cache stale performs the
//! login sub-request while later callers simply wait on the same lock,
//! mirroring the request executor's client-reuse idiom (one long-lived
//! `reqwest::Client`, never rebuilt per call).

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use reqwest::{Client, Method, RequestBuilder};
use serde_json::Value;

use crate::errors::CrawlerError;
use crate::plan::{AuthConfig, OauthFlow, RequestSpec};
use crate::query;

/// A credential applied to an outgoing request under one of the spec's
/// five inject targets.
#[derive(Debug, Clone)]
enum Injection {
    Header(String, String),
    Cookie(String, String),
    Bearer(String),
    Query(String, String),
    Body(String, String),
}

struct Cached {
    value: String,
    expires_at: Option<Instant>,
}

/// Applies the configured auth strategy to an outgoing request, refreshing
/// its cached credential as needed.
pub struct Authenticator {
    client: Client,
    config: AuthConfig,
    cache: tokio::sync::Mutex<Option<Cached>>,
}

impl Authenticator {
    pub fn new(client: Client, config: AuthConfig) -> Arc<Self> {
        Arc::new(Self { client, config, cache: tokio::sync::Mutex::new(None) })
    }

    pub async fn apply(&self, builder: RequestBuilder) -> Result<RequestBuilder, CrawlerError> {
        let injection = self.injection().await?;
        Ok(match injection {
            Some(Injection::Header(name, value)) => builder.header(name, value),
            Some(Injection::Cookie(name, value)) => builder.header("Cookie", format!("{name}={value}")),
            Some(Injection::Bearer(value)) => builder.header("Authorization", format!("Bearer {value}")),
            Some(Injection::Query(name, value)) => builder.query(&[(name, value)]),
            Some(Injection::Body(key, value)) => inject_into_body(builder, &key, &value)?,
            None => builder,
        })
    }

    async fn injection(&self) -> Result<Option<Injection>, CrawlerError> {
        match &self.config {
            AuthConfig::None => Ok(None),
            AuthConfig::Basic { username, password } => {
                let raw = format!("{username}:{password}");
                let encoded = base64::engine::general_purpose::STANDARD.encode(raw);
                Ok(Some(Injection::Header("Authorization".to_string(), format!("Basic {encoded}"))))
            }
            AuthConfig::Bearer { token } => {
                Ok(Some(Injection::Header("Authorization".to_string(), format!("Bearer {token}"))))
            }
            AuthConfig::Oauth { .. } => Ok(Some(Injection::Header(
                "Authorization".to_string(),
                format!("Bearer {}", self.cached_or_refresh().await?),
            ))),
            AuthConfig::Cookie { cookie_name, .. } => {
                Ok(Some(Injection::Cookie(cookie_name.clone(), self.cached_or_refresh().await?)))
            }
            AuthConfig::Jwt { token_header, .. } => {
                let header = token_header.clone().unwrap_or_else(|| "Authorization".to_string());
                let token = self.cached_or_refresh().await?;
                let value = if header.eq_ignore_ascii_case("authorization") {
                    format!("Bearer {token}")
                } else {
                    token
                };
                Ok(Some(Injection::Header(header, value)))
            }
            AuthConfig::Custom { inject_into, inject_key, .. } => {
                let value = self.cached_or_refresh().await?;
                Ok(Some(match inject_into.to_ascii_lowercase().as_str() {
                    "cookie" => Injection::Cookie(inject_key.clone(), value),
                    "header" => Injection::Header(inject_key.clone(), value),
                    "bearer" => Injection::Bearer(value),
                    "query" => Injection::Query(inject_key.clone(), value),
                    "body" => Injection::Body(inject_key.clone(), value),
                    other => {
                        return Err(CrawlerError::AuthConfigError {
                            message: format!("unknown custom auth inject target `{other}`"),
                        })
                    }
                }))
            }
        }
    }

    /// Returns the cached credential string if still fresh, otherwise
    /// performs the login sub-request and repopulates the cache. The mutex
    /// guard is held across the login request so concurrent callers queue
    /// behind the first refresh instead of all firing logins at once.
    async fn cached_or_refresh(&self) -> Result<String, CrawlerError> {
        let mut guard = self.cache.lock().await;
        if let Some(cached) = guard.as_ref() {
            let still_fresh = cached.expires_at.map(|exp| Instant::now() < exp).unwrap_or(true);
            if still_fresh {
                return Ok(cached.value.clone());
            }
        }

        let (value, ttl) = self.refresh().await?;
        let expires_at = ttl.map(|d| Instant::now() + d);
        *guard = Some(Cached { value: value.clone(), expires_at });
        Ok(value)
    }

    async fn refresh(&self) -> Result<(String, Option<Duration>), CrawlerError> {
        match &self.config {
            AuthConfig::Oauth { flow, token_url, username, password, client_id, client_secret, scopes } => {
                let mut form: Vec<(&str, &str)> = Vec::new();
                match flow {
                    OauthFlow::Password => {
                        form.push(("grant_type", "password"));
                        form.push(("username", username.as_deref().unwrap_or_default()));
                        form.push(("password", password.as_deref().unwrap_or_default()));
                    }
                    OauthFlow::ClientCredentials => {
                        form.push(("grant_type", "client_credentials"));
                        form.push(("client_id", client_id.as_deref().unwrap_or_default()));
                        form.push(("client_secret", client_secret.as_deref().unwrap_or_default()));
                    }
                }
                let scope_joined;
                if let Some(scopes) = scopes {
                    scope_joined = scopes.join(" ");
                    form.push(("scope", &scope_joined));
                }

                let resp = self
                    .client
                    .post(token_url)
                    .form(&form)
                    .send()
                    .await
                    .map_err(|e| CrawlerError::transport(token_url.clone(), e))?;
                let resp = ensure_login_success(token_url, resp).await?;
                let body: Value = resp
                    .json()
                    .await
                    .map_err(|e| CrawlerError::AuthError { kind: "oauth".to_string(), cause: e.to_string() })?;

                let token = body
                    .get("access_token")
                    .and_then(Value::as_str)
                    .ok_or_else(|| CrawlerError::AuthError {
                        kind: "oauth".to_string(),
                        cause: "response missing access_token".to_string(),
                    })?
                    .to_string();
                let ttl = body
                    .get("expires_in")
                    .and_then(Value::as_u64)
                    .map(|secs| Duration::from_secs(secs.saturating_sub(5)));
                Ok((token, ttl))
            }

            AuthConfig::Cookie { login_request, cookie_name, max_age_seconds } => {
                let resp = self.execute_login(login_request).await?;
                let value = extract_cookie_value(&resp, cookie_name)?;
                Ok((value, Some(Duration::from_secs(*max_age_seconds))))
            }

            AuthConfig::Jwt { login_request, token_path, max_age_seconds, .. } => {
                let resp = self.execute_login(login_request).await?;
                let body: Value = resp
                    .json()
                    .await
                    .map_err(|e| CrawlerError::AuthError { kind: "jwt".to_string(), cause: e.to_string() })?;
                let path = token_path.as_deref().unwrap_or("token");
                let token = extract_from(&body, path)?;
                Ok((token, Some(Duration::from_secs(*max_age_seconds))))
            }

            AuthConfig::Custom { login_request, extract_from: source, extract_selector, max_age_seconds, .. } => {
                let resp = self.execute_login(login_request).await?;
                let value = match source.to_ascii_lowercase().as_str() {
                    "header" => resp
                        .headers()
                        .get(extract_selector)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string)
                        .ok_or_else(|| CrawlerError::AuthError {
                            kind: "custom".to_string(),
                            cause: format!("login response missing header `{extract_selector}`"),
                        })?,
                    "cookie" => extract_cookie_value(&resp, extract_selector)?,
                    "body" => {
                        let body: Value = resp
                            .json()
                            .await
                            .map_err(|e| CrawlerError::AuthError { kind: "custom".to_string(), cause: e.to_string() })?;
                        extract_from(&body, extract_selector)?
                    }
                    other => {
                        return Err(CrawlerError::AuthConfigError {
                            message: format!("unknown custom auth extract source `{other}`"),
                        })
                    }
                };
                Ok((value, max_age_seconds.map(Duration::from_secs)))
            }

            _ => Err(CrawlerError::AuthConfigError { message: "authenticator has no refreshable credential".to_string() }),
        }
    }

    async fn execute_login(&self, spec: &RequestSpec) -> Result<reqwest::Response, CrawlerError> {
        let method = Method::from_bytes(spec.method.as_bytes())
            .map_err(|_| CrawlerError::AuthConfigError { message: format!("invalid login method `{}`", spec.method) })?;
        let mut builder = self.client.request(method, &spec.url);
        for (k, v) in &spec.headers {
            builder = builder.header(k, v);
        }
        if let Some(body) = &spec.body {
            builder = builder.json(body);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| CrawlerError::transport(spec.url.clone(), e))?;
        ensure_login_success(&spec.url, resp).await
    }
}

/// A non-2xx login response is always an error, never a credential that
/// happens to be missing its cookie/token — surfacing the status here keeps
/// callers from misdiagnosing an auth failure as a malformed success body.
async fn ensure_login_success(url: &str, resp: reqwest::Response) -> Result<reqwest::Response, CrawlerError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    Err(CrawlerError::AuthError {
        kind: "login".to_string(),
        cause: format!("login request to {url} failed with status {status}"),
    })
}

fn extract_cookie_value(resp: &reqwest::Response, cookie_name: &str) -> Result<String, CrawlerError> {
    let cookie_header = resp
        .headers()
        .get_all("set-cookie")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with(&format!("{cookie_name}=")))
        .ok_or_else(|| CrawlerError::AuthError {
            kind: "cookie".to_string(),
            cause: format!("no `{cookie_name}` cookie in login response"),
        })?;
    Ok(cookie_header
        .split(';')
        .next()
        .and_then(|kv| kv.split_once('='))
        .map(|(_, v)| v.to_string())
        .unwrap_or_default())
}

/// Merges `key: value` into the request's existing body, re-encoding it by
/// its `Content-Type`. Requires the builder's body to be already buffered
/// (never the case for this crate's own requests, which never stream).
fn inject_into_body(builder: RequestBuilder, key: &str, value: &str) -> Result<RequestBuilder, CrawlerError> {
    let inspect = builder.try_clone().ok_or_else(|| CrawlerError::AuthConfigError {
        message: "cannot inject into a streaming request body".to_string(),
    })?;
    let request = inspect.build().map_err(|e| CrawlerError::AuthConfigError {
        message: format!("failed to inspect request for body injection: {e}"),
    })?;

    let content_type = request
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_ascii_lowercase())
        .ok_or_else(|| CrawlerError::AuthConfigError {
            message: "body injection requires a Content-Type header".to_string(),
        })?;

    let existing_bytes = request.body().and_then(|b| b.as_bytes()).unwrap_or(&[]);

    let new_bytes = if content_type.starts_with("application/json") {
        let mut json: Value = if existing_bytes.is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_slice(existing_bytes).map_err(|e| CrawlerError::AuthConfigError {
                message: format!("body injection: invalid existing JSON body: {e}"),
            })?
        };
        if let Value::Object(map) = &mut json {
            map.insert(key.to_string(), Value::String(value.to_string()));
        }
        serde_json::to_vec(&json).map_err(|e| CrawlerError::AuthConfigError { message: e.to_string() })?
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let mut encoded = String::from_utf8_lossy(existing_bytes).into_owned();
        if !encoded.is_empty() {
            encoded.push('&');
        }
        encoded.push_str(&format!(
            "{}={}",
            percent_encoding::utf8_percent_encode(key, percent_encoding::NON_ALPHANUMERIC),
            percent_encoding::utf8_percent_encode(value, percent_encoding::NON_ALPHANUMERIC)
        ));
        encoded.into_bytes()
    } else {
        return Err(CrawlerError::AuthConfigError {
            message: format!("unsupported Content-Type `{content_type}` for body injection"),
        });
    };

    Ok(builder.body(new_bytes))
}

fn extract_from(body: &Value, path: &str) -> Result<String, CrawlerError> {
    let compiled = query::compile(path, &[]).map_err(|e| CrawlerError::AuthConfigError { message: e.to_string() })?;
    let result = query::run_single(&compiled, body, &std::collections::HashMap::new())
        .map_err(|e| CrawlerError::AuthError { kind: "token-extraction".to_string(), cause: e.to_string() })?;
    result
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| CrawlerError::AuthError {
            kind: "token-extraction".to_string(),
            cause: format!("`{path}` did not resolve to a string"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn none_auth_injects_nothing() {
        let auth = Authenticator::new(Client::new(), AuthConfig::None);
        assert!(auth.injection().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn basic_auth_encodes_credentials() {
        let auth = Authenticator::new(
            Client::new(),
            AuthConfig::Basic { username: "alice".to_string(), password: "secret".to_string() },
        );
        match auth.injection().await.unwrap() {
            Some(Injection::Header(name, value)) => {
                assert_eq!(name, "Authorization");
                assert!(value.starts_with("Basic "));
            }
            other => panic!("unexpected injection: {other:?}"),
        }
    }

    #[tokio::test]
    async fn bearer_auth_passes_token_through() {
        let auth = Authenticator::new(Client::new(), AuthConfig::Bearer { token: "tok123".to_string() });
        match auth.injection().await.unwrap() {
            Some(Injection::Header(_, value)) => assert_eq!(value, "Bearer tok123"),
            other => panic!("unexpected injection: {other:?}"),
        }
    }
}
