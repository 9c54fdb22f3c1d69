//! `AzureAadCredential` — obtains and caches access tokens for an Entra ID
//! tenant, either via the client-credentials grant (service principal) or by
//! driving the interactive username/password/MFA form flow a load-test
//! client would otherwise need a real browser for.
//!
//! Grounded line-for-line in `aad.py`'s `AzureAadCredential`: same retry
//! constants, same default expiry fallback, same PKCE derivation. The
//! signature-blind JWT `exp` read is intentional — the original never
//! verifies the token, only reads when it expires, so this port doesn't
//! either.

use std::cell::Cell;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use regex::Regex;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use totp_rs::{Algorithm, Secret, TOTP};

use super::webserver::AzureAadWebserver;

/// Token expiry the original falls back to when a JWT payload can't be
/// decoded — not a guess, the fixed constant `aad.py` itself uses.
const DEFAULT_EXPIRES_IN_SECONDS: i64 = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    Client,
    User,
}

impl AuthMethod {
    pub fn from_string(value: &str) -> Self {
        match value.trim().to_uppercase().as_str() {
            "CLIENT" => Self::Client,
            "USER" => Self::User,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    Header,
    Cookie,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("HTTP request to Entra ID failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to parse Entra ID response: {0}")]
    Parse(String),
    #[error("multi-factor authentication failed: {0}")]
    Mfa(String),
    #[error("authentication flow error: {0}")]
    Flow(String),
    #[error("invalid credential configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub value: String,
    pub expires_on: i64,
}

impl AccessToken {
    fn is_expired(&self, now: i64) -> bool {
        // Treat a token as stale 30s before its real expiry, the same margin
        // a load-test run's request cadence would otherwise race against.
        now >= self.expires_on - 30
    }
}

#[derive(Debug, Clone)]
pub struct AzureAadCredentialConfig {
    pub tenant: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub totp_secret: Option<String>,
    pub redirect: Option<String>,
    pub initialize: Option<String>,
    pub auth_method: AuthMethod,
    pub auth_type: AuthType,
}

pub struct AzureAadCredential {
    config: AzureAadCredentialConfig,
    http: reqwest::Client,
    token: Option<AccessToken>,
    refreshed: Cell<bool>,
}

struct AuthorizationResult {
    code: Option<String>,
    verifier: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl AzureAadCredential {
    pub fn new(config: AzureAadCredentialConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::builder()
                .cookie_store(true)
                .build()
                .expect("building the Entra ID HTTP client must not fail"),
            token: None,
            refreshed: Cell::new(false),
        }
    }

    /// The tenant segment may already be a full authority URL
    /// (`https://login.microsoftonline.com/<tenant>`) or a bare tenant
    /// id/domain — both are accepted, matching `get_tenant`.
    pub fn get_tenant(&self) -> String {
        self.config
            .tenant
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or(&self.config.tenant)
            .to_string()
    }

    fn authority(&self) -> String {
        format!("https://login.microsoftonline.com/{}", self.get_tenant())
    }

    /// Reads `access_token()`, then resets the one-shot flag — the same
    /// read-and-clear semantics as the Python `refreshed` property.
    pub fn refreshed(&self) -> bool {
        let value = self.refreshed.get();
        self.refreshed.set(false);
        value
    }

    pub fn access_token(&self) -> Option<&AccessToken> {
        self.token.as_ref()
    }

    /// Decode the `exp` claim out of a JWT's payload segment without
    /// verifying its signature. Any failure (malformed base64, missing
    /// segment, non-numeric claim) falls back to `now + 3000s`, exactly as
    /// `get_expires_on` does.
    fn get_expires_on(id_token: &str) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let decode = || -> Option<i64> {
            let payload_segment = id_token.split('.').nth(1)?;
            let decoded = URL_SAFE_NO_PAD.decode(payload_segment).ok()?;
            let value: Value = serde_json::from_slice(&decoded).ok()?;
            value.get("exp")?.as_i64()
        };

        decode().unwrap_or(now + DEFAULT_EXPIRES_IN_SECONDS)
    }

    /// `generate_pkcs`: a URL-safe base64 verifier derived from 96 random
    /// bytes (truncated to 128 characters) and its SHA-256 challenge.
    fn generate_pkce() -> (String, String) {
        let mut bytes = [0u8; 96];
        rand::thread_rng().fill_bytes(&mut bytes);
        let verifier = URL_SAFE_NO_PAD.encode(bytes);
        let verifier: String = verifier.chars().take(128).collect();

        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

        (verifier, challenge)
    }

    fn totp_code(secret: &str) -> Result<String, AuthError> {
        let totp = TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            30,
            Secret::Encoded(secret.to_string())
                .to_bytes()
                .map_err(|e| AuthError::Mfa(format!("invalid TOTP secret: {e:?}")))?,
        )
        .map_err(|e| AuthError::Mfa(format!("could not build TOTP generator: {e}")))?;

        totp.generate_current()
            .map_err(|e| AuthError::Mfa(format!("could not compute TOTP code: {e}")))
    }

    /// Scrapes the `Config={...};` JSON blob Entra ID's sign-in page embeds
    /// inline, the same object `re.search(r"Config=({.+});", body)` pulls
    /// out in the Python flow.
    fn scrape_config_blob(body: &str) -> Result<Value, AuthError> {
        let re = Regex::new(r"Config=(\{.+?\});").map_err(|e| AuthError::Parse(e.to_string()))?;
        let captures = re
            .captures(body)
            .ok_or_else(|| AuthError::Parse("Config={...}; blob not found in sign-in page".into()))?;
        serde_json::from_str(&captures[1]).map_err(|e| AuthError::Parse(format!("Config blob is not valid JSON: {e}")))
    }

    /// Extracts `action`/`id_token`/`client_info`/`state`/`session_state`
    /// from an auto-submitting HTML form-post response — the Rust
    /// counterpart of `FormPostParser`, built on `scraper` rather than a
    /// hand-rolled `HTMLParser` subclass.
    fn parse_form_post(body: &str) -> Result<HashMap<String, String>, AuthError> {
        let document = Html::parse_document(body);
        let form_selector = Selector::parse("form").expect("static selector is valid");
        let input_selector = Selector::parse("input").expect("static selector is valid");

        let form = document
            .select(&form_selector)
            .next()
            .ok_or_else(|| AuthError::Parse("form-post response has no <form> element".into()))?;

        let mut fields = HashMap::new();
        if let Some(action) = form.value().attr("action") {
            fields.insert("action".to_string(), action.to_string());
        }
        for input in form.select(&input_selector) {
            let (Some(name), Some(value)) = (input.value().attr("name"), input.value().attr("value")) else {
                continue;
            };
            if matches!(name, "id_token" | "client_info" | "state" | "session_state") {
                fields.insert(name.to_string(), value.to_string());
            }
        }

        Ok(fields)
    }

    /// Drives the interactive sign-in flow: builds the PKCE-protected
    /// authorization request, walks the username/password/MFA form
    /// sequence, and ends either with a `code` (externally captured
    /// redirect) or an `id_token` (cookie/form-post fallback).
    async fn get_oauth_authorization(&self) -> Result<AuthorizationResult, AuthError> {
        let username = self
            .config
            .username
            .as_deref()
            .ok_or_else(|| AuthError::Config("USER auth method requires a username".into()))?;
        let password = self
            .config
            .password
            .as_deref()
            .ok_or_else(|| AuthError::Config("USER auth method requires a password".into()))?;

        let (verifier, challenge) = Self::generate_pkce();

        let webserver = if self.config.redirect.is_none() && self.config.initialize.is_none() {
            Some(AzureAadWebserver::start().await.map_err(|e| AuthError::Flow(e.to_string()))?)
        } else {
            None
        };
        let redirect_uri = match (&webserver, &self.config.redirect) {
            (Some(server), _) => server.redirect_uri(),
            (None, Some(redirect)) => redirect.clone(),
            (None, None) => {
                return Err(AuthError::Config(
                    "no redirect URI available and no ephemeral webserver was started".into(),
                ))
            }
        };

        let authorize_url = self.config.initialize.clone().unwrap_or_else(|| {
            format!(
                "{}/oauth2/v2.0/authorize?client_id={}&response_type=code&redirect_uri={}&code_challenge={}&code_challenge_method=S256",
                self.authority(),
                self.config.client_id,
                redirect_uri,
                challenge,
            )
        });

        let signin_page = self.http.get(&authorize_url).send().await?.text().await?;
        let config = Self::scrape_config_blob(&signin_page)?;

        let flow_token = config
            .get("sFT")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::Parse("sign-in page Config blob has no sFT flow token".into()))?
            .to_string();
        let canary = config.get("canary").and_then(Value::as_str).unwrap_or_default().to_string();
        let post_url = config
            .get("urlPost")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::Parse("sign-in page Config blob has no urlPost".into()))?
            .to_string();

        let mut form: HashMap<&str, String> = HashMap::new();
        form.insert("login", username.to_string());
        form.insert("passwd", password.to_string());
        form.insert("flowToken", flow_token.clone());
        form.insert("canary", canary.clone());

        let credential_response = self.http.post(&post_url).form(&form).send().await?;
        let body = credential_response.text().await?;

        let body = if body.contains("arrUserProofs") {
            self.complete_mfa(&body).await?
        } else {
            body
        };

        if let Some(fragment_start) = body.find("#code=") {
            let fragment = &body[fragment_start + 1..];
            let code = fragment
                .split('&')
                .find_map(|pair| pair.strip_prefix("code="))
                .map(str::to_string);
            return Ok(AuthorizationResult { code, verifier: Some(verifier) });
        }

        let fields = Self::parse_form_post(&body)?;
        if fields.contains_key("id_token") {
            return Ok(AuthorizationResult { code: None, verifier: None });
        }

        Err(AuthError::Flow("sign-in flow ended without a code or id_token".into()))
    }

    /// `BeginAuth`/`EndAuth` TOTP exchange, triggered once the credential
    /// POST response signals an MFA challenge (`arrUserProofs` present).
    async fn complete_mfa(&self, body: &str) -> Result<String, AuthError> {
        let secret = self
            .config
            .totp_secret
            .as_deref()
            .ok_or_else(|| AuthError::Mfa("MFA was required but no TOTP secret is configured".into()))?;

        let config = Self::scrape_config_blob(body)?;
        let flow_token = config
            .get("sFT")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::Mfa("MFA challenge page has no sFT flow token".into()))?
            .to_string();

        let begin_auth: Value = self
            .http
            .post("https://login.microsoftonline.com/common/SAS/BeginAuth")
            .json(&serde_json::json!({ "AuthMethodId": "OneWaySMS", "Method": "BeginAuth", "FlowToken": flow_token }))
            .send()
            .await?
            .json()
            .await?;

        let session_id = begin_auth
            .get("SessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::Mfa("BeginAuth response has no SessionId".into()))?;
        let mfa_flow_token = begin_auth
            .get("FlowToken")
            .and_then(Value::as_str)
            .unwrap_or(&flow_token);

        let code = Self::totp_code(secret)?;

        let end_auth: Value = self
            .http
            .post("https://login.microsoftonline.com/common/SAS/EndAuth")
            .json(&serde_json::json!({
                "AuthMethodId": "OneWaySMS",
                "Method": "EndAuth",
                "SessionId": session_id,
                "FlowToken": mfa_flow_token,
                "AdditionalAuthData": code,
            }))
            .send()
            .await?
            .json()
            .await?;

        if end_auth.get("ErrorCode").and_then(Value::as_i64).unwrap_or(0) != 0 {
            return Err(AuthError::Mfa(format!(
                "EndAuth rejected the TOTP code: {}",
                end_auth.get("Message").and_then(Value::as_str).unwrap_or("unknown error")
            )));
        }

        Ok(end_auth.to_string())
    }

    async fn get_oauth_token(&self, authorization: &AuthorizationResult) -> Result<AccessToken, AuthError> {
        let token_url = format!("{}/oauth2/v2.0/token", self.authority());

        let mut form: HashMap<&str, String> = HashMap::new();
        form.insert("client_id", self.config.client_id.clone());

        match (&authorization.code, &authorization.verifier) {
            (Some(code), Some(verifier)) => {
                form.insert("grant_type", "authorization_code".to_string());
                form.insert("code", code.clone());
                form.insert("code_verifier", verifier.clone());
                if let Some(redirect) = &self.config.redirect {
                    form.insert("redirect_uri", redirect.clone());
                }
            }
            _ => {
                form.insert("grant_type", "client_credentials".to_string());
                form.insert(
                    "client_secret",
                    self.config
                        .client_secret
                        .clone()
                        .ok_or_else(|| AuthError::Config("CLIENT auth method requires a client secret".into()))?,
                );
                form.insert("scope", format!("{}/.default", self.config.client_id));
            }
        }

        let response: TokenResponse = self.http.post(&token_url).form(&form).send().await?.json().await?;

        let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0);
        let expires_on = response
            .expires_in
            .map(|s| now + s)
            .unwrap_or_else(|| Self::get_expires_on(&response.access_token));

        Ok(AccessToken { value: response.access_token, expires_on })
    }

    /// Returns a valid token, reusing the cached one while it has more than
    /// 30s left, otherwise driving the configured auth method's flow and
    /// caching the result. Sets the one-shot `refreshed` flag whenever a new
    /// token was actually obtained.
    pub async fn get_token(&mut self) -> Result<AccessToken, AuthError> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0);

        if let Some(token) = &self.token {
            if !token.is_expired(now) {
                self.refreshed.set(false);
                return Ok(token.clone());
            }
        }

        let token = match self.config.auth_method {
            AuthMethod::None => return Err(AuthError::Config("no auth method configured".into())),
            AuthMethod::Client => {
                self.get_oauth_token(&AuthorizationResult { code: None, verifier: None }).await?
            }
            AuthMethod::User => {
                let authorization = self.get_oauth_authorization().await?;
                self.get_oauth_token(&authorization).await?
            }
        };

        self.token = Some(token.clone());
        self.refreshed.set(true);
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_method_from_string_is_case_insensitive() {
        assert_eq!(AuthMethod::from_string("client"), AuthMethod::Client);
        assert_eq!(AuthMethod::from_string("USER"), AuthMethod::User);
        assert_eq!(AuthMethod::from_string("nonsense"), AuthMethod::None);
    }

    #[test]
    fn expires_on_falls_back_to_default_on_malformed_token() {
        let before = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
        let expires = AzureAadCredential::get_expires_on("not-a-jwt");
        assert!(expires >= before + DEFAULT_EXPIRES_IN_SECONDS);
    }

    #[test]
    fn expires_on_decodes_exp_claim_from_valid_jwt() {
        let header = URL_SAFE_NO_PAD.encode(b"{\"alg\":\"none\"}");
        let payload = URL_SAFE_NO_PAD.encode(b"{\"exp\":1999999999}");
        let token = format!("{header}.{payload}.");
        assert_eq!(AzureAadCredential::get_expires_on(&token), 1999999999);
    }

    #[test]
    fn pkce_challenge_is_derived_from_verifier() {
        let (verifier, challenge) = AzureAadCredential::generate_pkce();
        assert!(verifier.len() <= 128);
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        assert_eq!(challenge, URL_SAFE_NO_PAD.encode(hasher.finalize()));
    }

    #[test]
    fn scrape_config_blob_extracts_embedded_json() {
        let page = r#"<script>var foo = 1; Config={"sFT":"abc","canary":"xyz","urlPost":"/post"}; more=2;</script>"#;
        let config = AzureAadCredential::scrape_config_blob(page).unwrap();
        assert_eq!(config.get("sFT").unwrap(), "abc");
    }

    #[test]
    fn parse_form_post_extracts_named_fields() {
        let body = r#"
            <html><body>
            <form action="https://example.com/callback" method="post">
                <input type="hidden" name="id_token" value="token-value" />
                <input type="hidden" name="state" value="state-value" />
            </form>
            </body></html>
        "#;
        let fields = AzureAadCredential::parse_form_post(body).unwrap();
        assert_eq!(fields.get("id_token").unwrap(), "token-value");
        assert_eq!(fields.get("action").unwrap(), "https://example.com/callback");
    }

    #[test]
    fn get_tenant_strips_authority_prefix() {
        let config = AzureAadCredentialConfig {
            tenant: "https://login.microsoftonline.com/contoso.onmicrosoft.com".to_string(),
            client_id: "id".to_string(),
            client_secret: None,
            username: None,
            password: None,
            totp_secret: None,
            redirect: None,
            initialize: None,
            auth_method: AuthMethod::Client,
            auth_type: AuthType::Header,
        };
        let credential = AzureAadCredential::new(config);
        assert_eq!(credential.get_tenant(), "contoso.onmicrosoft.com");
    }
}
