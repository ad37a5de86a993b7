//! HTTP collaborator: bearer-authenticated JSON requests against the admin backend.
//!
//! Every call site goes through [ApiClient::send], so a `401` maps to
//! [FeedError::Auth] uniformly.

use crate::error::FeedError;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_ERROR: &str = "server connection problem";

/// One request description; also used by feed kinds for HTTP-backed actions.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignInResponse {
    pub token: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A managed user as listed by `/api/users`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub product_key: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub product_key: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// JSON client for the admin backend.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, FeedError> {
        let http = reqwest::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Issue `request`; `token` is sent as a bearer credential when present.
    /// Returns the JSON body, or `Value::Null` for empty / 204 responses.
    /// A blank token is rejected as [FeedError::Auth] without touching the network.
    pub async fn send(&self, token: Option<&str>, request: &ApiRequest) -> Result<Value, FeedError> {
        if token.is_some_and(|t| t.trim().is_empty()) {
            return Err(FeedError::Auth("missing token".into()));
        }
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self.http.request(request.method.clone(), &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let resp = builder.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        tracing::debug!(method = %request.method, path = %request.path, status = status.as_u16(), "api response");

        if status == StatusCode::UNAUTHORIZED {
            return Err(FeedError::Auth("token expired or invalid".into()));
        }
        let body: Value = if text.trim().is_empty() {
            Value::Null
        } else if status.is_success() {
            serde_json::from_str(&text)?
        } else {
            serde_json::from_str(&text).unwrap_or(Value::Null)
        };
        if !status.is_success() {
            let message = body
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or(DEFAULT_ERROR)
                .to_string();
            return Err(FeedError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(body)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<SignInResponse, FeedError> {
        let body = self
            .send(
                None,
                &ApiRequest::post("/auth/signin", json!({"email": email, "password": password})),
            )
            .await?;
        Ok(serde_json::from_value(body)?)
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<Value, FeedError> {
        self.send(
            None,
            &ApiRequest::post("/auth/signup", json!({"email": email, "password": password})),
        )
        .await
    }

    pub async fn list_users(&self, token: &str) -> Result<Vec<User>, FeedError> {
        let body = self.send(Some(token), &ApiRequest::get("/api/users")).await?;
        list_field(body, "users")
    }

    pub async fn user_by_product_key(&self, token: &str, product_key: &str) -> Result<User, FeedError> {
        let key = require_key(product_key)?;
        let body = self
            .send(Some(token), &ApiRequest::get(format!("/api/user/product/{key}")))
            .await?;
        let user = body.get("user").cloned().unwrap_or(body);
        Ok(serde_json::from_value(user)?)
    }

    pub async fn delete_user(&self, token: &str, product_key: &str) -> Result<(), FeedError> {
        let key = require_key(product_key)?;
        self.send(Some(token), &ApiRequest::delete(format!("/api/user/product/{key}")))
            .await?;
        Ok(())
    }

    pub async fn list_products(&self, token: &str) -> Result<Vec<Product>, FeedError> {
        let body = self.send(Some(token), &ApiRequest::get("/products/all")).await?;
        list_field(body, "products")
    }

    pub async fn add_product(&self, token: &str, product_key: &str) -> Result<Value, FeedError> {
        let key = require_key(product_key)?;
        self.send(
            Some(token),
            &ApiRequest::post("/products/add", json!({"product_key": key})),
        )
        .await
    }

    pub async fn delete_product(&self, token: &str, product_key: &str) -> Result<(), FeedError> {
        let key = require_key(product_key)?;
        self.send(Some(token), &ApiRequest::delete(format!("/products/{key}")))
            .await?;
        Ok(())
    }
}

fn require_key(product_key: &str) -> Result<&str, FeedError> {
    let key = product_key.trim();
    if key.is_empty() {
        return Err(FeedError::Decode("product key required".into()));
    }
    Ok(key)
}

/// Accept either a bare array or `{ <field>: [...] }`.
fn list_field<T: serde::de::DeserializeOwned>(body: Value, field: &str) -> Result<Vec<T>, FeedError> {
    let list = match body {
        Value::Array(_) => body,
        Value::Object(mut map) => map.remove(field).unwrap_or(Value::Array(Vec::new())),
        Value::Null => Value::Array(Vec::new()),
        other => {
            return Err(FeedError::Decode(format!("expected list of {field}, got {other}")));
        }
    };
    Ok(serde_json::from_value(list)?)
}
