//! Map service refresh
//!
//! After each run the published image service is restarted so it picks up
//! catalog changes. Refresh failures are reported, never fatal: committed
//! data stays valid whether or not the service restarts.

use crate::error::ServiceControlError;
use reqwest::blocking::Client;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

/// Result of a refresh attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Stop and start both succeeded
    Refreshed,

    /// No service configured
    Skipped,

    /// Stop or start failed
    Failed { reason: String },
}

impl fmt::Display for RefreshOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshOutcome::Refreshed => f.write_str("refreshed"),
            RefreshOutcome::Skipped => f.write_str("skipped"),
            RefreshOutcome::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// Stop/start control over the published service
pub trait ServiceControl {
    /// Human readable service identifier
    fn service_id(&self) -> String;

    fn stop(&self) -> Result<(), ServiceControlError>;

    fn start(&self) -> Result<(), ServiceControlError>;

    /// Stop then start. Start is attempted even when stop fails.
    fn refresh(&self) -> RefreshOutcome {
        let mut failures = Vec::new();

        match self.stop() {
            Ok(()) => info!("Service {} has been stopped", self.service_id()),
            Err(e) => {
                warn!("Unable to stop service {}: {}", self.service_id(), e);
                failures.push(e.to_string());
            }
        }
        match self.start() {
            Ok(()) => info!("Started service {}", self.service_id()),
            Err(e) => {
                warn!("Unable to start service {}: {}", self.service_id(), e);
                failures.push(e.to_string());
            }
        }

        if failures.is_empty() {
            RefreshOutcome::Refreshed
        } else {
            RefreshOutcome::Failed {
                reason: failures.join("; "),
            }
        }
    }
}

/// Used when no service endpoint is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopServiceControl;

impl ServiceControl for NoopServiceControl {
    fn service_id(&self) -> String {
        "none".to_string()
    }

    fn stop(&self) -> Result<(), ServiceControlError> {
        Ok(())
    }

    fn start(&self) -> Result<(), ServiceControlError> {
        Ok(())
    }

    fn refresh(&self) -> RefreshOutcome {
        RefreshOutcome::Skipped
    }
}

/// Identifies a service on an ArcGIS Server admin endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTarget {
    /// e.g. `https://gis.example.net/arcgis/admin`
    pub admin_url: String,
    pub folder: String,
    pub name: String,
    /// e.g. `ImageServer`
    pub service_type: String,
}

impl ServiceTarget {
    fn token_url(&self) -> String {
        format!("{}/generateToken", self.admin_url.trim_end_matches('/'))
    }

    fn action_url(&self, action: &str) -> String {
        format!(
            "{}/services/{}/{}.{}/{}",
            self.admin_url.trim_end_matches('/'),
            self.folder,
            self.name,
            self.service_type,
            action
        )
    }
}

impl fmt::Display for ServiceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.folder, self.name, self.service_type)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    #[serde(default)]
    messages: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
}

/// Token-authenticated stop/start against the ArcGIS Server admin API
pub struct ArcGisServiceControl {
    client: Client,
    target: ServiceTarget,
    username: String,
    password: String,
}

impl ArcGisServiceControl {
    pub fn new(
        target: ServiceTarget,
        username: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceControlError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceControlError::Token {
                url: target.token_url(),
                reason: format!("http client build failed: {e}"),
            })?;
        Ok(Self {
            client,
            target,
            username: username.into(),
            password: password.into(),
        })
    }

    pub fn target(&self) -> &ServiceTarget {
        &self.target
    }

    /// A fresh token per action; tokens are short lived
    fn token(&self) -> Result<String, ServiceControlError> {
        let url = self.target.token_url();
        let token_err = |reason: String| ServiceControlError::Token {
            url: url.clone(),
            reason,
        };

        let response: TokenResponse = self
            .client
            .post(&url)
            .form(&[
                ("f", "json"),
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
                ("client", "requestip"),
            ])
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| token_err(e.to_string()))?
            .json()
            .map_err(|e| token_err(format!("decode failed: {e}")))?;

        token_from(response).map_err(token_err)
    }

    fn act(&self, action: &'static str) -> Result<(), ServiceControlError> {
        let token = self.token()?;
        let request_err = |reason: String| ServiceControlError::Request {
            action,
            service: self.target.to_string(),
            reason,
        };

        let response: StatusResponse = self
            .client
            .post(self.target.action_url(action))
            .form(&[("token", token.as_str()), ("f", "json")])
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| request_err(e.to_string()))?
            .json()
            .map_err(|e| request_err(format!("decode failed: {e}")))?;

        check_status(action, &self.target, response)
    }
}

impl ServiceControl for ArcGisServiceControl {
    fn service_id(&self) -> String {
        self.target.to_string()
    }

    fn stop(&self) -> Result<(), ServiceControlError> {
        self.act("stop")
    }

    fn start(&self) -> Result<(), ServiceControlError> {
        self.act("start")
    }
}

fn token_from(response: TokenResponse) -> Result<String, String> {
    match response.token {
        Some(token) if !token.is_empty() => Ok(token),
        _ if !response.messages.is_empty() => Err(response.messages.join("; ")),
        _ => Err("response carried no token".to_string()),
    }
}

fn check_status(
    action: &'static str,
    target: &ServiceTarget,
    response: StatusResponse,
) -> Result<(), ServiceControlError> {
    if response.status == "success" {
        Ok(())
    } else {
        Err(ServiceControlError::Rejected {
            action,
            service: target.to_string(),
            status: response.status,
        })
    }
}
