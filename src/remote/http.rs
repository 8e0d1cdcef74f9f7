//! HTTP transfer client
//!
//! Two addressing modes:
//! - `Direct`: the origin is an HTTP(S) server with auto-index directory
//!   pages; listings are scraped from `href` attributes.
//! - `Proxy`: a relay endpoint fronts the origin (which may be FTP). Listings
//!   come from `<proxy>?directory=<origin><dir>/` as a comma-separated list of
//!   names, downloads from `<proxy>?url=<origin><path>`.

use super::{RemoteSource, TransferClient};
use crate::error::{TransferError, TransferResult};
use regex::Regex;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

static HREF_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)href\s*=\s*"([^"]+)""#).expect("Invalid href regex"));

/// How requests reach the origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferMode {
    /// Talk to the origin directly
    Direct,

    /// Relay every request through a proxy endpoint
    Proxy { endpoint: String },
}

/// Blocking HTTP client for a remote archive
#[derive(Debug, Clone)]
pub struct HttpTransferClient {
    client: Client,
    origin: String,
    mode: TransferMode,
    credentials: Option<(String, String)>,
}

impl HttpTransferClient {
    /// Create a client for `source`
    ///
    /// Direct mode requires an http(s) origin; other schemes need a proxy.
    pub fn new(
        source: &RemoteSource,
        mode: TransferMode,
        timeout: Duration,
    ) -> TransferResult<Self> {
        let origin = match source {
            RemoteSource::Url { origin, .. } => origin.clone(),
            RemoteSource::Local { root } => {
                return Err(TransferError::InvalidSource {
                    source_url: root.display().to_string(),
                    reason: "local sources are read with the mirror client".into(),
                })
            }
        };

        if mode == TransferMode::Direct && !source.is_http() {
            return Err(TransferError::InvalidSource {
                source_url: source.to_string(),
                reason: "only http(s) origins can be read directly; configure a proxy".into(),
            });
        }

        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| TransferError::ConnectionFailed {
                host: origin.clone(),
                reason: format!("http client build failed: {e}"),
            })?;

        Ok(Self {
            client,
            origin,
            mode,
            credentials: None,
        })
    }

    /// Authenticate direct requests with HTTP basic auth
    pub fn with_credentials(
        mut self,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((user.into(), password.into()));
        self
    }

    /// Origin URL this client reads from
    pub fn origin(&self) -> &str {
        &self.origin
    }

    fn origin_url(&self, path: &str) -> String {
        format!("{}/{}", self.origin, path.trim_start_matches('/'))
    }

    fn directory_request(&self, path: &str) -> RequestBuilder {
        let target = format!("{}/", self.origin_url(path).trim_end_matches('/'));
        match &self.mode {
            TransferMode::Direct => self.authed(self.client.get(target)),
            TransferMode::Proxy { endpoint } => {
                self.client.get(endpoint).query(&[("directory", target)])
            }
        }
    }

    fn file_request(&self, path: &str) -> RequestBuilder {
        let target = self.origin_url(path);
        match &self.mode {
            TransferMode::Direct => self.authed(self.client.get(target)),
            TransferMode::Proxy { endpoint } => self.client.get(endpoint).query(&[("url", target)]),
        }
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, Some(password)),
            None => request,
        }
    }

    fn send(&self, request: RequestBuilder, path: &str, listing: bool) -> TransferResult<Response> {
        let response = request
            .send()
            .map_err(|e| self.map_request_error(e, path, listing))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(TransferError::NotFound {
                path: path.to_string(),
            });
        }
        if !status.is_success() {
            return Err(TransferError::Status {
                url: response.url().to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    fn map_request_error(&self, e: reqwest::Error, path: &str, listing: bool) -> TransferError {
        if e.is_timeout() {
            TransferError::Timeout {
                path: path.to_string(),
            }
        } else if e.is_connect() {
            TransferError::ConnectionFailed {
                host: self.origin.clone(),
                reason: e.to_string(),
            }
        } else if listing {
            TransferError::ListFailed {
                path: path.to_string(),
                reason: e.to_string(),
            }
        } else {
            TransferError::DownloadFailed {
                path: path.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

impl TransferClient for HttpTransferClient {
    fn list_directory(&self, path: &str) -> TransferResult<Vec<String>> {
        let response = self.send(self.directory_request(path), path, true)?;
        let body = response.text().map_err(|e| TransferError::ListFailed {
            path: path.to_string(),
            reason: e.to_string(),
        })?;

        let names = match self.mode {
            TransferMode::Direct => parse_index_page(&body),
            TransferMode::Proxy { .. } => parse_proxy_listing(&body),
        };
        debug!("Listed {} entries under {}", names.len(), path);
        Ok(names)
    }

    fn download(&self, remote: &str, local: &Path) -> TransferResult<u64> {
        let mut response = self.send(self.file_request(remote), remote, false)?;

        let local_err = |e: std::io::Error| TransferError::LocalWrite {
            path: local.to_path_buf(),
            reason: e.to_string(),
        };
        let mut file = File::create(local).map_err(local_err)?;
        let bytes = response
            .copy_to(&mut file)
            .map_err(|e| TransferError::DownloadFailed {
                path: remote.to_string(),
                reason: e.to_string(),
            })?;
        file.flush().map_err(local_err)?;

        Ok(bytes)
    }
}

/// Names from a proxy listing body: `a.tif,b.tif,...`
pub(crate) fn parse_proxy_listing(body: &str) -> Vec<String> {
    body.split(',')
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .map(|name| name.rsplit('/').next().unwrap_or(name).to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Names linked from an auto-index page, skipping sort links, parents and
/// subdirectories
pub(crate) fn parse_index_page(body: &str) -> Vec<String> {
    let mut names: Vec<String> = HREF_REGEX
        .captures_iter(body)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .filter(|href| !href.starts_with('?') && !href.starts_with('#') && !href.ends_with('/'))
        .filter_map(|href| href.rsplit('/').next())
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(str::to_string)
        .collect();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> RemoteSource {
        RemoteSource::parse("ftp://arthurhou.pps.eosdis.nasa.gov/data/imerg/gis").unwrap()
    }

    #[test]
    fn test_proxy_listing() {
        let body = "3B-HHR-L.a.30min.tif, 3B-HHR-L.b.30min.tif,,README\n";
        assert_eq!(
            parse_proxy_listing(body),
            vec!["3B-HHR-L.a.30min.tif", "3B-HHR-L.b.30min.tif", "README"]
        );
        assert!(parse_proxy_listing("").is_empty());
    }

    #[test]
    fn test_index_page() {
        let body = r#"<html><body>
            <a href="?C=N;O=D">Name</a>
            <a href="../">Parent Directory</a>
            <a href="early/">early/</a>
            <a href="3B-HHR-L.a.30min.tif">3B-HHR-L.a.30min.tif</a>
            <A HREF="/data/imerg/gis/2018/08/3B-HHR-L.b.30min.tif">b</A>
        </body></html>"#;
        assert_eq!(
            parse_index_page(body),
            vec!["3B-HHR-L.a.30min.tif", "3B-HHR-L.b.30min.tif"]
        );
    }

    #[test]
    fn test_direct_mode_rejects_ftp() {
        let err = HttpTransferClient::new(&source(), TransferMode::Direct, Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidSource { .. }));
    }

    #[test]
    fn test_proxy_requests() {
        let client = HttpTransferClient::new(
            &source(),
            TransferMode::Proxy {
                endpoint: "https://proxy.example.net/ProxyFTP.aspx".into(),
            },
            Duration::from_secs(5),
        )
        .unwrap();

        let request = client
            .directory_request("/data/imerg/gis/2018/08")
            .build()
            .unwrap();
        let pairs: Vec<(String, String)> = request
            .url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![(
                "directory".to_string(),
                "ftp://arthurhou.pps.eosdis.nasa.gov/data/imerg/gis/2018/08/".to_string()
            )]
        );

        let request = client.file_request("/data/imerg/gis/2018/08/a.tif").build().unwrap();
        let (key, value) = request.url().query_pairs().next().unwrap();
        assert_eq!(key, "url");
        assert_eq!(value, "ftp://arthurhou.pps.eosdis.nasa.gov/data/imerg/gis/2018/08/a.tif");
    }

    #[test]
    fn test_local_source_rejected() {
        let local = RemoteSource::parse("/mnt/mirror").unwrap();
        let client = HttpTransferClient::new(&local, TransferMode::Direct, Duration::from_secs(1));
        assert!(client.is_err());
    }
}
