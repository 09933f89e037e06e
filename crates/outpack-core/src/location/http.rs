use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use outpack_domain::{Hash, MetadataCore, OutpackError, PacketFile, PacketLocation};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use url::Url;

const PACKIT_API_PATH: &str = "packit/api/outpack/";

/// A location served over the outpack HTTP API, either directly or behind
/// Packit.
#[derive(Debug)]
pub struct HttpDriver {
    name: String,
    base: Url,
    token: Option<String>,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    data: Option<T>,
    #[serde(default)]
    errors: Option<Vec<ApiError>>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: String,
    #[serde(default)]
    detail: Option<String>,
}

impl ApiError {
    fn describe(errors: &[Self]) -> String {
        errors
            .iter()
            .map(|err| match &err.detail {
                Some(detail) => format!("{}: {detail}", err.error),
                None => err.error.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl HttpDriver {
    pub fn http(name: &str, url: &str, token: Option<String>) -> Result<Self> {
        Self::new(name, url, token)
    }

    /// Packit serves the outpack API under `packit/api/outpack`.
    pub fn packit(name: &str, url: &str, token: Option<String>) -> Result<Self> {
        let base = format!("{}/{PACKIT_API_PATH}", url.trim_end_matches('/'));
        Self::new(name, &base, token)
    }

    fn new(name: &str, url: &str, token: Option<String>) -> Result<Self> {
        let mut base = Url::parse(url).map_err(|err| OutpackError::InvalidLocation {
            name: name.to_string(),
            reason: format!("invalid url '{url}': {err}"),
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .user_agent(format!("outpack/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            name: name.to_string(),
            base,
            token,
            client,
        })
    }

    fn transport(&self, reason: impl Into<String>) -> OutpackError {
        OutpackError::Transport {
            location: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self
            .base
            .join(path)
            .with_context(|| format!("failed to build url for '{path}'"))?;
        let request = self.client.request(method, url);
        Ok(match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }

    fn send(&self, request: RequestBuilder, path: &str) -> Result<Response> {
        let response = request
            .send()
            .map_err(|err| self.transport(format!("request to '{path}' failed: {err}")))?;
        let status = response.status();
        if status.is_success() {
            debug!(location = %self.name, path, %status, "http request");
            return Ok(response);
        }
        let detail = response
            .json::<Envelope<serde_json::Value>>()
            .ok()
            .and_then(|envelope| envelope.errors)
            .map(|errors| ApiError::describe(&errors))
            .unwrap_or_default();
        Err(self
            .transport(format!("'{path}' returned {status} {detail}").trim_end().to_string())
            .into())
    }

    fn send_checked(&self, response: Response, path: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(self.transport(format!("'{path}' returned {status}")).into())
        }
    }

    fn decode<T: DeserializeOwned>(&self, response: Response, path: &str) -> Result<T> {
        let envelope: Envelope<T> = response
            .json()
            .map_err(|err| self.transport(format!("invalid response from '{path}': {err}")))?;
        if envelope.status != "success" {
            let detail = envelope
                .errors
                .as_deref()
                .map(ApiError::describe)
                .unwrap_or_default();
            return Err(self
                .transport(format!("'{path}' reported {}: {detail}", envelope.status))
                .into());
        }
        envelope
            .data
            .ok_or_else(|| self.transport(format!("'{path}' returned no data")).into())
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(self.request(Method::GET, path)?, path)?;
        self.decode(response, path)
    }

    fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self.send(self.request(Method::POST, path)?.json(body), path)?;
        self.decode(response, path)
    }
}

impl super::LocationDriver for HttpDriver {
    fn list(&self) -> Result<BTreeMap<String, PacketLocation>> {
        let records: Vec<PacketLocation> = self.get_json("metadata/list")?;
        Ok(records
            .into_iter()
            .map(|record| (record.packet.clone(), record))
            .collect())
    }

    fn metadata(&self, ids: &[String]) -> Result<BTreeMap<String, String>> {
        let mut found = BTreeMap::new();
        for id in ids {
            let path = format!("metadata/{id}/text");
            let response = self.send(self.request(Method::GET, &path)?, &path)?;
            let text = response
                .text()
                .map_err(|err| self.transport(format!("failed to read '{path}': {err}")))?;
            found.insert(id.clone(), text);
        }
        Ok(found)
    }

    fn fetch_file(&self, _packet: &MetadataCore, file: &PacketFile, dest: &Path) -> Result<()> {
        let path = format!("file/{}", file.hash);
        let response = self
            .request(Method::GET, &path)?
            .send()
            .map_err(|err| self.transport(format!("request to '{path}' failed: {err}")))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(OutpackError::HashNotFound(file.hash.clone()).into());
        }
        let mut response = self.send_checked(response, &path)?;
        let mut out =
            File::create(dest).with_context(|| format!("failed to create {}", dest.display()))?;
        response
            .copy_to(&mut out)
            .map_err(|err| self.transport(format!("failed to download '{path}': {err}")))?;
        Ok(())
    }

    fn list_unknown_packets(&self, ids: &[String]) -> Result<Vec<String>> {
        self.post_json("packets/missing", &json!({ "ids": ids, "unpacked": true }))
    }

    fn list_unknown_files(&self, hashes: &[Hash]) -> Result<Vec<Hash>> {
        self.post_json("files/missing", &json!({ "hashes": hashes }))
    }

    fn push_file(&self, path: &Path, hash: &Hash) -> Result<()> {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let endpoint = format!("file/{hash}");
        let request = self
            .request(Method::POST, &endpoint)?
            .header("Content-Type", "application/octet-stream")
            .body(file);
        self.send(request, &endpoint)?;
        Ok(())
    }

    fn push_metadata(&self, path: &Path, hash: &Hash) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let endpoint = format!("packet/{hash}");
        let request = self
            .request(Method::POST, &endpoint)?
            .header("Content-Type", "text/plain")
            .body(text);
        self.send(request, &endpoint)?;
        Ok(())
    }
}
