//! HashiCorp Vault transit-export key provider.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::{KeyProvider, ProviderError};

/// Fetches key material from a Vault transit engine's export endpoint,
/// caching the bytes per instance after the first fetch.
pub struct VaultProvider {
    client: reqwest::Client,
    addr: String,
    transit_path: String,
    key: String,
    version: String,
    token: String,
    namespace: Option<String>,
    public_key: Mutex<Option<Vec<u8>>>,
    private_key: Mutex<Option<Vec<u8>>>,
}

impl VaultProvider {
    pub fn new(
        addr: &str,
        transit_path: &str,
        key: &str,
        version: Option<&str>,
        token: &str,
        namespace: Option<&str>,
    ) -> Self {
        let version = match version {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => "latest".to_string(),
        };

        VaultProvider {
            client: reqwest::Client::new(),
            addr: addr.trim_end_matches('/').to_string(),
            transit_path: transit_path.trim_matches('/').to_string(),
            key: key.to_string(),
            version,
            token: token.to_string(),
            namespace: namespace.map(String::from),
            public_key: Mutex::new(None),
            private_key: Mutex::new(None),
        }
    }

    async fn fetch_key(&self, key_type: &str) -> Result<Vec<u8>, ProviderError> {
        let url = format!(
            "{}/v1/{}/export/{}/{}/{}",
            self.addr, self.transit_path, key_type, self.key, self.version
        );
        debug!(%url, "requesting key from vault");

        let mut request = self.client.get(&url).header("X-Vault-Token", &self.token);
        if let Some(namespace) = &self.namespace {
            request = request.header("X-Vault-Namespace", namespace);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ProviderError::Response(format!(
                "vault returned {} for {key_type}",
                response.status()
            )));
        }

        let body: Value = response.json().await?;
        let key = body
            .pointer("/data/keys/1")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ProviderError::Response("response is missing data.keys.1".to_string())
            })?;

        Ok(key.as_bytes().to_vec())
    }
}

#[async_trait]
impl KeyProvider for VaultProvider {
    async fn public_key(&self) -> Result<Vec<u8>, ProviderError> {
        let mut cached = self.public_key.lock().await;
        if let Some(key) = cached.as_ref() {
            return Ok(key.clone());
        }

        let key = self.fetch_key("public-key").await?;
        *cached = Some(key.clone());
        Ok(key)
    }

    async fn private_key(&self) -> Result<Vec<u8>, ProviderError> {
        let mut cached = self.private_key.lock().await;
        if let Some(key) = cached.as_ref() {
            return Ok(key.clone());
        }

        let key = self.fetch_key("encryption-key").await?;
        *cached = Some(key.clone());
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;

    use super::*;

    /// Minimal one-shot HTTP server that records the request line and
    /// headers and answers with the given body.
    fn serve_once(body: &'static str, status: &'static str) -> (String, std::thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).unwrap();
            request
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn fetches_and_caches_the_exported_key() {
        let (addr, handle) =
            serve_once(r#"{"data":{"keys":{"1":"-----BEGIN PUBLIC KEY-----"}}}"#, "200 OK");

        let provider = VaultProvider::new(
            &addr,
            "/transit/",
            "mykey",
            None,
            "root-token",
            Some("team-a"),
        );

        let key = provider.public_key().await.unwrap();
        assert_eq!(key, b"-----BEGIN PUBLIC KEY-----");

        let request = handle.join().unwrap();
        assert!(request.starts_with("GET /v1/transit/export/public-key/mykey/latest"));
        assert!(request.contains("x-vault-token: root-token"));
        assert!(request.contains("x-vault-namespace: team-a"));

        // The listener is gone; a second fetch only works via the cache.
        let again = provider.public_key().await.unwrap();
        assert_eq!(again, key);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let (addr, handle) = serve_once(r#"{"errors":["permission denied"]}"#, "403 Forbidden");

        let provider = VaultProvider::new(&addr, "transit", "mykey", Some("2"), "token", None);
        let err = provider.private_key().await.unwrap_err();
        assert!(matches!(err, ProviderError::Response(_)));

        let request = handle.join().unwrap();
        assert!(request.starts_with("GET /v1/transit/export/encryption-key/mykey/2"));
    }

    #[tokio::test]
    async fn missing_key_entry_is_an_error() {
        let (addr, _handle) = serve_once(r#"{"data":{"keys":{}}}"#, "200 OK");

        let provider = VaultProvider::new(&addr, "transit", "mykey", None, "token", None);
        let err = provider.public_key().await.unwrap_err();
        assert!(err.to_string().contains("data.keys.1"));
    }
}
