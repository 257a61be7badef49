use anyhow::{Context, anyhow};
use flowgate_core::RevisionId;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;

/// Server configuration loaded via environment variables. Engine tuning
/// lives in [`flowgate_core::EngineConfig`]; this covers the HTTP surface
/// and the static replica wiring.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    // Listener settings
    pub server_host: String,
    pub server_port: u16,

    /// Revision assumed when a request carries no revision headers.
    pub default_namespace: String,
    pub default_revision: String,

    /// Static replica sets per revision, seeded at startup. Discovery can
    /// replace them at runtime through the internal targets endpoint.
    pub backends: HashMap<String, Vec<String>>,

    /// Talk TLS to replicas on the dedicated HTTPS backend port.
    pub backend_tls: bool,

    /// Address replicas through their private service hostname instead of
    /// the pod address (passthrough load balancing).
    pub passthrough_lb: bool,

    /// Cap on buffered request bodies, bytes.
    pub max_body_bytes: usize,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8012".to_string())
                .parse()
                .unwrap_or(8012),

            default_namespace: env::var("FLOWGATE_DEFAULT_NAMESPACE")
                .unwrap_or_else(|_| "default".to_string()),
            default_revision: env::var("FLOWGATE_DEFAULT_REVISION")
                .unwrap_or_else(|_| "alu-bench".to_string()),

            backends: match env::var("FLOWGATE_BACKENDS") {
                Ok(raw) => parse_backends(&raw).context("failed to parse FLOWGATE_BACKENDS")?,
                Err(_) => HashMap::new(),
            },

            backend_tls: env::var("FLOWGATE_BACKEND_TLS")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),

            passthrough_lb: env::var("FLOWGATE_PASSTHROUGH_LB")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),

            max_body_bytes: env::var("FLOWGATE_MAX_BODY_BYTES")
                .unwrap_or_else(|_| "4194304".to_string())
                .parse()
                .unwrap_or(4 * 1024 * 1024),
        })
    }

    /// Seeded replica sets as `(revision, destinations)` pairs.
    pub fn seeded_targets(&self) -> anyhow::Result<Vec<(RevisionId, Vec<String>)>> {
        self.backends
            .iter()
            .map(|(key, dests)| Ok((parse_revision_key(key)?, dests.clone())))
            .collect()
    }
}

/// `FLOWGATE_BACKENDS` format: semicolon-separated entries, each
/// `namespace/revision=dest,dest`.
fn parse_backends(raw: &str) -> anyhow::Result<HashMap<String, Vec<String>>> {
    let mut backends = HashMap::new();
    for entry in raw.split(';').filter(|e| !e.trim().is_empty()) {
        let (key, dests) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("backend entry {entry:?} missing '='"))?;
        parse_revision_key(key.trim())?;
        let dests: Vec<String> = dests
            .split(',')
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();
        if dests.is_empty() {
            return Err(anyhow!("backend entry {entry:?} has no destinations"));
        }
        backends.insert(key.trim().to_string(), dests);
    }
    Ok(backends)
}

fn parse_revision_key(key: &str) -> anyhow::Result<RevisionId> {
    let (namespace, name) = key
        .split_once('/')
        .ok_or_else(|| anyhow!("revision key {key:?} must be namespace/name"))?;
    if namespace.is_empty() || name.is_empty() {
        return Err(anyhow!("revision key {key:?} must be namespace/name"));
    }
    Ok(RevisionId::new(namespace, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backends() {
        let backends = parse_backends(
            "default/alu-bench=10.0.0.1:8080,10.0.0.2:8080;prod/real-world-a=10.1.0.1:8080",
        )
        .unwrap();
        assert_eq!(
            backends.get("default/alu-bench").unwrap(),
            &vec!["10.0.0.1:8080".to_string(), "10.0.0.2:8080".to_string()]
        );
        assert_eq!(backends.get("prod/real-world-a").unwrap().len(), 1);
    }

    #[test]
    fn test_parse_backends_rejects_malformed() {
        assert!(parse_backends("no-equals-sign").is_err());
        assert!(parse_backends("missing-slash=10.0.0.1:8080").is_err());
        assert!(parse_backends("default/rev=").is_err());
    }

    #[test]
    fn test_revision_key() {
        let rev = parse_revision_key("default/alu-bench").unwrap();
        assert_eq!(rev.namespace, "default");
        assert_eq!(rev.name, "alu-bench");
        assert!(parse_revision_key("/missing").is_err());
    }
}
