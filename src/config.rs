// Node configuration, loaded from JSON by the binary and by operators'
// provisioning tooling.

use rustls::Certificate;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::common::parse_address;
use crate::endpoint::{Endpoint, Scheme};
use crate::error::Error;
use crate::network::http::{load_tls_identity, HttpConfig};
use crate::node::Validator;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub network_id: String,
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    pub bind: Endpoint,
    #[serde(default)]
    pub publish: Option<Endpoint>,
    pub validators: Vec<ValidatorConfig>,
    #[serde(default)]
    pub tls_cert_file: Option<String>,
    #[serde(default)]
    pub tls_key_file: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub write_timeout_ms: u64,
}

fn default_threshold() -> u32 {
    66
}

fn default_timeout_ms() -> u64 {
    10_000
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidatorConfig {
    pub address: String,
    pub endpoint: Endpoint,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub tls_cert_hex: Option<String>,
}

impl NodeConfig {
    pub fn validator_infos(&self) -> Result<Vec<Validator>, Error> {
        let mut out = Vec::with_capacity(self.validators.len());
        for v in &self.validators {
            parse_address(&v.address)?;
            out.push(Validator::new(v.address.clone(), v.endpoint.clone(), &v.alias));
        }
        Ok(out)
    }

    /// Trust roots for outbound https: every peer certificate in the list.
    pub fn peer_certs(&self) -> Result<Vec<Certificate>, Error> {
        let mut certs = Vec::new();
        for v in &self.validators {
            if let Some(hex_cert) = &v.tls_cert_hex {
                let raw = hex::decode(hex_cert)
                    .map_err(|_| Error::NetworkProblem("invalid tls_cert_hex".into()))?;
                certs.push(Certificate(raw));
            }
        }
        Ok(certs)
    }

    pub fn http_config(&self) -> Result<HttpConfig, Error> {
        let tls_identity = if self.bind.scheme == Scheme::Https {
            let cert = self
                .tls_cert_file
                .as_deref()
                .ok_or_else(|| Error::NetworkProblem("https bind without tls_cert_file".into()))?;
            let key = self
                .tls_key_file
                .as_deref()
                .ok_or_else(|| Error::NetworkProblem("https bind without tls_key_file".into()))?;
            Some(load_tls_identity(cert, key)?)
        } else {
            None
        };

        Ok(HttpConfig {
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            tls_identity,
            peer_certs: self.peer_certs()?,
        })
    }
}
