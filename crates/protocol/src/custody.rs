//! Chain-of-custody attributes.
//!
//! Every hop a record passes through is described by a group of
//! `custodyChain.<n>.*` attributes, newest hop at `n = 0`.

use std::net::SocketAddr;

use chrono::{SecondsFormat, Utc};

use crate::attributes::Attributes;

pub const CUSTODY_PREFIX: &str = "custodyChain.";

/// What a receiver knows about the request that delivered a record.
#[derive(Debug, Clone, Default)]
pub struct CustodyHop {
    pub request_uri: Option<String>,
    pub remote_addr: Option<SocketAddr>,
    pub tls: Option<TlsDetails>,
}

#[derive(Debug, Clone, Default)]
pub struct TlsDetails {
    pub peer_subject: Option<String>,
    pub peer_issuer: Option<String>,
    pub cipher: Option<String>,
    pub server_name: Option<String>,
    pub version: Option<String>,
}

impl Attributes {
    /// Moves every `custodyChain.<n>.*` entry to `n + 1` and records the
    /// current time and local hostname as hop 0.
    ///
    /// Custody entries whose index is not a number are dropped.
    pub fn custody_chain_shift(&mut self) {
        self.retain(|a| !a.name.starts_with(CUSTODY_PREFIX) || shifted_name(&a.name).is_some());
        for attr in self.iter_mut() {
            if let Some(name) = shifted_name(&attr.name) {
                attr.name = name;
            }
        }

        self.push(
            format!("{CUSTODY_PREFIX}0.time"),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        if let Some(host) = hostname::get().ok().and_then(|h| h.into_string().ok()) {
            self.push(format!("{CUSTODY_PREFIX}0.local.hostname"), host);
        }
    }

    /// Records request details for hop 0. Call after
    /// [`custody_chain_shift`](Self::custody_chain_shift).
    pub fn custody_chain_add_hop(&mut self, hop: &CustodyHop) {
        let key = |suffix: &str| format!("{CUSTODY_PREFIX}0.{suffix}");

        if let Some(uri) = &hop.request_uri {
            self.push(key("request.uri"), uri.as_str());
        }
        if let Some(addr) = hop.remote_addr {
            self.push(key("source.host"), addr.ip().to_string());
            self.push(key("source.port"), addr.port().to_string());
        }
        let protocol = if hop.tls.is_some() { "HTTPS" } else { "HTTP" };
        self.push(key("protocol"), protocol);
        if let Some(tls) = &hop.tls {
            if let Some(subject) = &tls.peer_subject {
                self.push(key("user.dn"), subject.as_str());
            }
            if let Some(issuer) = &tls.peer_issuer {
                self.push(key("issuer.dn"), issuer.as_str());
            }
            if let Some(cipher) = &tls.cipher {
                self.push(key("tls.cipher"), cipher.as_str());
            }
            if let Some(host) = &tls.server_name {
                self.push(key("tls.host"), host.as_str());
            }
            if let Some(version) = &tls.version {
                self.push(key("tls.version"), version.as_str());
            }
        }
    }
}

fn shifted_name(name: &str) -> Option<String> {
    let rest = name.strip_prefix(CUSTODY_PREFIX)?;
    let (index, tail) = match rest.split_once('.') {
        Some((index, tail)) => (index, Some(tail)),
        None => (rest, None),
    };
    let next = index.parse::<u64>().ok()? + 1;
    Some(match tail {
        Some(tail) => format!("{CUSTODY_PREFIX}{next}.{tail}"),
        None => format!("{CUSTODY_PREFIX}{next}"),
    })
}
