//! Kubeconfig server rewriting
//!
//! A retrieved kubeconfig points at an address only reachable inside the
//! cluster network. The rewriter swaps that one server URL for the address
//! the proxy is reachable at, leaving every other field untouched.

use std::net::Ipv4Addr;

use serde_json::Value;
use tracing::debug;

use sandcastle_common::yaml::{parse_yaml, to_yaml};
use sandcastle_common::{Error, Result};

/// Replace the single `https://<IPv4>:<port>` cluster server with `target`.
///
/// Exactly one entry under `clusters[*].cluster.server` must match. Zero or
/// several matches are a [`Error::CredentialRewrite`], as is a target that
/// isn't an `https://` URL.
pub fn rewrite_server(kubeconfig: &str, target: &str) -> Result<String> {
    validate_target(target)?;

    let mut doc = parse_yaml(kubeconfig)
        .map_err(|e| Error::credential_rewrite(format!("failed to parse kubeconfig: {}", e)))?;

    let mut servers: Vec<&mut Value> = doc
        .get_mut("clusters")
        .and_then(Value::as_array_mut)
        .map(|clusters| {
            clusters
                .iter_mut()
                .filter_map(|c| c.get_mut("cluster").and_then(|c| c.get_mut("server")))
                .filter(|s| s.as_str().is_some_and(is_ip_server))
                .collect()
        })
        .unwrap_or_default();

    match servers.len() {
        0 => {
            return Err(Error::credential_rewrite(
                "no cluster server of the form https://<IPv4>:<port>",
            ))
        }
        1 => {}
        n => {
            return Err(Error::credential_rewrite(format!(
                "{} cluster servers of the form https://<IPv4>:<port>; expected exactly one",
                n
            )))
        }
    }

    let server = &mut servers[0];
    debug!(from = ?server.as_str(), to = %target, "rewriting kubeconfig server");
    **server = Value::String(target.to_string());

    Ok(to_yaml(&doc)?)
}

fn validate_target(target: &str) -> Result<()> {
    match target.strip_prefix("https://") {
        Some(rest) if !rest.is_empty() && !rest.starts_with(':') && !rest.starts_with('/') => {
            Ok(())
        }
        _ => Err(Error::credential_rewrite(format!(
            "target server '{}' must be an https:// URL",
            target
        ))),
    }
}

fn is_ip_server(server: &str) -> bool {
    let Some(authority) = server.strip_prefix("https://") else {
        return false;
    };
    let authority = authority.strip_suffix('/').unwrap_or(authority);
    let Some((host, port)) = authority.rsplit_once(':') else {
        return false;
    };
    host.parse::<Ipv4Addr>().is_ok() && port.parse::<u16>().is_ok()
}
