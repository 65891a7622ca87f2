//! Cluster-wide trust material
//!
//! A [`TrustBundle`] is generated once per cluster instance and then only
//! read. It holds every CA, token and key the machine configs embed, plus
//! the admin client credential for the node-management API.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::Rng;
use tracing::debug;

use sandcastle_common::credentials::{TalosContext, Talosconfig};
use sandcastle_common::{ClusterSpec, Result};

use crate::pki::{generate_key_pem, CertKeyPair, CertificateAuthority};

/// Organization granting full node-management API access
pub const OS_ADMIN_ORGANIZATION: &str = "os:admin";

const TOKEN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Secrets shared by every node of one cluster
#[derive(Clone, Debug)]
pub struct TrustBundle {
    os_ca: CertificateAuthority,
    kubernetes_ca: CertificateAuthority,
    aggregator_ca: CertificateAuthority,
    etcd_ca: CertificateAuthority,
    service_account_key_pem: String,
    bootstrap_token: String,
    machine_token: String,
    secretbox_secret: String,
    cluster_id: String,
    cluster_secret: String,
    admin: CertKeyPair,
}

impl TrustBundle {
    /// Generate fresh trust material for `spec`
    pub fn generate(spec: &ClusterSpec) -> Result<Self> {
        debug!(cluster = %spec.name(), "generating trust bundle");

        let os_ca = CertificateAuthority::new("talos", "talos")?;
        let admin = os_ca.issue_client_cert("admin", OS_ADMIN_ORGANIZATION)?;

        Ok(Self {
            kubernetes_ca: CertificateAuthority::new("kubernetes", "kubernetes")?,
            aggregator_ca: CertificateAuthority::new("front-proxy", "")?,
            etcd_ca: CertificateAuthority::new("etcd", "etcd")?,
            service_account_key_pem: generate_key_pem()?,
            bootstrap_token: random_token(),
            machine_token: random_token(),
            secretbox_secret: random_base64(32),
            cluster_id: random_base64(32),
            cluster_secret: random_base64(32),
            os_ca,
            admin,
        })
    }

    /// CA for the node-management API
    pub fn os_ca(&self) -> &CertificateAuthority {
        &self.os_ca
    }

    /// CA for the Kubernetes API
    pub fn kubernetes_ca(&self) -> &CertificateAuthority {
        &self.kubernetes_ca
    }

    /// CA for the API aggregation layer
    pub fn aggregator_ca(&self) -> &CertificateAuthority {
        &self.aggregator_ca
    }

    /// CA for etcd peer and client traffic
    pub fn etcd_ca(&self) -> &CertificateAuthority {
        &self.etcd_ca
    }

    /// PEM key used to sign service account tokens
    pub fn service_account_key_pem(&self) -> &str {
        &self.service_account_key_pem
    }

    /// Kubernetes bootstrap token (`[a-z0-9]{6}.[a-z0-9]{16}`)
    pub fn bootstrap_token(&self) -> &str {
        &self.bootstrap_token
    }

    /// Token nodes use to request certificates from trustd
    pub fn machine_token(&self) -> &str {
        &self.machine_token
    }

    /// Base64 key for secretbox encryption of secrets at rest
    pub fn secretbox_secret(&self) -> &str {
        &self.secretbox_secret
    }

    /// Base64 cluster identity used for discovery
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Base64 shared secret used for discovery
    pub fn cluster_secret(&self) -> &str {
        &self.cluster_secret
    }

    /// Admin client credential for the node-management API
    pub fn admin(&self) -> &CertKeyPair {
        &self.admin
    }

    /// Node-management client config whose endpoint is the cluster VIP
    pub fn talosconfig(&self, spec: &ClusterSpec) -> Talosconfig {
        let mut contexts = BTreeMap::new();
        contexts.insert(
            spec.name().to_string(),
            TalosContext {
                endpoints: vec![spec.vip().to_string()],
                nodes: vec![],
                ca: b64(self.os_ca.ca_cert_pem()),
                crt: b64(&self.admin.cert_pem),
                key: b64(&self.admin.key_pem),
            },
        );
        Talosconfig {
            context: spec.name().to_string(),
            contexts,
        }
    }
}

/// Base64-encode PEM text the way config documents embed it
pub fn b64(pem: &str) -> String {
    STANDARD.encode(pem.as_bytes())
}

fn random_token() -> String {
    let mut rng = rand::thread_rng();
    let mut part = |len: usize| -> String {
        (0..len)
            .map(|_| TOKEN_CHARSET[rng.gen_range(0..TOKEN_CHARSET.len())] as char)
            .collect()
    };
    let id = part(6);
    let secret = part(16);
    format!("{}.{}", id, secret)
}

fn random_base64(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill(&mut bytes[..]);
    STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::CertificateInfo;

    fn spec() -> ClusterSpec {
        ClusterSpec::new("t1", "v1.8.3", 1, 1, "10.87.13.37").unwrap()
    }

    fn is_token(token: &str) -> bool {
        let Some((id, secret)) = token.split_once('.') else {
            return false;
        };
        let ok = |s: &str| s.bytes().all(|b| TOKEN_CHARSET.contains(&b));
        id.len() == 6 && secret.len() == 16 && ok(id) && ok(secret)
    }

    #[test]
    fn tokens_have_kubernetes_bootstrap_format() {
        let bundle = TrustBundle::generate(&spec()).unwrap();
        assert!(is_token(bundle.bootstrap_token()));
        assert!(is_token(bundle.machine_token()));
        assert_ne!(bundle.bootstrap_token(), bundle.machine_token());
    }

    #[test]
    fn secrets_decode_to_32_bytes() {
        let bundle = TrustBundle::generate(&spec()).unwrap();
        for secret in [
            bundle.secretbox_secret(),
            bundle.cluster_id(),
            bundle.cluster_secret(),
        ] {
            assert_eq!(STANDARD.decode(secret).unwrap().len(), 32);
        }
    }

    #[test]
    fn admin_credential_is_issued_by_os_ca() {
        let bundle = TrustBundle::generate(&spec()).unwrap();
        let info = CertificateInfo::from_pem(&bundle.admin().cert_pem).unwrap();
        assert_eq!(info.issuer_common_name, "talos");
        assert_eq!(info.organizations, vec![OS_ADMIN_ORGANIZATION.to_string()]);
    }

    #[test]
    fn each_cluster_instance_gets_fresh_material() {
        let a = TrustBundle::generate(&spec()).unwrap();
        let b = TrustBundle::generate(&spec()).unwrap();
        assert_ne!(a.os_ca().ca_cert_pem(), b.os_ca().ca_cert_pem());
        assert_ne!(a.cluster_secret(), b.cluster_secret());
    }

    #[test]
    fn talosconfig_points_at_vip() {
        let spec = spec();
        let bundle = TrustBundle::generate(&spec).unwrap();
        let tc = bundle.talosconfig(&spec);

        assert_eq!(tc.context, "t1");
        let ctx = tc.current().unwrap();
        assert_eq!(ctx.endpoints, vec!["10.87.13.37".to_string()]);
        let ca = String::from_utf8(STANDARD.decode(&ctx.ca).unwrap()).unwrap();
        assert_eq!(ca, bundle.os_ca().ca_cert_pem());
    }
}
