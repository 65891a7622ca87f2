//! Trust material and machine configuration for Sandcastle clusters
//!
//! Nothing in this crate contacts a node. It produces the documents the
//! bootstrap sequence later applies:
//!
//! - [`pki::CertificateAuthority`]: self-signed CAs and client certificates
//! - [`secrets::TrustBundle`]: every CA, token and key one cluster shares
//! - [`machine::MachineConfigGenerator`]: per-role `v1alpha1` documents with
//!   ordered caller patches

#![deny(missing_docs)]

pub mod machine;
pub mod pki;
pub mod secrets;

pub use machine::{
    ConfigPatch, MachineConfig, MachineConfigGenerator, PatchSet, DEFAULT_VIP_INTERFACE,
};
pub use pki::{CertKeyPair, CertificateAuthority, CertificateInfo, PkiError};
pub use secrets::TrustBundle;
