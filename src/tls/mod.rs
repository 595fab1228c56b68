//! TLS interception: root CA lifecycle, per-host leaf issuance and the
//! certificate distribution collaborator.

pub mod authority;
pub mod distribution;

pub use authority::CertificateAuthority;
pub use distribution::CertificateDistributionService;
