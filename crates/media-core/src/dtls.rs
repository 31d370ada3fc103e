//! DTLS identity shared by every media flow in the process.

use rcgen::{Certificate, CertificateParams, DnType, PKCS_ECDSA_P256_SHA256};
use sha2::{Digest, Sha256};

use crate::error::{MediaError, Result};

/// SRTP protection profile negotiated over DTLS.
pub const SRTP_PROFILE: &str = "SRTP_AES128_CM_SHA1_80";

/// Cipher suites allowed for the DTLS handshake, in preference order.
pub const DTLS_CIPHER_SUITES: &[&str] = &[
    "ECDHE-RSA-AES128-GCM-SHA256",
    "ECDHE-ECDSA-AES128-GCM-SHA256",
    "ECDHE-RSA-AES256-GCM-SHA384",
    "ECDHE-ECDSA-AES256-GCM-SHA384",
    "DHE-RSA-AES128-GCM-SHA256",
    "DHE-DSS-AES128-GCM-SHA256",
    "ECDHE-RSA-AES128-SHA256",
    "ECDHE-ECDSA-AES128-SHA256",
    "ECDHE-RSA-AES128-SHA",
    "ECDHE-ECDSA-AES128-SHA",
    "ECDHE-RSA-AES256-SHA384",
    "ECDHE-ECDSA-AES256-SHA384",
    "ECDHE-RSA-AES256-SHA",
    "ECDHE-ECDSA-AES256-SHA",
    "DHE-RSA-AES128-SHA256",
    "DHE-RSA-AES128-SHA",
    "DHE-DSS-AES128-SHA256",
    "DHE-RSA-AES256-SHA256",
    "DHE-DSS-AES256-SHA",
    "DHE-RSA-AES256-SHA",
    "ECDHE-RSA-AES128-CBC-SHA",
];

/// Self-signed ECDSA P-256 certificate plus key, generated once per media
/// system and handed to every media flow.
pub struct DtlsIdentity {
    certificate_der: Vec<u8>,
    private_key_der: Vec<u8>,
    fingerprint: [u8; 32],
}

impl DtlsIdentity {
    /// Generate a fresh self-signed identity.
    pub fn self_signed(common_name: &str) -> Result<Self> {
        let start = std::time::Instant::now();

        let mut params = CertificateParams::new(vec![common_name.to_string()]);
        params.alg = &PKCS_ECDSA_P256_SHA256;
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);

        let cert = Certificate::from_params(params)
            .map_err(|e| MediaError::Certificate(e.to_string()))?;
        let certificate_der = cert
            .serialize_der()
            .map_err(|e| MediaError::Certificate(e.to_string()))?;
        let private_key_der = cert.serialize_private_key_der();

        let fingerprint: [u8; 32] = Sha256::digest(&certificate_der).into();

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "generated self-signed ECDSA certificate"
        );

        Ok(DtlsIdentity {
            certificate_der,
            private_key_der,
            fingerprint,
        })
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    pub fn private_key_der(&self) -> &[u8] {
        &self.private_key_der
    }

    /// SHA-256 fingerprint of the certificate.
    pub fn fingerprint(&self) -> &[u8; 32] {
        &self.fingerprint
    }

    /// Fingerprint in the colon-separated form used in SDP attributes.
    pub fn fingerprint_hex(&self) -> String {
        self.fingerprint
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl std::fmt::Debug for DtlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtlsIdentity")
            .field("fingerprint", &self.fingerprint_hex())
            .finish()
    }
}
