//! TLS для панелей с самоподписанным сертификатом: доверяем ровно одному
//! сертификату, заданному SHA-256 отпечатком.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub type Fingerprint = [u8; 32];

/// Отпечаток в hex (Outline отдаёт его заглавными буквами), двоеточия допускаются.
pub fn parse_fingerprint(raw: &str) -> Option<Fingerprint> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ':').collect();
    hex::decode(cleaned).ok()?.try_into().ok()
}

#[derive(Debug)]
struct PinnedCertVerifier {
    fingerprint: Fingerprint,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        // Имя и срок действия не проверяются: сертификат выпущен самой панелью.
        if Sha256::digest(end_entity.as_ref()).as_slice() == self.fingerprint.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            tracing::warn!("Panel certificate fingerprint mismatch");
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

pub fn pinned_client_config(fingerprint: Fingerprint) -> Result<ClientConfig, rustls::Error> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let verifier = Arc::new(PinnedCertVerifier {
        fingerprint,
        provider: provider.clone(),
    });
    Ok(ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier_for(cert: &[u8]) -> PinnedCertVerifier {
        let mut fingerprint = [0u8; 32];
        fingerprint.copy_from_slice(&Sha256::digest(cert));
        PinnedCertVerifier {
            fingerprint,
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        }
    }

    fn check(verifier: &PinnedCertVerifier, cert: &[u8]) -> Result<ServerCertVerified, rustls::Error> {
        let server_name = ServerName::try_from("1.2.3.4").unwrap();
        verifier.verify_server_cert(
            &CertificateDer::from(cert.to_vec()),
            &[],
            &server_name,
            &[],
            UnixTime::now(),
        )
    }

    #[test]
    fn only_pinned_certificate_is_accepted() {
        let verifier = verifier_for(b"panel certificate");
        assert!(check(&verifier, b"panel certificate").is_ok());
        assert!(matches!(
            check(&verifier, b"attacker certificate"),
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure
            ))
        ));
    }

    #[test]
    fn fingerprint_accepts_outline_hex_forms() {
        let upper = "A".repeat(64);
        assert_eq!(parse_fingerprint(&upper), Some([0xAA; 32]));
        assert_eq!(parse_fingerprint(&upper.to_lowercase()), Some([0xAA; 32]));
        let colons = vec!["AA"; 32].join(":");
        assert_eq!(parse_fingerprint(&colons), Some([0xAA; 32]));
        assert_eq!(parse_fingerprint("AB"), None);
        assert_eq!(parse_fingerprint("zz"), None);
    }

    #[test]
    fn client_config_builds() {
        assert!(pinned_client_config([0; 32]).is_ok());
    }
}
