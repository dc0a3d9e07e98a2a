//! X.509 helpers for the NOC authentication path.
//!
//! The device proves itself with an ECDSA P-256 certificate chain issued by
//! the TP-Link cloud; we parse the PEMs, check the chain signatures, and
//! verify the device proof with the leaf key.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::DecodePrivateKey;
use p256::SecretKey;
use x509_cert::der::{DecodePem, Encode};
use x509_cert::Certificate;

use crate::CryptoError;

/// Split a concatenated PEM certificate chain into individual PEM blocks.
pub fn split_pem_chain(chain: &str) -> Vec<String> {
    const BEGIN: &str = "-----BEGIN CERTIFICATE-----";
    const END: &str = "-----END CERTIFICATE-----";
    let mut out = Vec::new();
    let mut rest = chain;
    while let Some(start) = rest.find(BEGIN) {
        let Some(end) = rest[start..].find(END) else {
            break;
        };
        let stop = start + end + END.len();
        out.push(rest[start..stop].to_string());
        rest = &rest[stop..];
    }
    out
}

fn parse_cert(pem: &str) -> Result<Certificate, CryptoError> {
    Certificate::from_pem(pem.as_bytes())
        .map_err(|e| CryptoError::Certificate(format!("unable to parse certificate: {e}")))
}

/// Extract the P-256 verifying key from a certificate PEM.
pub fn verifying_key_from_cert_pem(pem: &str) -> Result<VerifyingKey, CryptoError> {
    let cert = parse_cert(pem)?;
    let spki = &cert.tbs_certificate.subject_public_key_info;
    let key_bytes = spki
        .subject_public_key
        .as_bytes()
        .ok_or_else(|| CryptoError::Certificate("unaligned public key bits".into()))?;
    VerifyingKey::from_sec1_bytes(key_bytes)
        .map_err(|_| CryptoError::Certificate("certificate key is not P-256".into()))
}

/// Verify that `cert_pem` carries a signature made by `issuer_pem`'s key.
pub fn verify_cert_signed_by(cert_pem: &str, issuer_pem: &str) -> Result<(), CryptoError> {
    let cert = parse_cert(cert_pem)?;
    let issuer_key = verifying_key_from_cert_pem(issuer_pem)?;
    let tbs = cert
        .tbs_certificate
        .to_der()
        .map_err(|e| CryptoError::Certificate(e.to_string()))?;
    let sig_bytes = cert
        .signature
        .as_bytes()
        .ok_or_else(|| CryptoError::Certificate("unaligned signature bits".into()))?;
    let signature =
        Signature::from_der(sig_bytes).map_err(|_| CryptoError::SignatureInvalid)?;
    issuer_key
        .verify(&tbs, &signature)
        .map_err(|_| CryptoError::SignatureInvalid)
}

/// Load a P-256 signing key from an unencrypted PKCS#8 PEM.
pub fn signing_key_from_pkcs8_pem(pem: &str) -> Result<SigningKey, CryptoError> {
    let secret = SecretKey::from_pkcs8_pem(pem)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(SigningKey::from(secret))
}

/// ECDSA-sign a message, DER-encoded as the wire expects.
pub fn sign_der(key: &SigningKey, message: &[u8]) -> Vec<u8> {
    let signature: Signature = key.sign(message);
    signature.to_der().as_bytes().to_vec()
}

/// Verify a DER-encoded ECDSA signature.
pub fn verify_der(
    key: &VerifyingKey,
    message: &[u8],
    signature_der: &[u8],
) -> Result<(), CryptoError> {
    let signature =
        Signature::from_der(signature_der).map_err(|_| CryptoError::SignatureInvalid)?;
    key.verify(message, &signature)
        .map_err(|_| CryptoError::SignatureInvalid)
}
