//! NOC authenticator for TPAP and the cloud certificate bootstrap.
//!
//! The TP-Link cloud issues an operational certificate for the account;
//! the device then proves itself with its own cloud-issued chain during an
//! ECDH exchange. Materials are cached for the process lifetime.

use std::sync::Mutex;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use p256::{PublicKey, SecretKey};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use kasa_crypto::aead::{CipherKind, HkdfHash, SessionCipher};
use kasa_crypto::certs::{
    sign_der, signing_key_from_pkcs8_pem, split_pem_chain, verify_cert_signed_by,
    verify_der, verifying_key_from_cert_pem,
};
use kasa_types::KasaError;

use super::{SessionType, TlaSession, TpapTransport};
use crate::http::{HttpClient, HttpRequest};

/// Cloud-issued NOC materials.
#[derive(Debug, Clone)]
pub struct TpapNocData {
    pub private_key_pem: String,
    pub certificate: String,
    pub intermediate_certificate: String,
    pub root_certificate: String,
}

static NOC_CACHE: Mutex<Option<TpapNocData>> = Mutex::new(None);

const CLOUD_URL: &str = "https://n-wap-gw.tplinkcloud.com";
const NOC_SERVICE_ID: &str = "nbu.iot-cloud-service";

/// Bootstraps NOC materials from the TP-Link cloud.
pub struct NocClient {
    base_url: String,
}

impl Default for NocClient {
    fn default() -> Self {
        Self::new()
    }
}

impl NocClient {
    pub fn new() -> Self {
        Self {
            base_url: CLOUD_URL.to_string(),
        }
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    /// Materials cached earlier in this process, if any.
    pub fn cached() -> Option<TpapNocData> {
        NOC_CACHE.lock().expect("noc cache lock").clone()
    }

    /// Drop the cached materials (test hook).
    pub fn reset() {
        *NOC_CACHE.lock().expect("noc cache lock") = None;
    }

    fn url(&self, path: &str) -> Result<Url, KasaError> {
        Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| KasaError::protocol(format!("invalid cloud url: {e}")))
    }

    async fn post(
        &self,
        http: &dyn HttpClient,
        path: &str,
        body: Value,
    ) -> Result<Value, KasaError> {
        let response = http.post(&self.url(path)?, HttpRequest::json(body)).await?;
        if response.status != 200 {
            return Err(KasaError::protocol(format!(
                "cloud responded with status {}",
                response.status
            )));
        }
        response
            .body
            .as_json()
            .and_then(|r| r.get("result"))
            .cloned()
            .ok_or_else(|| KasaError::protocol("cloud response is missing result"))
    }

    /// Login to the cloud and apply for a device certificate.
    pub async fn apply(
        &self,
        http: &dyn HttpClient,
        username: &str,
        password: &str,
    ) -> Result<TpapNocData, KasaError> {
        if let Some(cached) = Self::cached() {
            return Ok(cached);
        }
        let data = self
            .apply_inner(http, username, password)
            .await
            .map_err(|e| {
                KasaError::protocol(format!("TPLink Cloud NOC apply failed: {e}"))
            })?;
        *NOC_CACHE.lock().expect("noc cache lock") = Some(data.clone());
        Ok(data)
    }

    async fn apply_inner(
        &self,
        http: &dyn HttpClient,
        username: &str,
        password: &str,
    ) -> Result<TpapNocData, KasaError> {
        let login = self
            .post(
                http,
                "/",
                json!({
                    "method": "login",
                    "params": {
                        "appType": "Kasa_Android",
                        "cloudUserName": username,
                        "cloudPassword": password,
                    },
                }),
            )
            .await?;
        let token = login
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| KasaError::protocol("cloud login is missing token"))?;
        let account_id = login
            .get("accountId")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let services = self
            .post(
                http,
                "/api/v2/common/getAppServiceUrlById",
                json!({
                    "method": "getAppServiceUrlById",
                    "params": {"serviceIds": [NOC_SERVICE_ID], "token": token},
                }),
            )
            .await?;
        let service_url = services
            .get("serviceList")
            .and_then(Value::as_array)
            .and_then(|list| list.first())
            .and_then(|entry| entry.get("serviceUrl"))
            .and_then(Value::as_str)
            .ok_or_else(|| KasaError::protocol("cloud did not return a service url"))?
            .trim_end_matches('/')
            .to_string();

        // The operational key never leaves this process; the cloud only
        // sees its public half.
        let secret = SecretKey::random(&mut rand::rngs::OsRng);
        let private_key_pem = secret
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| KasaError::protocol(format!("unable to encode noc key: {e}")))?
            .to_string();
        let public_pem = secret
            .public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KasaError::protocol(format!("unable to encode noc key: {e}")))?;

        let issue_url = Url::parse(&format!("{service_url}/v1/certificate/noc/app/apply"))
            .map_err(|e| KasaError::protocol(format!("invalid service url: {e}")))?;
        let response = http
            .post(
                &issue_url,
                HttpRequest::json(json!({
                    "token": token,
                    "accountId": account_id,
                    "publicKey": public_pem,
                })),
            )
            .await?;
        if response.status != 200 {
            return Err(KasaError::protocol(format!(
                "certificate apply responded with status {}",
                response.status
            )));
        }
        let result = response
            .body
            .as_json()
            .and_then(|r| r.get("result"))
            .cloned()
            .ok_or_else(|| KasaError::protocol("certificate apply is missing result"))?;

        let certificate = result
            .get("certificate")
            .and_then(Value::as_str)
            .ok_or_else(|| KasaError::protocol("certificate apply is missing certificate"))?
            .to_string();
        let chain = result
            .get("certificateChain")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let (intermediate_certificate, root_certificate) = Self::split_chain(chain);

        Ok(TpapNocData {
            private_key_pem,
            certificate,
            intermediate_certificate,
            root_certificate,
        })
    }

    /// Split a two-certificate chain into (intermediate, root). A single
    /// certificate is treated as the root.
    fn split_chain(chain: &str) -> (String, String) {
        let mut parts = split_pem_chain(chain);
        match parts.len() {
            0 => (String::new(), String::new()),
            1 => (String::new(), parts.remove(0)),
            _ => {
                let root = parts.pop().expect("checked length");
                (parts.remove(0), root)
            }
        }
    }
}

impl TpapTransport {
    pub(crate) async fn noc_handshake(
        &mut self,
        noc: &TpapNocData,
    ) -> Result<(TlaSession, Option<SessionCipher>), KasaError> {
        let username = self
            .config
            .credentials
            .as_ref()
            .map(|c| c.username.clone())
            .unwrap_or_default();

        let ephemeral = SecretKey::random(&mut rand::rngs::OsRng);
        let ephemeral_pub = ephemeral
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();

        let kex = self
            .post_login(
                json!({
                    "sub_method": "noc_kex",
                    "dev_pk": BASE64.encode(&ephemeral_pub),
                    "username": username,
                }),
                "noc_kex",
            )
            .await?;

        let dev_pk_b64 = kex
            .get("dev_pk")
            .and_then(Value::as_str)
            .ok_or_else(|| KasaError::protocol("noc_kex response missing dev_pk"))?;
        let dev_pub_bytes = BASE64
            .decode(dev_pk_b64)
            .map_err(|_| KasaError::protocol("noc_kex dev_pk is not valid base64"))?;
        let encryption = kex
            .get("encryption")
            .and_then(Value::as_str)
            .unwrap_or("aes_128_ccm")
            .to_string();

        let dev_public = PublicKey::from_sec1_bytes(&dev_pub_bytes)
            .map_err(|_| KasaError::protocol("noc_kex dev_pk is not a P-256 point"))?;
        let shared = diffie_hellman(ephemeral.to_nonzero_scalar(), dev_public.as_affine());
        let shared_bytes = shared.raw_secret_bytes().to_vec();

        // Prove possession of the NOC key over both public keys.
        let signing_key = signing_key_from_pkcs8_pem(&noc.private_key_pem)
            .map_err(|e| KasaError::protocol(format!("NOC key unusable: {e}")))?;
        let proof_message = [ephemeral_pub.as_slice(), dev_pub_bytes.as_slice()].concat();
        let user_proof = sign_der(&signing_key, &proof_message);

        let proof = self
            .post_login(
                json!({
                    "sub_method": "noc_proof",
                    "user_proof": BASE64.encode(user_proof),
                    "user_noc": noc.certificate,
                    "user_icac": noc.intermediate_certificate,
                }),
                "noc_proof",
            )
            .await?;

        let dev_proof_encrypt = proof
            .get("dev_proof_encrypt")
            .and_then(Value::as_str)
            .ok_or_else(|| KasaError::protocol("noc_proof response missing device proof"))?;
        let tag = proof.get("tag").and_then(Value::as_str).unwrap_or_default();

        let kind = CipherKind::from_name(&encryption).ok_or_else(|| {
            KasaError::protocol(format!("unsupported TPAP encryption {encryption}"))
        })?;
        let cipher = SessionCipher::from_shared_key(kind, &shared_bytes, HkdfHash::Sha256);

        let mut ciphertext = BASE64
            .decode(dev_proof_encrypt)
            .map_err(|_| KasaError::protocol("device proof is not valid base64"))?;
        ciphertext.extend(
            BASE64
                .decode(tag)
                .map_err(|_| KasaError::protocol("device proof tag is not valid base64"))?,
        );
        let plaintext = cipher
            .decrypt(&ciphertext, 0)
            .map_err(|_| KasaError::protocol("unable to decrypt device proof"))?;
        let proof_doc: Value = serde_json::from_slice(&plaintext)
            .map_err(|_| KasaError::protocol("device proof is not valid json"))?;

        self.verify_device_proof(&proof_doc, noc, &ephemeral_pub, &dev_pub_bytes)?;

        debug!(host = %self.host, "NOC handshake complete");
        let session = TlaSession::from_result(&proof, SessionType::Noc);
        Ok((session, Some(cipher)))
    }

    fn verify_device_proof(
        &self,
        proof_doc: &Value,
        noc: &TpapNocData,
        ephemeral_pub: &[u8],
        dev_pub: &[u8],
    ) -> Result<(), KasaError> {
        let (Some(dev_noc), Some(proof)) = (
            proof_doc.get("dev_noc").and_then(Value::as_str),
            proof_doc.get("proof").and_then(Value::as_str),
        ) else {
            // Devices omitting fields get no benefit of the doubt.
            return Err(KasaError::protocol("Device proof missing fields"));
        };
        let dev_icac = proof_doc.get("dev_icac").and_then(Value::as_str);

        if ephemeral_pub.is_empty() || dev_pub.is_empty() {
            return Err(KasaError::protocol("Missing public keys"));
        }

        // Chain: leaf signed by the intermediate when one is present,
        // otherwise directly by the root.
        let chain_result = match dev_icac {
            Some(icac) if !icac.is_empty() => verify_cert_signed_by(dev_noc, icac)
                .and_then(|_| verify_cert_signed_by(icac, &noc.root_certificate)),
            _ => verify_cert_signed_by(dev_noc, &noc.root_certificate),
        };
        if let Err(e) = chain_result {
            return Err(KasaError::Authentication {
                message: format!(
                    "device certificate chain verification failed for {}: {e}",
                    self.host
                ),
                error_code: None,
            });
        }

        let signature = match BASE64.decode(proof) {
            Ok(bytes) => bytes,
            Err(_) => hex::decode(proof).map_err(|_| {
                KasaError::protocol("device proof signature is not decodable")
            })?,
        };
        let device_key = verifying_key_from_cert_pem(dev_noc)
            .map_err(|e| KasaError::protocol(format!("device certificate unusable: {e}")))?;
        let message = [ephemeral_pub, dev_pub].concat();
        verify_der(&device_key, &message, &signature)
            .map_err(|_| KasaError::protocol("Invalid NOC device proof signature"))
    }
}
