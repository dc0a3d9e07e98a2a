//! SPAKE2+ authenticator for TPAP.

use rand::RngCore;
use serde_json::{json, Value};
use tracing::debug;

use kasa_crypto::aead::{CipherKind, HkdfHash, SessionCipher};
use kasa_crypto::hash::md5_hex_upper;
use kasa_crypto::spake2::{run_prover, PakeInput, TranscriptHash};
use kasa_crypto::tpap_cred::{build_credential_string, mac_passcode, ExtraCrypt};
use kasa_types::{ErrorCode, KasaError};

use super::{SessionType, TlaSession, TpapTransport};

const ENCRYPTION_PREFERENCES: [&str; 3] =
    ["aes_128_ccm", "chacha20_poly1305", "aes_256_ccm"];

impl TpapTransport {
    fn credentials(&self) -> (String, String) {
        match &self.config.credentials {
            Some(creds) => (creds.username.clone(), creds.password.clone()),
            None => (String::new(), String::new()),
        }
    }

    fn is_less_secure_login(&self, resp: &Value) -> bool {
        let error = resp.get("error_code").and_then(Value::as_i64);
        if error != Some(ErrorCode::SessionExpired.value()) {
            return false;
        }
        let Some(encrypt_type) = resp
            .get("result")
            .and_then(|r| r.get("data"))
            .and_then(|d| d.get("encrypt_type"))
        else {
            return false;
        };
        encrypt_type != &json!(["3"])
    }

    /// Old firmware: plain login with the MD5 password, unencrypted data
    /// channel afterwards.
    async fn less_secure_login(&mut self) -> Result<(TlaSession, Option<SessionCipher>), KasaError> {
        let (username, passcode) = self.credentials();
        debug!(host = %self.host, "performing less secure TPAP login");
        let result = self
            .post_login(
                json!({
                    "hashed": true,
                    "password": md5_hex_upper(passcode.as_bytes()),
                    "username": username,
                }),
                "login",
            )
            .await?;
        let session = TlaSession::from_result(&result, SessionType::Unencrypted);
        if session.session_id.is_empty() {
            return Err(KasaError::Authentication {
                message: format!("less secure login to {} did not yield a session", self.host),
                error_code: None,
            });
        }
        Ok((session, None))
    }

    pub(crate) async fn pake_handshake(
        &mut self,
    ) -> Result<(TlaSession, Option<SessionCipher>), KasaError> {
        let (username, passcode) = self.credentials();
        let suites = self.discover_suites.clone().unwrap_or_else(|| vec![2]);
        let mac = self
            .discover_mac
            .clone()
            .unwrap_or_default()
            .to_uppercase();
        let mac_no_colon: String = mac.chars().filter(|c| *c != ':' && *c != '-').collect();

        let mut user_random_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut user_random_bytes);
        let user_random = hex::encode_upper(user_random_bytes);

        let reg_resp = self
            .post_login_raw(
                json!({
                    "sub_method": "pake_register",
                    "username": username,
                    "user_random": user_random,
                    "cipher_suites": suites,
                    "encryption": ENCRYPTION_PREFERENCES,
                    "passcode_type": "password",
                    "stok": null,
                }),
                "register",
            )
            .await?;
        if self.is_less_secure_login(&reg_resp) {
            debug!(
                host = %self.host,
                "device cannot negotiate the secure channel, falling back"
            );
            return self.less_secure_login().await;
        }
        self.handle_response_error_code(&reg_resp, "TPAP register failed")?;
        let reg = reg_resp.get("result").cloned().unwrap_or_else(|| json!({}));

        let dev_random = reg
            .get("dev_random")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let dev_salt = reg
            .get("dev_salt")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let dev_share = reg
            .get("dev_share")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let suite_type = reg
            .get("cipher_suites")
            .and_then(Value::as_i64)
            .unwrap_or(2);
        let iterations = reg
            .get("iterations")
            .and_then(Value::as_u64)
            .unwrap_or(10_000) as u32;
        let encryption = reg
            .get("encryption")
            .and_then(Value::as_str)
            .unwrap_or("aes_128_ccm")
            .to_string();
        let extra_crypt = reg
            .get("extra_crypt")
            .and_then(ExtraCrypt::from_value);

        let credential = if suites.contains(&0) {
            if mac.is_empty() {
                return Err(KasaError::Authentication {
                    message: format!(
                        "device {} requires a MAC-derived passcode (suite 0) but its MAC \
                         could not be discovered",
                        self.host
                    ),
                    error_code: None,
                });
            }
            mac_passcode(&mac)
                .map_err(|e| KasaError::protocol(format!("unable to derive MAC passcode: {e}")))?
        } else {
            build_credential_string(extra_crypt.as_ref(), &username, &passcode, &mac_no_colon)
        };

        let salt = hex::decode(dev_salt)
            .map_err(|_| KasaError::protocol("pake_register dev_salt is not hex"))?;
        let user_random_raw = hex::decode(&user_random).expect("own hex");
        let dev_random_raw = hex::decode(dev_random)
            .map_err(|_| KasaError::protocol("pake_register dev_random is not hex"))?;
        let dev_share_raw = hex::decode(dev_share)
            .map_err(|_| KasaError::protocol("pake_register dev_share is not hex"))?;

        let prover = run_prover(&PakeInput {
            credential: credential.as_bytes(),
            salt: &salt,
            iterations,
            user_random: &user_random_raw,
            dev_random: &dev_random_raw,
            dev_share: &dev_share_raw,
            hash: TranscriptHash::for_suite(suite_type),
        })
        .map_err(|e| KasaError::protocol(format!("SPAKE2+ prover failed: {e}")))?;

        let share = self
            .post_login(
                json!({
                    "sub_method": "pake_share",
                    "user_share": hex::encode(&prover.user_share),
                    "user_confirm": hex::encode(&prover.user_confirm),
                }),
                "share",
            )
            .await?;

        let dev_confirm = share
            .get("dev_confirm")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();
        if dev_confirm != hex::encode(&prover.expected_dev_confirm) {
            return Err(KasaError::protocol("SPAKE2+ confirmation mismatch"));
        }

        let session = TlaSession::from_result(&share, SessionType::Pake);
        if session.session_id.is_empty() {
            return Err(KasaError::protocol("missing session fields from device"));
        }

        let kind = CipherKind::from_name(&encryption).ok_or_else(|| {
            KasaError::protocol(format!("unsupported TPAP encryption {encryption}"))
        })?;
        let cipher = SessionCipher::from_shared_key(kind, &prover.shared_key, HkdfHash::Sha256);
        Ok((session, Some(cipher)))
    }
}
