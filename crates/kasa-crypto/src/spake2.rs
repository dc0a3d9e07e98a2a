//! SPAKE2+ prover math on P-256 for the TPAP handshake.
//!
//! The device is the verifier. Registration yields `(w, h)` from a PBKDF2
//! stretch of the credential string; the prover computes its share
//! `L = x·G + w·M`, unmasks the device share `R' = R − w·N`, and derives
//! the transcript hash from which the confirmation keys and the session
//! shared key expand.

use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::elliptic_curve::Field;
use p256::{AffinePoint, EncodedPoint, ProjectivePoint, Scalar};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use sha2::Sha256;

use crate::aead::{hkdf_expand, HkdfHash};
use crate::hash::{hmac_sha256, hmac_sha512, sha256, sha512};
use crate::CryptoError;

/// Fixed public generator M (compressed SEC1).
const P256_M_COMP: &str = "02886e2f97ace46e55ba9dd7242579f2993b64e16ef3dcab95afd497333d8fa12f";
/// Fixed public generator N (compressed SEC1).
const P256_N_COMP: &str = "03d8bbd6c639c62937b04d997f38c3770719c629d7014d49a24b4f98baa1292b49";

const PAKE_CONTEXT_TAG: &[u8] = b"PAKE V1";

/// Hash negotiated with the cipher suite; suite 2 uses SHA-512.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptHash {
    Sha256,
    Sha512,
}

impl TranscriptHash {
    pub fn for_suite(suite: i64) -> Self {
        if suite == 2 {
            TranscriptHash::Sha512
        } else {
            TranscriptHash::Sha256
        }
    }

    pub fn mac_len(self) -> usize {
        match self {
            TranscriptHash::Sha256 => 32,
            TranscriptHash::Sha512 => 64,
        }
    }

    fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            TranscriptHash::Sha256 => sha256(data).to_vec(),
            TranscriptHash::Sha512 => sha512(data).to_vec(),
        }
    }

    fn hmac(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            TranscriptHash::Sha256 => hmac_sha256(key, data).to_vec(),
            TranscriptHash::Sha512 => hmac_sha512(key, data).to_vec(),
        }
    }

    fn hkdf(self) -> HkdfHash {
        match self {
            TranscriptHash::Sha256 => HkdfHash::Sha256,
            TranscriptHash::Sha512 => HkdfHash::Sha512,
        }
    }
}

/// Inputs to the prover, all wire-decoded bytes.
pub struct PakeInput<'a> {
    pub credential: &'a [u8],
    pub salt: &'a [u8],
    pub iterations: u32,
    pub user_random: &'a [u8],
    pub dev_random: &'a [u8],
    /// Device share `R`, SEC1 encoded (compressed or uncompressed).
    pub dev_share: &'a [u8],
    pub hash: TranscriptHash,
}

/// Prover results handed back to the transport.
pub struct PakeOutput {
    /// `L`, uncompressed SEC1, hex-encoded by the transport for `pake_share`.
    pub user_share: Vec<u8>,
    pub user_confirm: Vec<u8>,
    pub expected_dev_confirm: Vec<u8>,
    pub shared_key: Vec<u8>,
}

fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint, CryptoError> {
    let encoded = EncodedPoint::from_bytes(bytes).map_err(|_| CryptoError::InvalidPoint)?;
    Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .map(ProjectivePoint::from)
        .ok_or(CryptoError::InvalidPoint)
}

fn encode_uncompressed(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(false).as_bytes().to_vec()
}

/// Interpret big-endian bytes as an integer reduced mod the curve order.
///
/// PBKDF2 hands us 40-byte integers; fold them digit by digit so no wide
/// arithmetic is needed.
fn scalar_from_be_bytes_reduced(bytes: &[u8]) -> Scalar {
    let radix = Scalar::from(256u64);
    let mut acc = Scalar::ZERO;
    for &b in bytes {
        acc = acc * radix + Scalar::from(u64::from(b));
    }
    acc
}

/// Stretch the credential into the `(w, h)` scalar pair.
pub fn derive_w_h(credential: &[u8], salt: &[u8], iterations: u32) -> (Scalar, Scalar) {
    // Each half is hash_len + 8 = 40 bytes before reduction.
    const HALF: usize = 40;
    let mut out = [0u8; 2 * HALF];
    pbkdf2_hmac::<Sha256>(credential, salt, iterations, &mut out);
    (
        scalar_from_be_bytes_reduced(&out[..HALF]),
        scalar_from_be_bytes_reduced(&out[HALF..]),
    )
}

/// Minimal big-endian encoding of `w` for the transcript.
fn encode_w(w: &Scalar) -> Vec<u8> {
    let bytes = w.to_bytes();
    let stripped: Vec<u8> = bytes.iter().copied().skip_while(|&b| b == 0).collect();
    if stripped.is_empty() {
        vec![0]
    } else {
        stripped
    }
}

fn len8le(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + data.len());
    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
    out.extend_from_slice(data);
    out
}

fn nonzero_scalar() -> Scalar {
    loop {
        let s = Scalar::random(&mut OsRng);
        if !bool::from(s.is_zero()) {
            return s;
        }
    }
}

struct TranscriptKeys {
    shared_key: Vec<u8>,
    confirm_a: Vec<u8>,
    confirm_b: Vec<u8>,
}

#[allow(clippy::too_many_arguments)]
fn transcript_keys(
    hash: TranscriptHash,
    user_random: &[u8],
    dev_random: &[u8],
    m_enc: &[u8],
    n_enc: &[u8],
    l_enc: &[u8],
    r_enc: &[u8],
    z_enc: &[u8],
    v_enc: &[u8],
    w_enc: &[u8],
) -> TranscriptKeys {
    let context = [PAKE_CONTEXT_TAG, user_random, dev_random].concat();
    let context_hash = hash.digest(&context);

    let mut transcript = Vec::new();
    transcript.extend(len8le(&context_hash));
    transcript.extend(len8le(b""));
    transcript.extend(len8le(b""));
    transcript.extend(len8le(m_enc));
    transcript.extend(len8le(n_enc));
    transcript.extend(len8le(l_enc));
    transcript.extend(len8le(r_enc));
    transcript.extend(len8le(z_enc));
    transcript.extend(len8le(v_enc));
    transcript.extend(len8le(w_enc));
    let t = hash.digest(&transcript);

    let mac_len = hash.mac_len();
    let conf = hkdf_expand(&t, None, b"ConfirmationKeys", 2 * mac_len, hash.hkdf());
    let shared_key = hkdf_expand(&t, None, b"SharedKey", t.len(), hash.hkdf());

    TranscriptKeys {
        shared_key,
        confirm_a: conf[..mac_len].to_vec(),
        confirm_b: conf[mac_len..].to_vec(),
    }
}

/// Run the prover side of the exchange with a fresh random scalar.
pub fn run_prover(input: &PakeInput<'_>) -> Result<PakeOutput, CryptoError> {
    run_prover_with_scalar(input, nonzero_scalar())
}

fn run_prover_with_scalar(input: &PakeInput<'_>, x: Scalar) -> Result<PakeOutput, CryptoError> {
    let m = decode_point(&hex::decode(P256_M_COMP).expect("fixed point hex"))?;
    let n = decode_point(&hex::decode(P256_N_COMP).expect("fixed point hex"))?;
    let g = ProjectivePoint::GENERATOR;

    let (w, h) = derive_w_h(input.credential, input.salt, input.iterations);

    let l = g * x + m * w;
    let r = decode_point(input.dev_share)?;
    let r_prime = r - n * w;
    let z = r_prime * x;
    let v = r_prime * h;

    let m_enc = encode_uncompressed(&m);
    let n_enc = encode_uncompressed(&n);
    let l_enc = encode_uncompressed(&l);
    let r_enc = encode_uncompressed(&r);
    let z_enc = encode_uncompressed(&z);
    let v_enc = encode_uncompressed(&v);

    let keys = transcript_keys(
        input.hash,
        input.user_random,
        input.dev_random,
        &m_enc,
        &n_enc,
        &l_enc,
        &r_enc,
        &z_enc,
        &v_enc,
        &encode_w(&w),
    );

    Ok(PakeOutput {
        user_confirm: input.hash.hmac(&keys.confirm_a, &r_enc),
        expected_dev_confirm: input.hash.hmac(&keys.confirm_b, &l_enc),
        user_share: l_enc,
        shared_key: keys.shared_key,
    })
}
