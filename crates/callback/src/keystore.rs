//! JWK keystore plus compact-token signing and verification.
//!
//! The keystore is a JSON JWK set on disk. Supported signing keys:
//! - `oct` keys for HS256/HS384/HS512
//! - `OKP` Ed25519 keys (with private part `d`) for EdDSA
//! - `RSA` keys with all CRT parameters for RS256/384/512 and PS256/384/512
//! - `EC` P-256 / P-384 keys for ES256 / ES384
//!
//! Public-only keys (no `d`) can still verify and are published.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// PKCS#8 v1 prefix for a bare Ed25519 private key seed (RFC 8410).
const ED25519_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04, 0x20,
];

/// id-ecPublicKey (1.2.840.10045.2.1), DER contents.
const EC_PUBLIC_KEY_OID: [u8; 7] = [0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01];

const RSA_ALGORITHMS: [Algorithm; 6] = [
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
];

/// A NIST curve usable for ECDSA.
struct EcCurve {
    algorithm: &'static [Algorithm],
    /// Named-curve OID, DER contents.
    oid: &'static [u8],
    /// Byte length of a coordinate and of the private scalar.
    size: usize,
}

const P256: EcCurve = EcCurve {
    algorithm: &[Algorithm::ES256],
    oid: &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07],
    size: 32,
};

const P384: EcCurve = EcCurve {
    algorithm: &[Algorithm::ES384],
    oid: &[0x2b, 0x81, 0x04, 0x00, 0x22],
    size: 48,
};

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("failed to read keystore {path}: {source}")]
    KeystoreRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed keystore: {0}")]
    KeystoreParse(String),

    #[error("key '{0}' not found in keystore")]
    KeyNotFound(String),

    #[error("key '{kid}' cannot be used: {reason}")]
    UnsupportedKey { kid: String, reason: String },

    #[error("token carries no key id")]
    MissingKeyId,

    #[error("token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

/// Where the signing key lives and how to use it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningConfig {
    pub keystore: PathBuf,
    pub key_id: String,
    pub token_alg: Algorithm,
}

/// Claims of a signed request sent to the registrar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRequest {
    pub nonce: String,
    /// Unix timestamp (seconds) as a decimal string.
    pub time: String,
    #[serde(flatten)]
    pub params: BTreeMap<String, String>,
}

#[derive(Clone, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

// No Debug: `d` and `k` hold private key material.
#[derive(Clone, Deserialize)]
struct Jwk {
    kty: String,
    kid: Option<String>,
    alg: Option<String>,
    crv: Option<String>,
    x: Option<String>,
    y: Option<String>,
    d: Option<String>,
    k: Option<String>,
    n: Option<String>,
    e: Option<String>,
    p: Option<String>,
    q: Option<String>,
    dp: Option<String>,
    dq: Option<String>,
    qi: Option<String>,
}

impl Jwk {
    fn kid(&self) -> &str {
        self.kid.as_deref().unwrap_or_default()
    }

    fn unsupported(&self, reason: impl Into<String>) -> SigningError {
        SigningError::UnsupportedKey {
            kid: self.kid().to_string(),
            reason: reason.into(),
        }
    }

    fn decode_field(&self, name: &str, value: Option<&String>) -> Result<Vec<u8>, SigningError> {
        let value = value.ok_or_else(|| self.unsupported(format!("missing '{name}'")))?;
        URL_SAFE_NO_PAD
            .decode(value.trim_end_matches('='))
            .map_err(|e| self.unsupported(format!("'{name}' is not base64url: {e}")))
    }

    fn is_ed25519(&self) -> bool {
        self.kty == "OKP" && self.crv.as_deref() == Some("Ed25519")
    }

    fn is_rsa(&self) -> bool {
        self.kty == "RSA"
    }

    fn ec_curve(&self) -> Option<&'static EcCurve> {
        if self.kty != "EC" {
            return None;
        }
        match self.crv.as_deref() {
            Some("P-256") => Some(&P256),
            Some("P-384") => Some(&P384),
            _ => None,
        }
    }

    /// Algorithms this key may sign or verify with.
    fn algorithms(&self) -> &'static [Algorithm] {
        if self.kty == "oct" {
            &[Algorithm::HS256, Algorithm::HS384, Algorithm::HS512]
        } else if self.is_ed25519() {
            &[Algorithm::EdDSA]
        } else if self.is_rsa() {
            &RSA_ALGORITHMS
        } else if let Some(curve) = self.ec_curve() {
            curve.algorithm
        } else {
            &[]
        }
    }

    fn check_algorithm(&self, alg: Algorithm) -> Result<(), SigningError> {
        if !self.algorithms().contains(&alg) {
            return Err(self.unsupported(format!("algorithm {alg:?} not supported for kty '{}'", self.kty)));
        }
        if let Some(declared) = self.alg.as_deref() {
            if format!("{alg:?}") != declared {
                return Err(self.unsupported(format!("key is declared for {declared}, configured {alg:?}")));
            }
        }
        Ok(())
    }

    fn encoding_key(&self) -> Result<EncodingKey, SigningError> {
        if self.kty == "oct" {
            let secret = self.decode_field("k", self.k.as_ref())?;
            return Ok(EncodingKey::from_secret(&secret));
        }
        if self.is_ed25519() {
            let seed = self.decode_field("d", self.d.as_ref())?;
            if seed.len() != 32 {
                return Err(self.unsupported("Ed25519 private key must be 32 bytes"));
            }
            let mut der = ED25519_PKCS8_PREFIX.to_vec();
            der.extend_from_slice(&seed);
            return Ok(EncodingKey::from_ed_der(&der));
        }
        if self.is_rsa() {
            return Ok(EncodingKey::from_rsa_der(&self.rsa_private_der()?));
        }
        if let Some(curve) = self.ec_curve() {
            return Ok(EncodingKey::from_ec_der(&self.ec_private_der(curve)?));
        }
        Err(self.unsupported(format!("kty '{}' is not supported for signing", self.kty)))
    }

    /// PKCS#1 `RSAPrivateKey` (RFC 8017 A.1.2).
    fn rsa_private_der(&self) -> Result<Vec<u8>, SigningError> {
        let mut body = der_uint(&[0]);
        for (name, value) in [
            ("n", &self.n),
            ("e", &self.e),
            ("d", &self.d),
            ("p", &self.p),
            ("q", &self.q),
            ("dp", &self.dp),
            ("dq", &self.dq),
            ("qi", &self.qi),
        ] {
            body.extend(der_uint(&self.decode_field(name, value.as_ref())?));
        }
        Ok(der_tlv(0x30, &body))
    }

    /// PKCS#8 wrapping an `ECPrivateKey` with its public point (RFC 5915).
    fn ec_private_der(&self, curve: &EcCurve) -> Result<Vec<u8>, SigningError> {
        let d = self.decode_field("d", self.d.as_ref())?;
        let x = self.decode_field("x", self.x.as_ref())?;
        let y = self.decode_field("y", self.y.as_ref())?;
        if d.len() != curve.size || x.len() != curve.size || y.len() != curve.size {
            return Err(self.unsupported(format!("EC key parts must be {} bytes", curve.size)));
        }

        // BIT STRING: no unused bits, uncompressed point.
        let mut point = vec![0x00, 0x04];
        point.extend_from_slice(&x);
        point.extend_from_slice(&y);

        let mut ec_key = der_uint(&[1]);
        ec_key.extend(der_tlv(0x04, &d));
        ec_key.extend(der_tlv(0xa1, &der_tlv(0x03, &point)));

        let mut algorithm = der_tlv(0x06, &EC_PUBLIC_KEY_OID);
        algorithm.extend(der_tlv(0x06, curve.oid));

        let mut body = der_uint(&[0]);
        body.extend(der_tlv(0x30, &algorithm));
        body.extend(der_tlv(0x04, &der_tlv(0x30, &ec_key)));
        Ok(der_tlv(0x30, &body))
    }

    fn public_jwk(&self) -> Option<serde_json::Value> {
        let mut jwk = if self.is_ed25519() {
            serde_json::json!({"kty": "OKP", "crv": "Ed25519", "alg": "EdDSA", "x": self.x.as_ref()?})
        } else if self.is_rsa() {
            serde_json::json!({"kty": "RSA", "n": self.n.as_ref()?, "e": self.e.as_ref()?})
        } else if self.ec_curve().is_some() {
            serde_json::json!({
                "kty": "EC",
                "crv": self.crv.as_ref()?,
                "x": self.x.as_ref()?,
                "y": self.y.as_ref()?,
            })
        } else {
            return None;
        };
        jwk["use"] = "sig".into();
        jwk["kid"] = self.kid.clone()?.into();
        if let Some(alg) = &self.alg {
            jwk["alg"] = alg.clone().into();
        }
        Some(jwk)
    }

    fn decoding_key(&self) -> Result<DecodingKey, SigningError> {
        if self.kty == "oct" {
            let secret = self.decode_field("k", self.k.as_ref())?;
            return Ok(DecodingKey::from_secret(&secret));
        }
        if self.is_ed25519() {
            let x = self.x.as_deref().ok_or_else(|| self.unsupported("missing 'x'"))?;
            return Ok(DecodingKey::from_ed_components(x)?);
        }
        if self.is_rsa() {
            let n = self.n.as_deref().ok_or_else(|| self.unsupported("missing 'n'"))?;
            let e = self.e.as_deref().ok_or_else(|| self.unsupported("missing 'e'"))?;
            return Ok(DecodingKey::from_rsa_components(n, e)?);
        }
        if self.ec_curve().is_some() {
            let x = self.x.as_deref().ok_or_else(|| self.unsupported("missing 'x'"))?;
            let y = self.y.as_deref().ok_or_else(|| self.unsupported("missing 'y'"))?;
            return Ok(DecodingKey::from_ec_components(x, y)?);
        }
        Err(self.unsupported(format!("kty '{}' is not supported for verification", self.kty)))
    }
}

fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
    out.extend_from_slice(content);
    out
}

/// DER INTEGER from unsigned big-endian bytes.
fn der_uint(raw: &[u8]) -> Vec<u8> {
    let start = raw.iter().position(|b| *b != 0).unwrap_or(raw.len());
    let digits = &raw[start..];
    let mut content = Vec::with_capacity(digits.len() + 1);
    if digits.first().is_none_or(|b| b & 0x80 != 0) {
        content.push(0);
    }
    content.extend_from_slice(digits);
    der_tlv(0x02, &content)
}

/// A loaded JWK set.
#[derive(Clone)]
pub struct Keystore {
    keys: Vec<Jwk>,
}

impl core::fmt::Debug for Keystore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.keys.iter().map(Jwk::kid)).finish()
    }
}

impl Keystore {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SigningError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| SigningError::KeystoreRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, SigningError> {
        let set: JwkSet =
            serde_json::from_str(json).map_err(|e| SigningError::KeystoreParse(e.to_string()))?;
        Ok(Self { keys: set.keys })
    }

    fn key(&self, key_id: &str) -> Result<&Jwk, SigningError> {
        self.keys
            .iter()
            .find(|k| k.kid.as_deref() == Some(key_id))
            .ok_or_else(|| SigningError::KeyNotFound(key_id.to_string()))
    }

    /// Build a signer for `key_id` using `alg`.
    pub fn signer(&self, key_id: &str, alg: Algorithm) -> Result<TokenSigner, SigningError> {
        let jwk = self.key(key_id)?;
        jwk.check_algorithm(alg)?;
        Ok(TokenSigner {
            key_id: key_id.to_string(),
            alg,
            key: jwk.encoding_key()?,
        })
    }

    /// Build a verifier accepting tokens signed by any usable key in the set.
    ///
    /// Keys that cannot verify (unsupported type, missing parts) are skipped.
    pub fn verifier(&self) -> TokenVerifier {
        let mut keys = HashMap::new();
        for jwk in &self.keys {
            let Some(kid) = jwk.kid.clone() else { continue };
            match jwk.decoding_key() {
                Ok(key) => {
                    keys.insert(kid, (jwk.algorithms(), key));
                }
                Err(e) => tracing::debug!(error = %e, "skipping key for verification"),
            }
        }
        TokenVerifier { keys }
    }

    /// Public half of the key set, safe to publish.
    ///
    /// Symmetric keys are never published; asymmetric keys lose every private part.
    pub fn public_jwks(&self) -> serde_json::Value {
        let keys: Vec<serde_json::Value> = self.keys.iter().filter_map(Jwk::public_jwk).collect();
        serde_json::json!({ "keys": keys })
    }
}

/// Signs claims into compact tokens with a fixed key.
#[derive(Clone)]
pub struct TokenSigner {
    key_id: String,
    alg: Algorithm,
    key: EncodingKey,
}

impl core::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("key_id", &self.key_id)
            .field("alg", &self.alg)
            .finish_non_exhaustive()
    }
}

impl TokenSigner {
    /// Load the keystore named by `config` and build a signer for its key.
    pub fn from_config(config: &SigningConfig) -> Result<Self, SigningError> {
        Keystore::from_file(&config.keystore)?.signer(&config.key_id, config.token_alg)
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn algorithm(&self) -> Algorithm {
        self.alg
    }

    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String, SigningError> {
        let mut header = Header::new(self.alg);
        header.kid = Some(self.key_id.clone());
        Ok(jsonwebtoken::encode(&header, claims, &self.key)?)
    }
}

/// Verifies compact tokens against a key set, selecting the key by `kid`.
#[derive(Clone)]
pub struct TokenVerifier {
    keys: HashMap<String, (&'static [Algorithm], DecodingKey)>,
}

impl TokenVerifier {
    pub fn verify<T: DeserializeOwned>(&self, token: &str) -> Result<T, SigningError> {
        let header = jsonwebtoken::decode_header(token)?;
        let kid = header.kid.ok_or(SigningError::MissingKeyId)?;
        let (algorithms, key) = self
            .keys
            .get(&kid)
            .ok_or_else(|| SigningError::KeyNotFound(kid.clone()))?;

        if !algorithms.contains(&header.alg) {
            return Err(SigningError::UnsupportedKey {
                kid,
                reason: format!("token algorithm {:?} not allowed for this key", header.alg),
            });
        }

        let mut validation = Validation::new(header.alg);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;

        Ok(jsonwebtoken::decode::<T>(token, key, &validation)?.claims)
    }
}
