//! DPoP proofs (RFC 9449)
//!
//! Each OAuth session owns one P-256 key. Requests to the authorization
//! server and to the PDS carry a `DPoP` header holding a JWT signed with it;
//! requests made with an access token also bind that token through `ath`.
//! Servers hand out nonces in `DPoP-Nonce`, which are kept per origin and
//! included in later proofs.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use jsonwebtoken::jwk::{
    AlgorithmParameters, CommonParameters, EllipticCurve, EllipticCurveKeyParameters,
    EllipticCurveKeyType, Jwk,
};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rand::RngCore;
use reqwest::Method;
use reqwest::header::HeaderMap;
use ring::rand::SystemRandom;
use ring::signature::{ECDSA_P256_SHA256_FIXED_SIGNING, EcdsaKeyPair, KeyPair};
use serde::Serialize;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{AppError, XrpcError};

/// Request header carrying the proof
pub const DPOP_HEADER: &str = "DPoP";
/// Response header carrying a server-issued nonce
pub const DPOP_NONCE_HEADER: &str = "DPoP-Nonce";
/// JOSE `typ` of a proof
const PROOF_TYPE: &str = "dpop+jwt";

#[derive(Debug, Serialize)]
struct ProofClaims<'a> {
    jti: String,
    htm: &'a str,
    htu: String,
    iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ath: Option<String>,
}

/// ES256 key that DPoP-bound tokens are tied to
pub struct DpopKey {
    pkcs8: Vec<u8>,
    encoding_key: EncodingKey,
    x: String,
    y: String,
    nonces: Mutex<HashMap<String, String>>,
}

impl DpopKey {
    /// Fresh random key
    pub fn generate() -> Result<Self, AppError> {
        let document = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &SystemRandom::new())
            .map_err(|_| AppError::OAuth("Could not generate a DPoP key".to_string()))?;
        Self::from_pkcs8(document.as_ref())
    }

    /// Key from a PKCS#8 document
    pub fn from_pkcs8(pkcs8: &[u8]) -> Result<Self, AppError> {
        let pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8, &SystemRandom::new())
            .map_err(|e| AppError::OAuth(format!("Invalid DPoP key: {e}")))?;

        // Uncompressed SEC1 point: 0x04 || x || y
        let point = pair.public_key().as_ref();
        if point.len() != 65 || point[0] != 0x04 {
            return Err(AppError::OAuth("Unexpected DPoP public key encoding".to_string()));
        }

        Ok(Self {
            pkcs8: pkcs8.to_vec(),
            encoding_key: EncodingKey::from_ec_der(pkcs8),
            x: URL_SAFE_NO_PAD.encode(&point[1..33]),
            y: URL_SAFE_NO_PAD.encode(&point[33..]),
            nonces: Mutex::new(HashMap::new()),
        })
    }

    /// Key as stored next to the tokens
    pub fn from_encoded(encoded: &str) -> Result<Self, AppError> {
        let pkcs8 = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| AppError::OAuth(format!("Invalid DPoP key encoding: {e}")))?;
        Self::from_pkcs8(&pkcs8)
    }

    /// Base64url PKCS#8 document for device storage
    pub fn encoded(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.pkcs8)
    }

    /// Public half as a JWK
    pub fn public_jwk(&self) -> Jwk {
        Jwk {
            common: CommonParameters::default(),
            algorithm: AlgorithmParameters::EllipticCurve(EllipticCurveKeyParameters {
                key_type: EllipticCurveKeyType::EC,
                curve: EllipticCurve::P256,
                x: self.x.clone(),
                y: self.y.clone(),
            }),
        }
    }

    /// Signed proof for one request
    ///
    /// `htu` is the request URL without query and fragment. `access_token`
    /// is bound through `ath` for resource server requests.
    ///
    /// # Errors
    /// Returns `XrpcError::Signing` if the JWT cannot be encoded
    pub fn proof(
        &self,
        label: &str,
        method: &Method,
        url: &Url,
        access_token: Option<&str>,
    ) -> Result<String, XrpcError> {
        let mut htu = url.clone();
        htu.set_query(None);
        htu.set_fragment(None);

        let mut jti = [0_u8; 16];
        rand::thread_rng().fill_bytes(&mut jti);

        let claims = ProofClaims {
            jti: URL_SAFE_NO_PAD.encode(jti),
            htm: method.as_str(),
            htu: htu.to_string(),
            iat: Utc::now().timestamp(),
            nonce: self.nonce_for(url),
            ath: access_token.map(|token| URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes()))),
        };

        let mut header = Header::new(Algorithm::ES256);
        header.typ = Some(PROOF_TYPE.to_string());
        header.jwk = Some(self.public_jwk());

        jsonwebtoken::encode(&header, &claims, &self.encoding_key)
            .map_err(|e| XrpcError::signing(label, e))
    }

    /// Last nonce issued by the origin of `url`
    pub fn nonce_for(&self, url: &Url) -> Option<String> {
        self.nonces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&url.origin().ascii_serialization())
            .cloned()
    }

    /// Keep the nonce a response carries, if any
    pub fn remember_nonce(&self, url: &Url, headers: &HeaderMap) {
        let Some(nonce) = headers
            .get(DPOP_NONCE_HEADER)
            .and_then(|value| value.to_str().ok())
        else {
            return;
        };
        self.nonces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.origin().ascii_serialization(), nonce.to_string());
    }
}

impl PartialEq for DpopKey {
    fn eq(&self, other: &Self) -> bool {
        self.x == other.x && self.y == other.y
    }
}

impl Eq for DpopKey {}

impl std::fmt::Debug for DpopKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DpopKey")
            .field("x", &self.x)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};
    use reqwest::header::HeaderValue;

    fn verify(key: &DpopKey, proof: &str) -> serde_json::Value {
        let header = jsonwebtoken::decode_header(proof).unwrap();
        assert_eq!(header.typ.as_deref(), Some(PROOF_TYPE));
        assert_eq!(header.alg, Algorithm::ES256);
        assert_eq!(header.jwk, Some(key.public_jwk()));

        let mut validation = Validation::new(Algorithm::ES256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        let decoding_key = DecodingKey::from_ec_components(&key.x, &key.y).unwrap();
        jsonwebtoken::decode::<serde_json::Value>(proof, &decoding_key, &validation)
            .unwrap()
            .claims
    }

    #[test]
    fn proof_is_signed_by_the_embedded_key() {
        let key = DpopKey::generate().unwrap();
        let url = Url::parse("https://pds.example.com/xrpc/app.test?limit=30#frag").unwrap();

        let claims = verify(&key, &key.proof("app.test", &Method::GET, &url, None).unwrap());

        assert_eq!(claims["htm"], "GET");
        assert_eq!(claims["htu"], "https://pds.example.com/xrpc/app.test");
        assert!(claims["iat"].as_i64().unwrap() > 0);
        assert!(claims.get("ath").is_none());
        assert!(claims.get("nonce").is_none());
    }

    #[test]
    fn proof_binds_access_token_and_nonce() {
        let key = DpopKey::generate().unwrap();
        let url = Url::parse("https://pds.example.com/xrpc/app.test").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(DPOP_NONCE_HEADER, HeaderValue::from_static("n-1"));
        key.remember_nonce(&url, &headers);

        let claims = verify(&key, &key.proof("app.test", &Method::POST, &url, Some("tok")).unwrap());

        assert_eq!(claims["nonce"], "n-1");
        assert_eq!(claims["ath"], URL_SAFE_NO_PAD.encode(Sha256::digest(b"tok")));

        // nonces are per origin
        let other = Url::parse("https://auth.example.com/oauth/token").unwrap();
        assert_eq!(key.nonce_for(&other), None);
    }

    #[test]
    fn proofs_are_unique() {
        let key = DpopKey::generate().unwrap();
        let url = Url::parse("https://pds.example.com/xrpc/app.test").unwrap();
        let a = verify(&key, &key.proof("app.test", &Method::GET, &url, None).unwrap());
        let b = verify(&key, &key.proof("app.test", &Method::GET, &url, None).unwrap());
        assert_ne!(a["jti"], b["jti"]);
    }

    #[test]
    fn encoded_key_round_trips_without_debug_leak() {
        let key = DpopKey::generate().unwrap();
        let restored = DpopKey::from_encoded(&key.encoded()).unwrap();
        assert_eq!(key, restored);
        assert_ne!(key, DpopKey::generate().unwrap());
        assert!(!format!("{key:?}").contains(&key.encoded()));
        assert!(DpopKey::from_encoded("not base64!").is_err());
    }
}
