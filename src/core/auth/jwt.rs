//! JWT utilities for token signing and parsing
//!
//! Access tokens are signed with RS256. The private key is loaded once at
//! startup; the matching public key is published as a JSON Web Key Set so other
//! services can verify signatures without calling this service.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::auth::claims::Claims;

/// JWT signing algorithm (RS256 for RSA keys)
const JWT_ALGORITHM: Algorithm = Algorithm::RS256;

/// JWT errors
#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Invalid RSA private key: {0}")]
    InvalidKey(String),

    #[error("Token encoding failed: {0}")]
    EncodingError(String),

    #[error("Token decoding failed: {0}")]
    DecodingError(String),

    #[error("Token expired")]
    Expired,

    #[error("Invalid token")]
    InvalidToken,
}

impl From<jsonwebtoken::errors::Error> for JwtError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => JwtError::Expired,
            ErrorKind::InvalidToken
            | ErrorKind::InvalidSignature
            | ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidIssuer
            | ErrorKind::MissingRequiredClaim(_) => JwtError::InvalidToken,
            _ => JwtError::DecodingError(err.to_string()),
        }
    }
}

/// Public signing key in JWK form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub alg: String,
    pub kty: String,
    #[serde(rename = "use")]
    pub usage: String,
    pub kid: String,
    /// Modulus, base64url without padding
    pub n: String,
    /// Public exponent, base64url without padding
    pub e: String,
}

/// JSON Web Key Set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// JWT service for token operations
#[derive(Clone)]
pub struct JwtService {
    issuer: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    jwk: Jwk,
    strict: Validation,
    ignore_expiry: Validation,
}

impl std::fmt::Debug for JwtService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtService")
            .field("issuer", &self.issuer)
            .field("kid", &self.jwk.kid)
            .finish_non_exhaustive()
    }
}

impl JwtService {
    /// Build the service from an RSA private key in PEM form (PKCS#1 or PKCS#8)
    pub fn from_rsa_pem(pem: &str, issuer: impl Into<String>) -> Result<Self, JwtError> {
        let private_key = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(|e| JwtError::InvalidKey(e.to_string()))?;

        Self::from_rsa_key(&private_key, issuer)
    }

    /// Build the service from a parsed RSA private key
    pub fn from_rsa_key(
        private_key: &RsaPrivateKey,
        issuer: impl Into<String>,
    ) -> Result<Self, JwtError> {
        let issuer = issuer.into();

        let der = private_key
            .to_pkcs1_der()
            .map_err(|e| JwtError::InvalidKey(e.to_string()))?;
        let encoding_key = EncodingKey::from_rsa_der(der.as_bytes());

        let public_key = RsaPublicKey::from(private_key);
        let n = URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be());
        let e = URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be());
        let decoding_key = DecodingKey::from_rsa_components(&n, &e)
            .map_err(|err| JwtError::InvalidKey(err.to_string()))?;

        let jwk = Jwk {
            alg: "RS256".to_string(),
            kty: "RSA".to_string(),
            usage: "sig".to_string(),
            kid: thumbprint(&n, &e),
            n,
            e,
        };

        Ok(Self {
            strict: validation(&issuer, true),
            ignore_expiry: validation(&issuer, false),
            issuer,
            encoding_key,
            decoding_key,
            jwk,
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Key id placed in every token header
    pub fn key_id(&self) -> &str {
        &self.jwk.kid
    }

    /// Sign `claims` into a compact JWT
    pub fn sign(&self, claims: &Claims) -> Result<String, JwtError> {
        let mut header = Header::new(JWT_ALGORITHM);
        header.kid = Some(self.jwk.kid.clone());

        encode(&header, claims, &self.encoding_key)
            .map_err(|e| JwtError::EncodingError(e.to_string()))
    }

    /// Verify signature, issuer and expiration, returning the claims
    pub fn decode(&self, token: &str) -> Result<Claims, JwtError> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &self.strict)?;
        Ok(token_data.claims)
    }

    /// Verify signature and issuer but accept expired tokens.
    ///
    /// Used wherever a token only has to prove which session it belongs to.
    pub fn decode_ignoring_expiry(&self, token: &str) -> Result<Claims, JwtError> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &self.ignore_expiry)?;
        Ok(token_data.claims)
    }

    /// Public key set for signature verification by other services
    pub fn jwks(&self) -> Jwks {
        Jwks {
            keys: vec![self.jwk.clone()],
        }
    }
}

fn validation(issuer: &str, check_expiry: bool) -> Validation {
    let mut validation = Validation::new(JWT_ALGORITHM);
    validation.set_issuer(&[issuer]);
    validation.set_required_spec_claims(&["exp", "sub", "iss"]);
    validation.validate_exp = check_expiry;
    validation.leeway = 0;
    validation
}

/// RFC 7638 SHA-256 thumbprint of an RSA public key
fn thumbprint(n: &str, e: &str) -> String {
    let canonical = format!(r#"{{"e":"{e}","kty":"RSA","n":"{n}"}}"#);
    URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
}

#[cfg(test)]
pub(crate) const TEST_PRIVATE_KEY: &str = include_str!("testdata/private_key.pem");

#[cfg(test)]
pub(crate) const OTHER_PRIVATE_KEY: &str = include_str!("testdata/other_key.pem");

#[cfg(test)]
pub(crate) fn test_service() -> JwtService {
    JwtService::from_rsa_pem(TEST_PRIVATE_KEY, "test-issuer").unwrap()
}
