//! Signed session tokens.
//!
//! The account service signs `user_id || valid_until` with its Ed25519 key
//! and hands the client an opaque base64url string. The chat server only
//! holds the issuer's public key and never mints tokens itself.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::TokenError;
use crate::types::UserId;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionToken {
    user_id: String,
    valid_until: DateTime<Utc>,
    signature: Vec<u8>,
}

fn signing_payload(user_id: &str, valid_until: &DateTime<Utc>) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(user_id.as_bytes());
    payload.extend_from_slice(valid_until.to_rfc3339().as_bytes());
    payload
}

pub fn issue_token(
    user_id: &UserId,
    valid_until: DateTime<Utc>,
    issuer_key: &SigningKey,
) -> String {
    let signature = issuer_key.sign(&signing_payload(user_id.as_str(), &valid_until));

    let token = SessionToken {
        user_id: user_id.as_str().to_string(),
        valid_until,
        signature: signature.to_bytes().to_vec(),
    };

    // Serializing a struct of plain strings and bytes cannot fail.
    let json = serde_json::to_vec(&token).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

pub fn verify_token(credential: &str, issuer_pubkey: &[u8; 32]) -> Result<UserId, TokenError> {
    let raw = URL_SAFE_NO_PAD
        .decode(credential.trim())
        .map_err(|_| TokenError::Encoding)?;

    let token: SessionToken =
        serde_json::from_slice(&raw).map_err(|e| TokenError::Malformed(e.to_string()))?;

    let user_id =
        UserId::parse(&token.user_id).map_err(|e| TokenError::Malformed(e.to_string()))?;

    let verifying_key =
        VerifyingKey::from_bytes(issuer_pubkey).map_err(|_| TokenError::BadIssuerKey)?;
    let signature =
        Signature::from_slice(&token.signature).map_err(|_| TokenError::BadSignature)?;

    verifying_key
        .verify(&signing_payload(&token.user_id, &token.valid_until), &signature)
        .map_err(|_| TokenError::BadSignature)?;

    if Utc::now() > token.valid_until {
        return Err(TokenError::Expired);
    }

    Ok(user_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rand::rngs::OsRng;

    fn user() -> UserId {
        UserId::parse("64f1c0ffee").unwrap()
    }

    #[test]
    fn test_token_valid() {
        let issuer = SigningKey::generate(&mut OsRng);
        let pubkey = issuer.verifying_key().to_bytes();

        let token = issue_token(&user(), Utc::now() + Duration::days(7), &issuer);

        assert_eq!(verify_token(&token, &pubkey), Ok(user()));
        // Surrounding whitespace from copy-pasted headers is tolerated.
        assert_eq!(verify_token(&format!(" {token}\n"), &pubkey), Ok(user()));
    }

    #[test]
    fn test_token_expired() {
        let issuer = SigningKey::generate(&mut OsRng);
        let pubkey = issuer.verifying_key().to_bytes();

        let token = issue_token(&user(), Utc::now() - Duration::days(1), &issuer);

        assert_eq!(verify_token(&token, &pubkey), Err(TokenError::Expired));
    }

    #[test]
    fn test_token_wrong_issuer_key() {
        let issuer = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);

        let token = issue_token(&user(), Utc::now() + Duration::days(7), &issuer);

        assert_eq!(
            verify_token(&token, &other.verifying_key().to_bytes()),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_token_garbage() {
        let issuer = SigningKey::generate(&mut OsRng);
        let pubkey = issuer.verifying_key().to_bytes();

        assert_eq!(verify_token("!!!", &pubkey), Err(TokenError::Encoding));
        assert!(matches!(
            verify_token(&URL_SAFE_NO_PAD.encode(b"{}"), &pubkey),
            Err(TokenError::Malformed(_))
        ));
    }

    #[test]
    fn test_tampered_user_id_rejected() {
        let issuer = SigningKey::generate(&mut OsRng);
        let pubkey = issuer.verifying_key().to_bytes();

        let token = issue_token(&user(), Utc::now() + Duration::days(7), &issuer);
        let raw = URL_SAFE_NO_PAD.decode(&token).unwrap();
        let mut parsed: SessionToken = serde_json::from_slice(&raw).unwrap();
        parsed.user_id = "someone-else".into();
        let forged = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&parsed).unwrap());

        assert_eq!(verify_token(&forged, &pubkey), Err(TokenError::BadSignature));
    }
}
