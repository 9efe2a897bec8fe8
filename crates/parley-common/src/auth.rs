//! Shared JWT authentication utilities.
//!
//! Tokens are minted by the identity service; the voice server only validates
//! them and takes the subject as the participant id.

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// JWT claims embedded in access tokens.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (participant id)
    pub sub: String,
    /// Username
    pub username: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration (Unix timestamp)
    pub exp: i64,
    /// Token type ("access" or "refresh")
    pub token_type: String,
}

/// Validate and decode a JWT token.
pub fn validate_token(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(token_data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &str, exp_offset: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: "alice".into(),
            username: "alice".into(),
            iat: now,
            exp: now + exp_offset,
            token_type: "access".into(),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn accepts_token_signed_with_shared_secret() {
        let claims = validate_token(&token("s3cret", 600), "s3cret").unwrap();
        assert_eq!(claims.sub, "alice");
    }

    #[test]
    fn rejects_wrong_secret_and_expired_tokens() {
        assert!(validate_token(&token("s3cret", 600), "other").is_err());
        assert!(validate_token(&token("s3cret", -3600), "s3cret").is_err());
    }
}
