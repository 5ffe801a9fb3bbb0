use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shared::{domain::UserId, error::ChatError};

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
}

/// Issues and verifies the HS256 bearer tokens that gate both the REST
/// surface and the WebSocket handshake.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &str, ttl_seconds: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    pub fn issue(&self, user_id: UserId) -> Result<String, ChatError> {
        let claims = Claims {
            sub: user_id.to_string(),
            exp: (Utc::now() + self.ttl).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| ChatError::AuthenticationFailed(e.to_string()))
    }

    pub fn verify(&self, token: &str) -> Result<UserId, ChatError> {
        let mut validation = Validation::default();
        validation.leeway = 0;
        let data = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|e| ChatError::AuthenticationFailed(e.to_string()))?;
        let id = Uuid::parse_str(&data.claims.sub)
            .map_err(|_| ChatError::AuthenticationFailed("malformed subject claim".into()))?;
        Ok(UserId(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies_to_the_same_user() {
        let issuer = TokenIssuer::new("test-secret", 3600);
        let user = UserId::generate();
        let token = issuer.issue(user).expect("issue");
        assert_eq!(issuer.verify(&token).expect("verify"), user);
    }

    #[test]
    fn token_signed_with_another_secret_is_rejected() {
        let issuer = TokenIssuer::new("test-secret", 3600);
        let other = TokenIssuer::new("other-secret", 3600);
        let token = other.issue(UserId::generate()).expect("issue");
        assert!(matches!(
            issuer.verify(&token),
            Err(ChatError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let issuer = TokenIssuer::new("test-secret", -60);
        let token = issuer.issue(UserId::generate()).expect("issue");
        assert!(matches!(
            issuer.verify(&token),
            Err(ChatError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn garbage_token_is_rejected() {
        let issuer = TokenIssuer::new("test-secret", 3600);
        assert!(issuer.verify("not-a-jwt").is_err());
    }
}
