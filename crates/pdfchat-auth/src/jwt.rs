use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use pdfchat_error::{PdfChatError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user ID
    pub exp: i64,
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

impl Claims {
    pub fn new(user_id: &str, issuer: Option<String>, expires_in: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: user_id.to_string(),
            exp: (now + expires_in).timestamp(),
            iat: now.timestamp(),
            iss: issuer,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.sub
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now)
    }
}

/// HS256 session tokens. The subject is the user ID.
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: Option<String>,
}

impl JwtService {
    pub fn new(secret: &str, issuer: Option<String>) -> Self {
        let encoding_key = EncodingKey::from_secret(secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(secret.as_bytes());

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "sub"]);
        if let Some(iss) = issuer.as_deref() {
            validation.set_issuer(&[iss]);
        }

        Self {
            encoding_key,
            decoding_key,
            validation,
            issuer,
        }
    }

    pub fn issue(&self, user_id: &str, expires_in: Duration) -> Result<String> {
        let claims = Claims::new(user_id, self.issuer.clone(), expires_in);
        encode(&Header::default(), &claims, &self.encoding_key).map_err(|e| {
            PdfChatError::Internal {
                message: format!("Failed to sign token: {}", e),
                details: None,
            }
        })
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => PdfChatError::Authentication {
                    message: "token expired".to_string(),
                },
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    PdfChatError::Authentication {
                        message: "invalid token signature".to_string(),
                    }
                }
                jsonwebtoken::errors::ErrorKind::InvalidIssuer => PdfChatError::Authentication {
                    message: "unexpected token issuer".to_string(),
                },
                _ => PdfChatError::Authentication {
                    message: format!("token rejected: {}", e),
                },
            })?;

        // the subject ends up in storage paths
        pdfchat_core::validate_path_segment("user id", &claims.sub).map_err(|_| {
            PdfChatError::Authentication {
                message: "token subject is not a valid user id".to_string(),
            }
        })?;
        Ok(claims)
    }

    pub fn extract_token_from_header(authorization: &str) -> Option<&str> {
        authorization
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}
