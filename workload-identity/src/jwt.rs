use crate::error::{Error, Result};
use jsonwebtoken::{DecodingKey, Validation};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use spiffe::SpiffeId;
use std::fmt;
use std::marker::PhantomData;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const BEARER_PREFIX: &str = "Bearer ";

/// A JWT-SVID as fetched from the agent, with its claims decoded.
///
/// The claims are read without checking the signature. Only the agent (or a
/// peer validating through its own agent) decides whether a token is genuine.
#[derive(Clone)]
pub struct JwtToken {
    token: String,
    subject: SpiffeId,
    audience: Vec<String>,
    expiry: u64,
}

impl fmt::Debug for JwtToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtToken")
            .field("subject", &self.subject)
            .field("audience", &self.audience)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct Claims {
    sub: String,
    #[serde(deserialize_with = "string_or_seq_string")]
    aud: Vec<String>,
    exp: u64,
}

impl JwtToken {
    /// Decodes the claims of a compact JWT.
    ///
    /// # Errors
    ///
    /// [`Error::Jwt`] when the token is malformed, lacks `sub`/`aud`/`exp`,
    /// or `sub` is not a SPIFFE ID.
    pub fn parse(token: impl Into<String>) -> Result<Self> {
        let token = token.into();

        let mut validation = Validation::default();
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = jsonwebtoken::decode::<Claims>(&token, &DecodingKey::from_secret(&[]), &validation)
            .map_err(|e| Error::Jwt(e.to_string()))?;

        let subject = SpiffeId::new(&data.claims.sub).map_err(|e| Error::Jwt(e.to_string()))?;

        Ok(Self {
            token,
            subject,
            audience: data.claims.aud,
            expiry: data.claims.exp,
        })
    }

    /// The compact token.
    pub fn as_str(&self) -> &str {
        &self.token
    }

    /// The `sub` claim.
    pub fn subject(&self) -> &SpiffeId {
        &self.subject
    }

    /// The `aud` claim.
    pub fn audience(&self) -> &[String] {
        &self.audience
    }

    /// The `exp` claim.
    pub fn expiry(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.expiry)
    }

    /// True when the token is expired or expires within `window`.
    pub fn expires_within(&self, window: Duration) -> bool {
        match self.expiry().duration_since(SystemTime::now()) {
            Ok(remaining) => remaining < window,
            Err(_) => true,
        }
    }
}

/// Extracts the token from an `Authorization` header value.
///
/// Returns `None` unless the value starts with `"Bearer "`. The token itself
/// may be empty; the agent rejects it during validation.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    header_value.strip_prefix(BEARER_PREFIX)
}

// `aud` is either a single string or an array of strings.
fn string_or_seq_string<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct StringOrVec(PhantomData<Vec<String>>);

    impl<'de> de::Visitor<'de> for StringOrVec {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("string or sequence of strings")
        }

        fn visit_str<E>(self, v: &str) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![v.to_owned()])
        }

        fn visit_seq<S>(self, mut seq: S) -> std::result::Result<Self::Value, S::Error>
        where
            S: de::SeqAccess<'de>,
        {
            let mut result = Vec::new();
            while let Some(elem) = seq.next_element::<String>()? {
                result.push(elem);
            }
            Ok(result)
        }
    }

    deserializer.deserialize_any(StringOrVec(PhantomData))
}
