//! JOSE header

use crate::error::{TokenError, TokenResult};
use serde::{Deserialize, Serialize};
use sigil_key::Algorithm;

/// Media type carried in `typ`
pub const TOKEN_TYPE: &str = "JWT";

/// Token header: `alg`, `typ`, `kid`
///
/// `alg` deserializes only into the closed [`Algorithm`] set, so `none` and
/// unknown names never produce a header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Signature algorithm
    pub alg: Algorithm,
    /// Media type, `JWT`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    /// Signing key identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// Critical extensions; none are understood
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crit: Option<Vec<String>>,
}

impl Header {
    /// Header for a token signed with `alg` under `kid`
    #[must_use]
    pub fn new(alg: Algorithm, kid: &str) -> Self {
        Self {
            alg,
            typ: Some(TOKEN_TYPE.to_string()),
            kid: Some(kid.to_string()),
            crit: None,
        }
    }

    /// Parse decoded header bytes, requiring a `kid` and a `JWT` type
    ///
    /// # Errors
    /// `MalformedToken` for invalid JSON, an unsupported `alg`, a missing
    /// `kid`, another `typ`, or any critical extension.
    pub fn parse(bytes: &[u8]) -> TokenResult<Self> {
        let header: Header = serde_json::from_slice(bytes)
            .map_err(|e| TokenError::MalformedToken(format!("invalid header: {e}")))?;
        if header.kid.as_deref().map_or(true, str::is_empty) {
            return Err(TokenError::malformed("header has no kid"));
        }
        if let Some(typ) = &header.typ {
            if !typ.eq_ignore_ascii_case(TOKEN_TYPE) {
                return Err(TokenError::MalformedToken(format!("unexpected typ '{typ}'")));
            }
        }
        if header.crit.is_some() {
            return Err(TokenError::malformed("critical header extensions are not supported"));
        }
        Ok(header)
    }

    /// Key identifier; empty if absent
    #[inline]
    #[must_use]
    pub fn kid(&self) -> &str {
        self.kid.as_deref().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_header() {
        let header = Header::parse(br#"{"alg":"ES256","typ":"jwt","kid":"k1"}"#).unwrap();
        assert_eq!(header.alg, Algorithm::ES256);
        assert_eq!(header.kid(), "k1");
    }

    #[test]
    fn rejects_none_unknown_and_incomplete_headers() {
        for raw in [
            r#"{"alg":"none","typ":"JWT","kid":"k1"}"#,
            r#"{"alg":"HS1024","kid":"k1"}"#,
            r#"{"typ":"JWT","kid":"k1"}"#,
            r#"{"alg":"HS256","typ":"JWT"}"#,
            r#"{"alg":"HS256","kid":""}"#,
            r#"{"alg":"HS256","kid":"k1","typ":"at+jwt"}"#,
            r#"{"alg":"HS256","kid":"k1","crit":["exp"]}"#,
            r#"["HS256"]"#,
        ] {
            assert!(
                matches!(Header::parse(raw.as_bytes()), Err(TokenError::MalformedToken(_))),
                "{raw} should be rejected"
            );
        }
    }
}
