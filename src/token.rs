//! Access tokens gating the signing portal
//!
//! A token is 256 bits from the OS RNG, bech32m encoded under the `sign` prefix
//! so it is URL safe and carries a checksum. Reissuing a token is the only form
//! of revocation: the old value moves to the retired index and resolves to
//! [`LifecycleError::LinkExpired`](crate::error::LifecycleError::LinkExpired).
use super::document::TimeStamp;
use super::error::LifecycleError;
use bech32::{Bech32m, Hrp};
use chrono::Utc;
use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;

const TOKEN_HRP: &str = "sign";
const TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessToken(String);

/// Live token index entry.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct TokenBinding {
    #[n(0)]
    pub document_id: String,
    #[n(1)]
    pub recipient_id: String,
}

/// Retired token index entry.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct RetiredToken {
    #[n(0)]
    pub document_id: String,
    #[n(1)]
    pub retired_at: TimeStamp<Utc>,
}

/// Mint a fresh token.
pub fn issue() -> Result<AccessToken, LifecycleError> {
    let mut entropy = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut entropy);

    let hrp = Hrp::parse(TOKEN_HRP).map_err(|e| LifecycleError::Codec(e.to_string()))?;
    let encoded = bech32::encode::<Bech32m>(hrp, &entropy)
        .map_err(|e| LifecycleError::Codec(e.to_string()))?;

    Ok(AccessToken(encoded))
}

impl AccessToken {
    /// Parse a token presented by the portal. Anything that could never have
    /// been issued is rejected before touching storage.
    pub fn parse(raw: &str) -> Result<Self, LifecycleError> {
        let (hrp, data) =
            bech32::decode(raw).map_err(|_| LifecycleError::not_found("signing link"))?;
        if hrp.as_str() != TOKEN_HRP || data.len() != TOKEN_BYTES {
            return Err(LifecycleError::not_found("signing link"));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
