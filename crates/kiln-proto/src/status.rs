//! Status tokens for the Kiln protocol.
//!
//! Every server reply begins with a status token. The tokens cross the wire
//! as literal strings and clients match on them literally, so the vocabulary
//! here is fixed: renaming a variant's string is a wire-breaking change.
//!
//! # Token Groups
//!
//! - Generic results: `OK`, `NOK`
//! - Authorization failures: `NRD`, `NODM`, `NOID`, `NOUSER`, `NOPERM`,
//!   `NODATA`
//! - Handshake progress: `NEW-USER`, `FOUND-USER`, `OK-NEW-USER`, `OK-USER`,
//!   `OK-2FA`
//! - Device validation: `OK-DEVID`, `NOK-DEVID`, `OK-TESTED`, `NOK-TESTED`

use crate::errors::ProtocolError;

/// Reply status tokens.
///
/// # Security
///
/// Authentication failures always surface as the generic [`Status::Nok`]
/// so a peer cannot learn which specific check failed. The specific
/// authorization tokens (`NOPERM`, `NOUSER`, ...) are only used after a
/// session is fully authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Operation succeeded
    Ok,
    /// Operation failed (generic, no detail leaked)
    Nok,
    /// Device is not registered in any domain
    Nrd,
    /// Domain does not exist
    NoDomain,
    /// Device does not exist
    NoDevice,
    /// User does not exist
    NoUser,
    /// Caller lacks permission
    NoPermission,
    /// No data stored for the request
    NoData,
    /// Identity not yet known to the server
    NewUser,
    /// Identity found in the user directory
    FoundUser,
    /// Challenge verified, new user persisted
    OkNewUser,
    /// Challenge verified for an existing user
    OkUser,
    /// One-time code accepted
    Ok2fa,
    /// Device id accepted
    OkDevId,
    /// Remote attestation passed
    OkTested,
    /// Device id rejected
    NokDevId,
    /// Remote attestation failed
    NokTested,
}

impl Status {
    /// The literal token as it crosses the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Nok => "NOK",
            Self::Nrd => "NRD",
            Self::NoDomain => "NODM",
            Self::NoDevice => "NOID",
            Self::NoUser => "NOUSER",
            Self::NoPermission => "NOPERM",
            Self::NoData => "NODATA",
            Self::NewUser => "NEW-USER",
            Self::FoundUser => "FOUND-USER",
            Self::OkNewUser => "OK-NEW-USER",
            Self::OkUser => "OK-USER",
            Self::Ok2fa => "OK-2FA",
            Self::OkDevId => "OK-DEVID",
            Self::OkTested => "OK-TESTED",
            Self::NokDevId => "NOK-DEVID",
            Self::NokTested => "NOK-TESTED",
        }
    }

    /// Parse a literal token.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidStatus`] for tokens outside the
    /// vocabulary. Unknown tokens MUST be treated as protocol errors, not
    /// silently ignored.
    pub fn parse(token: &str) -> Result<Self, ProtocolError> {
        match token {
            "OK" => Ok(Self::Ok),
            "NOK" => Ok(Self::Nok),
            "NRD" => Ok(Self::Nrd),
            "NODM" => Ok(Self::NoDomain),
            "NOID" => Ok(Self::NoDevice),
            "NOUSER" => Ok(Self::NoUser),
            "NOPERM" => Ok(Self::NoPermission),
            "NODATA" => Ok(Self::NoData),
            "NEW-USER" => Ok(Self::NewUser),
            "FOUND-USER" => Ok(Self::FoundUser),
            "OK-NEW-USER" => Ok(Self::OkNewUser),
            "OK-USER" => Ok(Self::OkUser),
            "OK-2FA" => Ok(Self::Ok2fa),
            "OK-DEVID" => Ok(Self::OkDevId),
            "OK-TESTED" => Ok(Self::OkTested),
            "NOK-DEVID" => Ok(Self::NokDevId),
            "NOK-TESTED" => Ok(Self::NokTested),
            other => Err(ProtocolError::InvalidStatus(other.to_string())),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
