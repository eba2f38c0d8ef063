//! Command grammar for the post-authentication request loop.
//!
//! Commands are text lines of the form `<NAME>;<arg1>;<arg2>;...`. The
//! command name selects the operation; semicolons delimit arguments. The
//! grammar is intentionally rigid: wrong argument counts are parse errors,
//! and the session layer answers them with `NOK` without touching any store.

use crate::errors::ProtocolError;

/// A parsed client command.
///
/// # Invariants
///
/// - `encode` and `parse` round-trip for every variant.
/// - Argument strings never contain `;` (enforced during parsing by the
///   fixed split count; enforced during encoding by the command issuer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `CREATE;<domain>`: create a domain owned by the caller
    Create {
        /// Domain name to create
        domain: String,
    },
    /// `ADD;<user>;<domain>`: add a user to a domain the caller owns
    Add {
        /// User to add
        user: String,
        /// Target domain
        domain: String,
    },
    /// `RD;<domain>`: register the session device in a domain
    RegisterDevice {
        /// Target domain
        domain: String,
    },
    /// `MYDOMAINS`: list domains containing the session device
    MyDomains,
    /// `ET;<value>`: submit a temperature reading to every domain the
    /// session device belongs to. The value is client-side context for the
    /// encryption rounds; the server only ever stores the ciphertexts.
    EncryptTemperature {
        /// Plain reading as the client typed it
        value: String,
    },
    /// `EI;<file>`: submit an image to every domain the session device
    /// belongs to
    EncryptImage {
        /// Client-side file name
        file: String,
    },
    /// `RT;<domain>`: read the encrypted temperature ledger of a domain
    ReadTemperatures {
        /// Target domain
        domain: String,
    },
    /// `RI;<user>:<id>`: read the image of another device sharing a domain
    ReadImage {
        /// Owning user of the target device
        user: String,
        /// Target device id
        device_id: u32,
    },
}

impl Command {
    /// Parse a command line.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidCommand`] for unknown names, wrong
    /// argument counts, empty arguments, or a non-numeric device id.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut parts = line.split(';');
        let name = parts.next().unwrap_or("");
        let args: Vec<&str> = parts.collect();

        let malformed = || ProtocolError::InvalidCommand(line.to_string());

        let command = match (name, args.as_slice()) {
            ("CREATE", [domain]) if !domain.is_empty() => {
                Self::Create { domain: (*domain).to_string() }
            },
            ("ADD", [user, domain]) if !user.is_empty() && !domain.is_empty() => {
                Self::Add { user: (*user).to_string(), domain: (*domain).to_string() }
            },
            ("RD", [domain]) if !domain.is_empty() => {
                Self::RegisterDevice { domain: (*domain).to_string() }
            },
            ("MYDOMAINS", []) => Self::MyDomains,
            ("ET", [value]) if !value.is_empty() => {
                Self::EncryptTemperature { value: (*value).to_string() }
            },
            ("EI", [file]) if !file.is_empty() => Self::EncryptImage { file: (*file).to_string() },
            ("RT", [domain]) if !domain.is_empty() => {
                Self::ReadTemperatures { domain: (*domain).to_string() }
            },
            ("RI", [target]) => {
                // Device labels are `<user>:<id>`; the user part is an email
                // and never contains a colon, but split from the right anyway
                // so a hostile label cannot shift the id.
                let (user, id) = target.rsplit_once(':').ok_or_else(malformed)?;
                if user.is_empty() {
                    return Err(malformed());
                }
                let device_id: u32 = id.parse().map_err(|_| malformed())?;
                Self::ReadImage { user: user.to_string(), device_id }
            },
            _ => return Err(malformed()),
        };

        Ok(command)
    }

    /// Encode the command back into its wire line.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Create { domain } => format!("CREATE;{domain}"),
            Self::Add { user, domain } => format!("ADD;{user};{domain}"),
            Self::RegisterDevice { domain } => format!("RD;{domain}"),
            Self::MyDomains => "MYDOMAINS".to_string(),
            Self::EncryptTemperature { value } => format!("ET;{value}"),
            Self::EncryptImage { file } => format!("EI;{file}"),
            Self::ReadTemperatures { domain } => format!("RT;{domain}"),
            Self::ReadImage { user, device_id } => format!("RI;{user}:{device_id}"),
        }
    }
}
