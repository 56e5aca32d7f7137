//! Admission checks applied to every inbound request
//!
//! Three gates in a fixed order: source address against the trusted subnet,
//! decryption, integrity tag verification. The subnet gate runs before the
//! body is read so untrusted callers cost nothing, the envelope gates run on
//! the collected body. Both transports funnel through this one type.

use std::net::IpAddr;
use std::str::FromStr;

use ip_network::IpNetwork;
use tally_seal::Opener;

#[derive(thiserror::Error, Debug)]
/// Errors produced by admission checks
pub enum Error {
    /// A trusted subnet is configured but the request named no source
    #[error("source address required but absent")]
    SourceMissing,
    /// The request's source address did not parse
    #[error("unparsable source address: {0}")]
    SourceUnparsable(String),
    /// The request's source address is outside the trusted subnet
    #[error("source address {0} outside trusted subnet")]
    Untrusted(IpAddr),
    /// Trusted subnet configuration did not parse
    #[error("unparsable trusted subnet: {0}")]
    SubnetUnparsable(String),
    /// The payload envelope failed to open
    #[error(transparent)]
    Seal(#[from] tally_seal::Error),
}

impl Error {
    /// True if the failure is about who sent the request rather than what
    /// it contained. Source failures map to forbidden, envelope failures to
    /// bad request or unauthenticated.
    #[must_use]
    pub fn is_source_error(&self) -> bool {
        matches!(
            self,
            Error::SourceMissing | Error::SourceUnparsable(_) | Error::Untrusted(_)
        )
    }
}

/// Parse a trusted subnet, either CIDR notation or a bare address which is
/// treated as a host-length prefix.
///
/// # Errors
///
/// Function will error if `raw` is neither a network nor an address.
pub fn parse_subnet(raw: &str) -> Result<IpNetwork, Error> {
    if let Ok(net) = IpNetwork::from_str(raw) {
        return Ok(net);
    }
    match IpAddr::from_str(raw) {
        Ok(IpAddr::V4(ip)) => {
            IpNetwork::new(ip, 32).map_err(|_| Error::SubnetUnparsable(raw.to_string()))
        }
        Ok(IpAddr::V6(ip)) => {
            IpNetwork::new(ip, 128).map_err(|_| Error::SubnetUnparsable(raw.to_string()))
        }
        Err(_) => Err(Error::SubnetUnparsable(raw.to_string())),
    }
}

#[derive(Debug, Clone)]
/// Per-request admission checks, shared by both transports.
pub struct Guard {
    trusted_subnet: Option<IpNetwork>,
    opener: Opener,
}

impl Guard {
    /// Build a guard from configuration. All three gates are optional and
    /// disabled when their configuration is absent.
    ///
    /// # Errors
    ///
    /// Function will error if the subnet or key material does not parse.
    pub fn new(
        trusted_subnet: Option<&str>,
        secret: Option<&str>,
        private_key_pem: Option<&str>,
    ) -> Result<Self, Error> {
        let trusted_subnet = trusted_subnet.map(parse_subnet).transpose()?;
        let opener = Opener::new(secret, private_key_pem)?;
        Ok(Self {
            trusted_subnet,
            opener,
        })
    }

    /// Check the declared source address against the trusted subnet. Runs
    /// before the body is read.
    ///
    /// # Errors
    ///
    /// Function will error if a subnet is configured and the source is
    /// absent, unparsable or outside it.
    pub fn check_source(&self, declared: Option<&str>) -> Result<(), Error> {
        let Some(subnet) = &self.trusted_subnet else {
            return Ok(());
        };
        let declared = declared.ok_or(Error::SourceMissing)?;
        let ip = IpAddr::from_str(declared.trim())
            .map_err(|_| Error::SourceUnparsable(declared.to_string()))?;
        if subnet.contains(ip) {
            Ok(())
        } else {
            Err(Error::Untrusted(ip))
        }
    }

    /// Open the payload envelope: decrypt, then verify the integrity tag
    /// against the recovered plaintext.
    ///
    /// # Errors
    ///
    /// Function will error if either envelope layer rejects the payload.
    pub fn open(&self, body: &[u8], tag: Option<&str>) -> Result<Vec<u8>, Error> {
        Ok(self.opener.open(body, tag)?)
    }

    /// Integrity tag for an outbound response body, present iff a shared
    /// secret is configured.
    ///
    /// # Errors
    ///
    /// Function will error if the mac implementation rejects the secret.
    pub fn response_tag(&self, body: &[u8]) -> Result<Option<String>, Error> {
        Ok(self.opener.response_tag(body)?)
    }
}
