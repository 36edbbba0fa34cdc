//! Transfer descriptors handed over by the catalog client.

use super::{InfoHash, SwarmError};

/// Reference to a swarm transfer: a magnet URI plus what it resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDescriptor {
    /// The original magnet URI
    pub magnet: String,
    /// Info hash from the `xt=urn:btih:` topic
    pub info_hash: InfoHash,
    /// Display name from the `dn` parameter, when present
    pub display_name: Option<String>,
    /// Listing page the descriptor was discovered on, when known
    pub source_url: Option<String>,
}

impl TransferDescriptor {
    /// Parses a magnet URI.
    ///
    /// # Errors
    ///
    /// - `SwarmError::InvalidDescriptor` - Malformed URI or missing btih topic
    pub fn parse(magnet: &str) -> Result<Self, SwarmError> {
        let parsed = magnet_url::Magnet::new(magnet).map_err(|e| SwarmError::InvalidDescriptor {
            reason: format!("invalid magnet link: {e}"),
        })?;

        let info_hash = extract_btih(magnet)?;

        Ok(Self {
            magnet: magnet.to_string(),
            info_hash,
            display_name: parsed.display_name().map(|name| name.to_string()),
            source_url: None,
        })
    }

    /// Records the listing page the descriptor came from.
    pub fn with_source_url(mut self, source_url: impl Into<String>) -> Self {
        self.source_url = Some(source_url.into());
        self
    }

    /// Name used in logs before metadata is known.
    pub fn label(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.info_hash.to_string())
    }
}

fn extract_btih(magnet: &str) -> Result<InfoHash, SwarmError> {
    let query = magnet
        .split_once('?')
        .map(|(_, query)| query)
        .unwrap_or_default();

    let topic = query
        .split('&')
        .find_map(|param| param.strip_prefix("xt=urn:btih:"))
        .ok_or_else(|| SwarmError::InvalidDescriptor {
            reason: format!("missing btih topic in {magnet}"),
        })?;

    InfoHash::from_hex(&topic.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_magnet_with_name() {
        let descriptor = TransferDescriptor::parse(
            "magnet:?xt=urn:btih:5933a99db70a430b50bfb5b5f5b56bc7f474ccd8&dn=Big%20Buck%20Bunny",
        )
        .unwrap();

        assert_eq!(
            descriptor.info_hash.to_string(),
            "5933a99db70a430b50bfb5b5f5b56bc7f474ccd8"
        );
        assert!(descriptor.display_name.is_some());
        assert_eq!(descriptor.source_url, None);
    }

    #[test]
    fn test_parse_uppercase_hash() {
        let descriptor =
            TransferDescriptor::parse("magnet:?xt=urn:btih:5933A99DB70A430B50BFB5B5F5B56BC7F474CCD8")
                .unwrap();
        assert_eq!(descriptor.label(), "5933a99db70a430b50bfb5b5f5b56bc7f474ccd8");
    }

    #[test]
    fn test_source_url_is_kept() {
        let descriptor =
            TransferDescriptor::parse("magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567")
                .unwrap()
                .with_source_url("https://listing.example/torrent/1");
        assert_eq!(
            descriptor.source_url.as_deref(),
            Some("https://listing.example/torrent/1")
        );
    }

    #[test]
    fn test_rejects_missing_topic() {
        let result = TransferDescriptor::parse("magnet:?dn=nothing");
        assert!(matches!(result, Err(SwarmError::InvalidDescriptor { .. })));
    }
}
