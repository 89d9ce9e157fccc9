//! Intake for out-of-band association URLs.
//!
//! A head unit can mint a URL of the form
//! `http(s)://companion/associate?oobData=<url-safe base64>`; the payload is
//! a serialized [`OutOfBandAssociationData`]. The app routes such URLs here
//! and posts the contained token into the association flow's provider.

use anyhow::Context;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use lazy_static::lazy_static;
use regex::Regex;

use carlink_core::link::oob::PostedTokenProvider;
use carlink_core::wire::model::OutOfBandAssociationData;

use crate::AnyResult;

lazy_static! {
    static ref ASSOCIATION_URL: Regex =
        Regex::new(r"^https?://companion/associate\?(?P<query>.+)$").expect("static regex");
}

/// Parse an out-of-band association URL into its payload
pub fn parse_association_url(url: &str) -> AnyResult<OutOfBandAssociationData> {
    let captures = ASSOCIATION_URL
        .captures(url)
        .context("Not an association URL")?;
    let encoded = captures
        .name("query")
        .expect("group is not optional")
        .as_str()
        .split('&')
        .find_map(|pair| pair.strip_prefix("oobData="))
        .context("Association URL has no oobData parameter")?;
    let bytes = URL_SAFE
        .decode(encoded)
        .or_else(|_| URL_SAFE_NO_PAD.decode(encoded))
        .context("oobData is not url-safe base64")?;
    OutOfBandAssociationData::deserialize(&bytes)
        .context("oobData does not decode as association data")
}

/// Parse `url` and post its token into `provider`.
///
/// Fails when the URL is valid but carries no token.
pub fn accept_association_url(url: &str, provider: &PostedTokenProvider) -> AnyResult<()> {
    let data = parse_association_url(url)?;
    let token = data.token.context("Association URL carried no token")?;
    provider.post(token);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use carlink_core::wire::model::OutOfBandAssociationToken;

    fn data() -> OutOfBandAssociationData {
        OutOfBandAssociationData {
            token: Some(OutOfBandAssociationToken {
                encryption_key: vec![0xAB; 16],
                ihu_iv: vec![0x01; 16],
                mobile_iv: vec![0x02; 16],
            }),
            device_identifier: vec![0xEE; 6],
        }
    }

    fn url_for(data: &OutOfBandAssociationData) -> String {
        format!(
            "https://companion/associate?oobData={}",
            URL_SAFE.encode(data.serialize().unwrap())
        )
    }

    #[test]
    fn test_roundtrip() {
        let parsed = parse_association_url(&url_for(&data())).unwrap();
        assert_eq!(parsed, data());
    }

    #[test]
    fn test_unpadded_base64_is_accepted() {
        let url = format!(
            "http://companion/associate?oobData={}",
            URL_SAFE_NO_PAD.encode(data().serialize().unwrap())
        );
        assert_eq!(parse_association_url(&url).unwrap(), data());
    }

    #[test]
    fn test_other_parameters_are_ignored() {
        let url = format!(
            "https://companion/associate?source=qr&oobData={}",
            URL_SAFE.encode(data().serialize().unwrap())
        );
        assert_eq!(parse_association_url(&url).unwrap(), data());
    }

    #[test]
    fn test_rejects_foreign_urls() {
        assert!(parse_association_url("https://example.com/?oobData=AAAA").is_err());
        assert!(parse_association_url("companion/associate?oobData=AAAA").is_err());
        assert!(parse_association_url("https://companion/associate").is_err());
        assert!(parse_association_url("https://companion/associate?oobData=!!!").is_err());
    }

    #[tokio::test]
    async fn test_accept_posts_the_token() {
        use carlink_core::link::oob::OutOfBandTokenProvider;

        let provider = PostedTokenProvider::new();
        accept_association_url(&url_for(&data()), &provider).unwrap();
        assert_eq!(provider.request_token().await, data().token);
    }
}
