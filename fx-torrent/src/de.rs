use serde::{de, Deserialize};
use url::Url;

// Deserialiser functions for metainfo.

// Trackers with urls we can't parse are dropped rather than failing the whole metainfo.
pub fn opt_url_deserialize<'de, D>(deserializer: D) -> Result<Option<Url>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|s| match Url::parse(&s) {
        Ok(url) => Some(url),
        Err(e) => {
            tracing::warn!("ignoring invalid announce url {}: {}", s, e);
            None
        }
    }))
}

pub fn announce_list_deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<Vec<Url>>>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let raw = Option::<Vec<Vec<String>>>::deserialize(deserializer)?.unwrap_or_default();
    let mut announce_list = Vec::new();

    for tier in raw {
        let urls: Vec<Url> = tier
            .iter()
            .filter_map(|url| Url::parse(url).ok())
            .collect();
        if !urls.is_empty() {
            announce_list.push(urls);
        }
    }

    if announce_list.is_empty() { Ok(None) } else { Ok(Some(announce_list)) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_derive::Deserialize;

    #[derive(Deserialize)]
    struct Announce {
        #[serde(default, deserialize_with = "opt_url_deserialize")]
        announce: Option<Url>,
        #[serde(default, rename = "announce-list", deserialize_with = "announce_list_deserialize")]
        announce_list: Option<Vec<Vec<Url>>>,
    }

    #[test]
    fn test_invalid_urls_are_skipped() {
        let raw = b"d8:announce9:not a url13:announce-listll21:http://a.org/announce3:bad0:el0:eee";
        let parsed: Announce = serde_bencode::from_bytes(raw).unwrap();
        assert!(parsed.announce.is_none());
        let list = parsed.announce_list.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0][0].as_str(), "http://a.org/announce");
    }
}
