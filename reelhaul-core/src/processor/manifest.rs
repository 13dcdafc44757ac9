use regex::Regex;

/// Top-level shape of a fetched manifest document.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Manifest {
    HlsMaster(Vec<HlsVariant>),
    HlsMedia(HlsPlaylist),
    Dash(Vec<String>),
}

impl Manifest {
    pub(crate) fn parse(contents: &str) -> Result<Self, String> {
        let trimmed = contents.trim_start_matches('\u{feff}').trim_start();
        if trimmed.starts_with("#EXTM3U") {
            if trimmed.contains("#EXT-X-STREAM-INF") {
                return parse_master(trimmed).map(Manifest::HlsMaster);
            }
            return HlsPlaylist::parse(trimmed).map(Manifest::HlsMedia);
        }
        if trimmed.contains("<MPD") {
            return parse_dash(trimmed).map(Manifest::Dash);
        }
        Err("unrecognised manifest format".into())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HlsVariant {
    pub bandwidth: u64,
    pub uri: String,
}

/// Picks the variant advertising the highest bandwidth; ties keep the first.
pub(crate) fn best_variant(variants: &[HlsVariant]) -> Option<&HlsVariant> {
    variants.iter().fold(None, |best: Option<&HlsVariant>, candidate| match best {
        Some(current) if current.bandwidth >= candidate.bandwidth => Some(current),
        _ => Some(candidate),
    })
}

fn parse_master(contents: &str) -> Result<Vec<HlsVariant>, String> {
    let mut variants = Vec::new();
    let mut pending_bandwidth: Option<u64> = None;
    for line in contents.lines().map(str::trim) {
        if let Some(attributes) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            let bandwidth = attribute(attributes, "BANDWIDTH")
                .and_then(|value| value.parse().ok())
                .unwrap_or(0);
            pending_bandwidth = Some(bandwidth);
        } else if line.starts_with('#') || line.is_empty() {
            continue;
        } else if let Some(bandwidth) = pending_bandwidth.take() {
            variants.push(HlsVariant {
                bandwidth,
                uri: line.to_string(),
            });
        }
    }
    if variants.is_empty() {
        return Err("master playlist lists no variants".into());
    }
    Ok(variants)
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HlsPlaylist {
    pub init_segment: Option<String>,
    pub segments: Vec<HlsSegment>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HlsSegment {
    pub duration: f64,
    pub uri: String,
}

impl HlsPlaylist {
    pub(crate) fn parse(contents: &str) -> Result<Self, String> {
        if !contents.trim_start().starts_with("#EXTM3U") {
            return Err("missing #EXTM3U header".into());
        }
        let mut init_segment = None;
        let mut segments = Vec::new();
        let mut pending_duration: Option<f64> = None;
        for line in contents.lines().map(str::trim) {
            if let Some(attributes) = line.strip_prefix("#EXT-X-KEY:") {
                let method = attribute(attributes, "METHOD").unwrap_or_default();
                if !method.eq_ignore_ascii_case("NONE") {
                    return Err(format!("encrypted playlists are not supported (METHOD={method})"));
                }
            } else if let Some(attributes) = line.strip_prefix("#EXT-X-MAP:") {
                init_segment = attribute(attributes, "URI");
            } else if let Some(value) = line.strip_prefix("#EXTINF:") {
                let duration = value
                    .split(',')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .parse()
                    .map_err(|_| "invalid EXTINF duration")?;
                pending_duration = Some(duration);
            } else if line.starts_with('#') || line.is_empty() {
                continue;
            } else if let Some(duration) = pending_duration.take() {
                segments.push(HlsSegment {
                    duration,
                    uri: line.to_string(),
                });
            }
        }
        if segments.is_empty() {
            return Err("playlist missing segments".into());
        }
        Ok(Self {
            init_segment,
            segments,
        })
    }

    pub(crate) fn total_duration(&self) -> f64 {
        self.segments.iter().map(|segment| segment.duration).sum()
    }
}

/// Media URIs of every `<SegmentURL>` element, in document order. Attribute
/// order inside the element does not matter.
fn parse_dash(contents: &str) -> Result<Vec<String>, String> {
    let element = Regex::new(r"<SegmentURL\b([^>]*?)/?>").map_err(|err| err.to_string())?;
    let media = Regex::new(r#"\bmedia\s*=\s*"([^"]*)""#).map_err(|err| err.to_string())?;
    let mut uris = Vec::new();
    for (position, tag) in element.captures_iter(contents).enumerate() {
        let attributes = tag.get(1).map(|m| m.as_str()).unwrap_or_default();
        let uri = media
            .captures(attributes)
            .and_then(|found| found.get(1))
            .map(|m| m.as_str().trim().replace("&amp;", "&"))
            .filter(|uri| !uri.is_empty())
            .ok_or_else(|| format!("SegmentURL #{} has no media attribute", position + 1))?;
        uris.push(uri);
    }
    if uris.is_empty() {
        return Err("no SegmentURL entries found".into());
    }
    Ok(uris)
}

/// Reads `NAME=value` or `NAME="value"` out of an attribute list.
fn attribute(attributes: &str, name: &str) -> Option<String> {
    let mut rest = attributes;
    while !rest.is_empty() {
        let (key, after_key) = rest.split_once('=')?;
        let (value, remainder) = if let Some(quoted) = after_key.strip_prefix('"') {
            let end = quoted.find('"')?;
            let after = quoted[end + 1..].trim_start_matches(',');
            (&quoted[..end], after)
        } else {
            match after_key.split_once(',') {
                Some((value, after)) => (value, after),
                None => (after_key, ""),
            }
        };
        if key.trim().eq_ignore_ascii_case(name) {
            return Some(value.trim().to_string());
        }
        rest = remainder;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_playlist_keeps_segment_order() {
        let playlist = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n\
            #EXT-X-MEDIA-SEQUENCE:7\n#EXTINF:6.0,\nseg-b.ts\n#EXTINF:5.5,title\nseg-a.ts\n\
            #EXT-X-ENDLIST\n";
        match Manifest::parse(playlist).unwrap() {
            Manifest::HlsMedia(parsed) => {
                let uris: Vec<_> = parsed.segments.iter().map(|s| s.uri.as_str()).collect();
                assert_eq!(uris, vec!["seg-b.ts", "seg-a.ts"]);
                assert!((parsed.total_duration() - 11.5).abs() < f64::EPSILON);
            }
            other => panic!("unexpected manifest {other:?}"),
        }
    }

    #[test]
    fn master_playlist_prefers_highest_bandwidth() {
        let playlist = "#EXTM3U\n\
            #EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360\nlow/index.m3u8\n\
            #EXT-X-STREAM-INF:CODECS=\"avc1.4d401f,mp4a.40.2\",BANDWIDTH=2400000\nhigh/index.m3u8\n\
            #EXT-X-STREAM-INF:BANDWIDTH=1200000\nmid/index.m3u8\n";
        match Manifest::parse(playlist).unwrap() {
            Manifest::HlsMaster(variants) => {
                assert_eq!(variants.len(), 3);
                assert_eq!(best_variant(&variants).unwrap().uri, "high/index.m3u8");
            }
            other => panic!("unexpected manifest {other:?}"),
        }
    }

    #[test]
    fn encrypted_playlist_is_rejected() {
        let playlist = "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n#EXTINF:4,\na.ts\n";
        let err = Manifest::parse(playlist).unwrap_err();
        assert!(err.contains("AES-128"));
        let clear = "#EXTM3U\n#EXT-X-KEY:METHOD=NONE\n#EXTINF:4,\na.ts\n";
        assert!(Manifest::parse(clear).is_ok());
    }

    #[test]
    fn init_map_is_captured() {
        let playlist = "#EXTM3U\n#EXT-X-MAP:URI=\"init.mp4\"\n#EXTINF:4,\n1.m4s\n";
        match Manifest::parse(playlist).unwrap() {
            Manifest::HlsMedia(parsed) => {
                assert_eq!(parsed.init_segment.as_deref(), Some("init.mp4"))
            }
            other => panic!("unexpected manifest {other:?}"),
        }
    }

    #[test]
    fn dash_segments_are_extracted() {
        let mpd = r#"<?xml version="1.0"?><MPD><Period><AdaptationSet><Representation>
            <SegmentList><SegmentURL mediaRange="0-99" media="chunk1.m4s"/>
            <SegmentURL media="chunk2.m4s?sig=a&amp;exp=1"></SegmentURL></SegmentList>
            </Representation></AdaptationSet></Period></MPD>"#;
        match Manifest::parse(mpd).unwrap() {
            Manifest::Dash(uris) => {
                assert_eq!(uris, vec!["chunk1.m4s", "chunk2.m4s?sig=a&exp=1"]);
            }
            other => panic!("unexpected manifest {other:?}"),
        }
    }

    #[test]
    fn dash_segment_without_media_is_rejected() {
        let mpd = r#"<MPD><SegmentList><SegmentURL media="a.m4s"/><SegmentURL mediaRange="0-9"/></SegmentList></MPD>"#;
        let err = Manifest::parse(mpd).unwrap_err();
        assert!(err.contains("#2"));
    }

    #[test]
    fn unknown_document_is_rejected() {
        assert!(Manifest::parse("<html>not a manifest</html>").is_err());
    }
}
