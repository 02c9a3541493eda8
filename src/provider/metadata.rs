use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::types::Metadata;

/// Case-insensitive key lookup that preserves the stored key's case.
pub fn lookup_case_insensitive<'a>(metadata: &'a Metadata, key: &str) -> Option<&'a str> {
    metadata
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

/// Compare two metadata maps: keys case-insensitive, values byte-exact.
pub fn metadata_equal(a: &Metadata, b: &Metadata) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .all(|(k, v)| lookup_case_insensitive(b, k) == Some(v.as_str()))
}

/// RFC 2047 encoded-word form for a metadata value that S3 would otherwise
/// reject. ASCII values pass through untouched.
pub fn encode_value(value: &str) -> String {
    if value.is_ascii() {
        return value.to_string();
    }
    format!("=?UTF-8?B?{}?=", BASE64.encode(value.as_bytes()))
}

/// Decode an RFC 2047 encoded-word. Values that are not encoded-words come
/// back unchanged. A payload that is not valid UTF-8 falls back on the
/// object's `Content-Type`: textual objects get a lossy UTF-8 read, while
/// binary objects keep the encoded form verbatim so their noise never
/// poisons the metadata map.
pub fn decode_value(value: &str, content_type: Option<&str>) -> String {
    let Some(inner) = value
        .strip_prefix("=?UTF-8?B?")
        .or_else(|| value.strip_prefix("=?utf-8?B?"))
        .and_then(|rest| rest.strip_suffix("?="))
    else {
        return value.to_string();
    };
    let Ok(bytes) = BASE64.decode(inner) else {
        return value.to_string();
    };
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) if is_textual(content_type) => {
            String::from_utf8_lossy(err.as_bytes()).into_owned()
        }
        Err(_) => value.to_string(),
    }
}

/// Whether lossy decoding is safe for this `Content-Type`. With no content
/// type at all the value is assumed textual.
fn is_textual(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return true;
    };
    let lowered = content_type.to_ascii_lowercase();
    let essence = lowered.split(';').next().unwrap_or("").trim();
    essence.starts_with("text/")
        || essence.ends_with("+json")
        || essence.ends_with("+xml")
        || matches!(
            essence,
            "application/json" | "application/xml" | "application/javascript"
        )
        || lowered.contains("charset=")
}

pub fn encode_metadata(metadata: &Metadata) -> Metadata {
    metadata
        .iter()
        .map(|(k, v)| (k.clone(), encode_value(v)))
        .collect()
}

pub fn decode_metadata(metadata: &Metadata, content_type: Option<&str>) -> Metadata {
    metadata
        .iter()
        .map(|(k, v)| (k.clone(), decode_value(v, content_type)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn lookup_ignores_case_but_preserves_value() {
        let m = meta(&[("Color", "blue")]);
        assert_eq!(lookup_case_insensitive(&m, "color"), Some("blue"));
        assert_eq!(lookup_case_insensitive(&m, "COLOR"), Some("blue"));
        assert_eq!(lookup_case_insensitive(&m, "colour"), None);
    }

    #[test]
    fn equality_is_key_case_insensitive() {
        assert!(metadata_equal(
            &meta(&[("Color", "blue")]),
            &meta(&[("color", "blue")])
        ));
        assert!(!metadata_equal(
            &meta(&[("color", "blue")]),
            &meta(&[("color", "Blue")])
        ));
        assert!(!metadata_equal(&meta(&[("a", "1")]), &meta(&[])));
    }

    #[test]
    fn ascii_values_pass_through() {
        assert_eq!(encode_value("plain ascii"), "plain ascii");
        assert_eq!(decode_value("plain ascii", None), "plain ascii");
    }

    #[test]
    fn unicode_value_roundtrip() {
        let original = "über-wichtig 🚀";
        let encoded = encode_value(original);
        assert!(encoded.starts_with("=?UTF-8?B?"));
        assert!(encoded.is_ascii());
        assert_eq!(decode_value(&encoded, None), original);
    }

    #[test]
    fn undecodable_encoded_word_returned_verbatim() {
        assert_eq!(
            decode_value("=?UTF-8?B?!!!not-base64!!!?=", None),
            "=?UTF-8?B?!!!not-base64!!!?="
        );
    }

    #[test]
    fn non_utf8_payload_is_lossy_for_textual_objects() {
        let encoded = format!("=?UTF-8?B?{}?=", BASE64.encode([0x66, 0xff, 0x6f]));
        let decoded = decode_value(&encoded, Some("text/plain; charset=utf-8"));
        assert_eq!(decoded, "f\u{fffd}o");
        // No declared content type defaults to textual handling.
        assert_eq!(decode_value(&encoded, None), "f\u{fffd}o");
    }

    #[test]
    fn non_utf8_payload_stays_verbatim_for_binary_objects() {
        let encoded = format!("=?UTF-8?B?{}?=", BASE64.encode([0x66, 0xff, 0x6f]));
        assert_eq!(
            decode_value(&encoded, Some("application/octet-stream")),
            encoded
        );
        assert_eq!(decode_value(&encoded, Some("image/png")), encoded);
    }

    #[test]
    fn textual_content_type_detection() {
        assert!(is_textual(None));
        assert!(is_textual(Some("text/plain")));
        assert!(is_textual(Some("Text/HTML; charset=ISO-8859-1")));
        assert!(is_textual(Some("application/json")));
        assert!(is_textual(Some("application/ld+json")));
        assert!(is_textual(Some("application/octet-stream; charset=utf-8")));
        assert!(!is_textual(Some("application/octet-stream")));
        assert!(!is_textual(Some("video/mp4")));
    }

    #[test]
    fn metadata_map_roundtrip() {
        let original = meta(&[("titel", "grüße"), ("plain", "ok")]);
        let decoded = decode_metadata(&encode_metadata(&original), Some("text/plain"));
        assert!(metadata_equal(&original, &decoded));
    }
}
