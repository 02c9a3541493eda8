use anyhow::{Result, anyhow};

/// Strip quotes and lowercase; all ETag comparison goes through this.
pub fn normalize_etag(etag: &str) -> String {
    etag.trim_matches('"').to_ascii_lowercase()
}

/// Multipart composite ETags carry a `-<parts>` suffix.
pub fn is_multipart_etag(etag: &str) -> bool {
    normalize_etag(etag).contains('-')
}

/// Swift SLO ETag: hex md5 of the concatenated segment ETag strings.
pub fn slo_etag<'a>(segment_etags: impl IntoIterator<Item = &'a str>) -> String {
    let mut concatenated = String::new();
    for etag in segment_etags {
        concatenated.push_str(&normalize_etag(etag));
    }
    hex::encode(md5::compute(concatenated.as_bytes()).0)
}

/// S3 MPU ETag: `md5(concat(binary-part-etags))-N`.
pub fn mpu_etag<'a>(part_etags: impl IntoIterator<Item = &'a str>) -> Result<String> {
    let mut concatenated: Vec<u8> = Vec::new();
    let mut count = 0usize;
    for etag in part_etags {
        let bytes = hex::decode(normalize_etag(etag))
            .map_err(|_| anyhow!("part etag is not hex: {}", etag))?;
        concatenated.extend_from_slice(&bytes);
        count += 1;
    }
    Ok(format!(
        "{}-{}",
        hex::encode(md5::compute(&concatenated).0),
        count
    ))
}

/// Parts count encoded in a composite ETag, if any.
pub fn multipart_parts_count(etag: &str) -> Option<usize> {
    normalize_etag(etag).split_once('-')?.1.parse().ok()
}
