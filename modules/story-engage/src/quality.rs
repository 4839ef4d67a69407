// Cheap pre-engagement check on downloaded media: rejects empty, tiny,
// undersized, and near-blank placeholder assets.

use serde::Serialize;

/// Below this the payload is never a real story frame.
pub const MIN_BYTES: usize = 1536;
/// Either declared side below this is rejected.
pub const MIN_DIMENSION: u32 = 120;
/// Entropy is only checked for images smaller than this.
pub const ENTROPY_CHECK_MAX_BYTES: usize = 45 * 1024;
/// Bits per byte; placeholders and flat frames fall below.
pub const MIN_ENTROPY_BITS: f64 = 4.2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityVerdict {
    pub skip: bool,
    pub reason: Option<&'static str>,
    pub entropy: Option<f64>,
}

impl QualityVerdict {
    fn pass(entropy: Option<f64>) -> Self {
        Self {
            skip: false,
            reason: None,
            entropy,
        }
    }

    fn reject(reason: &'static str, entropy: Option<f64>) -> Self {
        Self {
            skip: true,
            reason: Some(reason),
            entropy,
        }
    }
}

pub fn evaluate(
    bytes: &[u8],
    content_type: Option<&str>,
    declared_width: Option<u32>,
    declared_height: Option<u32>,
) -> QualityVerdict {
    if bytes.is_empty() {
        return QualityVerdict::reject("empty_media", None);
    }
    if bytes.len() < MIN_BYTES {
        return QualityVerdict::reject("media_too_small", None);
    }
    if let (Some(w), Some(h)) = (declared_width, declared_height) {
        if w < MIN_DIMENSION || h < MIN_DIMENSION {
            return QualityVerdict::reject("undersized_dimensions", None);
        }
    }
    if bytes.len() < ENTROPY_CHECK_MAX_BYTES && is_image(content_type, bytes) {
        let entropy = byte_entropy(bytes);
        if entropy < MIN_ENTROPY_BITS {
            return QualityVerdict::reject("low_entropy_small_image", Some(entropy));
        }
        return QualityVerdict::pass(Some(entropy));
    }
    QualityVerdict::pass(None)
}

/// Shannon entropy of the byte-value histogram, in bits (0.0 ..= 8.0).
pub fn byte_entropy(bytes: &[u8]) -> f64 {
    if bytes.is_empty() {
        return 0.0;
    }
    let mut histogram = [0u64; 256];
    for b in bytes {
        histogram[*b as usize] += 1;
    }
    let total = bytes.len() as f64;
    let entropy = histogram
        .iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / total;
            -p * p.log2()
        })
        .sum::<f64>();
    // A single symbol yields -0.0; report it as 0.0.
    entropy.max(0.0)
}

/// Content type first; magic bytes when the header is missing or generic.
fn is_image(content_type: Option<&str>, bytes: &[u8]) -> bool {
    match content_type.map(|ct| ct.trim().to_ascii_lowercase()) {
        Some(ct) if ct.starts_with("image/") => true,
        Some(ct) if ct.starts_with("video/") => false,
        _ => sniff_image(bytes),
    }
}

fn sniff_image(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0xFF, 0xD8, 0xFF])
        || bytes.starts_with(&[0x89, b'P', b'N', b'G'])
        || bytes.starts_with(b"GIF8")
        || (bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP")
}
