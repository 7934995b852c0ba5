//! Image formats the engine accepts, header parsing and an image builder.
//!
//! Every format reserves the first [`SIGNATURE_LEN`] bytes that land in
//! flash as its signature zone. The bootloader refuses a slot whose
//! signature zone is blank, so those bytes are written last.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use super::verifier::{DigestKind, VerifierContext};
use crate::error::{OtaError, OtaResult};

pub const SIGNATURE_LEN: usize = 32;
/// Bytes needed to tell the formats apart
pub const PROBE_LEN: usize = 24;

pub const CHECKSUMMED_MAGIC: &[u8; 8] = b"81958711";
pub const CONTAINER_MAGIC: &[u8; 9] = b"BL60X_OTA";
pub const CONTAINER_HEADER_LEN: usize = 512;
pub const ESP_IMAGE_MAGIC: u8 = 0xE9;
const ESP_HASH_APPENDED_OFFSET: usize = 23;
const ESP_CHIP_ID_OFFSET: usize = 12;
const ESP_APP_DESC_OFFSET: usize = 32;
const ESP_APP_DESC_MAGIC: u32 = 0xABCD_5432;
const ESP_APP_VERSION_OFFSET: usize = 48;
const ESP_HEADER_LEN: usize = 80;

// Container header field offsets
const C_TYPE: usize = 16;
const C_BODY_LEN: usize = 20;
const C_HW: usize = 32;
const C_SW: usize = 48;
const C_SHA: usize = 64;
const C_UNPACKED_LEN: usize = 96;
const TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageFormat {
    /// Raw image with magic + additive checksum trailer
    Checksummed,
    /// 512-byte signed header followed by the body
    SignedContainer,
    /// ESP-IDF application image with appended SHA-256
    EspApp,
}

impl ImageFormat {
    pub fn detect(lead: &[u8]) -> OtaResult<ImageFormat> {
        if lead.starts_with(CHECKSUMMED_MAGIC) {
            Ok(ImageFormat::Checksummed)
        } else if lead.starts_with(CONTAINER_MAGIC) {
            Ok(ImageFormat::SignedContainer)
        } else if lead.first() == Some(&ESP_IMAGE_MAGIC) {
            Ok(ImageFormat::EspApp)
        } else {
            Err(OtaError::HeaderInvalid("unknown image magic"))
        }
    }

    /// Bytes that must be buffered before the header can be parsed
    pub fn header_len(self) -> usize {
        match self {
            ImageFormat::Checksummed => SIGNATURE_LEN,
            ImageFormat::SignedContainer => CONTAINER_HEADER_LEN,
            ImageFormat::EspApp => ESP_HEADER_LEN,
        }
    }

    /// Leading stream bytes that are consumed but never written to flash
    pub fn stripped_len(self) -> usize {
        match self {
            ImageFormat::SignedContainer => CONTAINER_HEADER_LEN,
            _ => 0,
        }
    }

    /// Trailing stream bytes holding the expected digest
    pub fn trailer_len(self) -> usize {
        match self {
            ImageFormat::Checksummed => DigestKind::Additive.len(),
            ImageFormat::SignedContainer => 0,
            ImageFormat::EspApp => DigestKind::Sha256.len(),
        }
    }

    pub fn digest_kind(self) -> DigestKind {
        match self {
            ImageFormat::Checksummed => DigestKind::Additive,
            _ => DigestKind::Sha256,
        }
    }

    /// Smallest valid image, header and trailer included
    pub fn min_len(self) -> usize {
        let kept = self.header_len() - self.stripped_len();
        self.stripped_len() + kept.max(SIGNATURE_LEN) + self.trailer_len()
    }

    pub fn name(self) -> &'static str {
        match self {
            ImageFormat::Checksummed => "checksummed",
            ImageFormat::SignedContainer => "signed-container",
            ImageFormat::EspApp => "esp-app",
        }
    }
}

/// Where the expected digest comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedDigest {
    /// Last `trailer_len` bytes of the stream
    Trailer,
    Embedded([u8; 32]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub format: ImageFormat,
    /// Stream bytes after the stripped header, trailer included
    pub body_len: u32,
    pub hw_version: Option<String>,
    pub sw_version: Option<String>,
    pub expected: ExpectedDigest,
}

fn tag(bytes: &[u8]) -> Option<String> {
    let end = bytes.iter().position(|b| *b == 0 || *b == 0xFF).unwrap_or(bytes.len());
    let text = &bytes[..end];
    if text.is_empty() || !text.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        return None;
    }
    Some(String::from_utf8_lossy(text).trim().to_string())
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

impl ImageHeader {
    /// Parse the buffered header of a stream of `declared` bytes.
    /// `bytes` must hold at least `format.header_len()` bytes.
    pub fn parse(format: ImageFormat, bytes: &[u8], declared: u32) -> OtaResult<ImageHeader> {
        if bytes.len() < format.header_len() || (declared as usize) < format.min_len() {
            return Err(OtaError::HeaderInvalid("image too short"));
        }
        match format {
            ImageFormat::Checksummed => Ok(ImageHeader {
                format,
                body_len: declared,
                hw_version: None,
                sw_version: tag(&bytes[CHECKSUMMED_MAGIC.len()..SIGNATURE_LEN]),
                expected: ExpectedDigest::Trailer,
            }),
            ImageFormat::SignedContainer => Self::parse_container(bytes, declared),
            ImageFormat::EspApp => {
                if bytes[ESP_HASH_APPENDED_OFFSET] != 1 {
                    return Err(OtaError::UnsupportedImageType("esp image without appended sha256"));
                }
                let chip = u16::from_le_bytes([bytes[ESP_CHIP_ID_OFFSET], bytes[ESP_CHIP_ID_OFFSET + 1]]);
                let sw_version = if le_u32(bytes, ESP_APP_DESC_OFFSET) == ESP_APP_DESC_MAGIC {
                    tag(&bytes[ESP_APP_VERSION_OFFSET..ESP_HEADER_LEN])
                } else {
                    None
                };
                Ok(ImageHeader {
                    format,
                    body_len: declared,
                    hw_version: Some(format!("chip-{}", chip)),
                    sw_version,
                    expected: ExpectedDigest::Trailer,
                })
            }
        }
    }

    fn parse_container(bytes: &[u8], declared: u32) -> OtaResult<ImageHeader> {
        let kind = tag(&bytes[C_TYPE..C_BODY_LEN]);
        match kind.as_deref() {
            Some("RAW") => {}
            Some("XZ") => return Err(OtaError::UnsupportedImageType("xz compressed container")),
            _ => return Err(OtaError::HeaderInvalid("unknown container type")),
        }
        let body_len = le_u32(bytes, C_BODY_LEN);
        if u64::from(declared) != CONTAINER_HEADER_LEN as u64 + u64::from(body_len) {
            return Err(OtaError::HeaderInvalid("container length does not match declared length"));
        }
        let unpacked = le_u32(bytes, C_UNPACKED_LEN);
        if unpacked != u32::MAX && unpacked != body_len {
            return Err(OtaError::HeaderInvalid("unpacked length differs from raw body"));
        }
        let mut sha = [0u8; 32];
        sha.copy_from_slice(&bytes[C_SHA..C_SHA + 32]);
        Ok(ImageHeader {
            format: ImageFormat::SignedContainer,
            body_len,
            hw_version: tag(&bytes[C_HW..C_HW + TAG_LEN]),
            sw_version: tag(&bytes[C_SW..C_SW + TAG_LEN]),
            expected: ExpectedDigest::Embedded(sha),
        })
    }

    /// Bytes of this image that end up in flash
    pub fn flash_len(&self, declared: u32) -> u32 {
        declared - self.format.stripped_len() as u32
    }

    /// Reject images built for other hardware
    pub fn check_hardware(&self, wanted: Option<&str>) -> OtaResult<()> {
        match (wanted, self.hw_version.as_deref()) {
            (Some(wanted), Some(found)) if wanted != found => {
                log::warn!("Image built for '{}', this device is '{}'", found, wanted);
                Err(OtaError::HeaderInvalid("hardware tag mismatch"))
            }
            _ => Ok(()),
        }
    }
}

/// Builds valid images of every format from a raw payload
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    format: ImageFormat,
    hw_version: Option<String>,
    sw_version: Option<String>,
    chip_id: u16,
}

fn put_tag(out: &mut [u8], text: Option<&str>, fill: u8) {
    out.fill(fill);
    if let Some(text) = text {
        let len = text.len().min(out.len());
        out[..len].copy_from_slice(&text.as_bytes()[..len]);
    }
}

impl ImageBuilder {
    pub fn new(format: ImageFormat) -> Self {
        // ESP32-S3
        Self { format, hw_version: None, sw_version: None, chip_id: 9 }
    }

    /// Hardware tag; for `EspApp` images use the `chip-<id>` form
    pub fn hardware(mut self, tag: &str) -> Self {
        if let Some(id) = tag.strip_prefix("chip-").and_then(|id| id.parse().ok()) {
            self.chip_id = id;
        }
        self.hw_version = Some(tag.to_string());
        self
    }

    pub fn version(mut self, tag: &str) -> Self {
        self.sw_version = Some(tag.to_string());
        self
    }

    /// Bytes the format adds around the payload
    pub fn overhead(&self) -> usize {
        match self.format {
            ImageFormat::Checksummed => SIGNATURE_LEN + 4,
            ImageFormat::SignedContainer => CONTAINER_HEADER_LEN,
            ImageFormat::EspApp => ESP_HEADER_LEN + 32,
        }
    }

    pub fn build(&self, payload: &[u8]) -> Vec<u8> {
        match self.format {
            ImageFormat::Checksummed => self.build_checksummed(payload),
            ImageFormat::SignedContainer => self.build_container(payload),
            ImageFormat::EspApp => self.build_esp(payload),
        }
    }

    /// An image of exactly `total` bytes with a deterministic filler payload
    pub fn build_with_len(&self, total: usize) -> Option<Vec<u8>> {
        if total < self.format.min_len() || total < self.overhead() {
            return None;
        }
        let payload: Vec<u8> = (0..total - self.overhead())
            .map(|i| (i.wrapping_mul(31) ^ (i >> 8)) as u8)
            .collect();
        Some(self.build(&payload))
    }

    fn build_checksummed(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + self.overhead());
        out.extend_from_slice(CHECKSUMMED_MAGIC);
        let mut version = [0u8; SIGNATURE_LEN - 8];
        put_tag(&mut version, self.sw_version.as_deref(), 0xFF);
        out.extend_from_slice(&version);
        out.extend_from_slice(payload);
        let mut sum = VerifierContext::new(DigestKind::Additive);
        sum.update(&out);
        out.extend_from_slice(&sum.finalize().to_bytes());
        out
    }

    fn build_container(&self, payload: &[u8]) -> Vec<u8> {
        let mut header = vec![0u8; CONTAINER_HEADER_LEN];
        header[..CONTAINER_MAGIC.len()].copy_from_slice(CONTAINER_MAGIC);
        header[C_TYPE..C_TYPE + 3].copy_from_slice(b"RAW");
        header[C_BODY_LEN..C_BODY_LEN + 4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        put_tag(&mut header[C_HW..C_HW + TAG_LEN], self.hw_version.as_deref(), 0);
        put_tag(&mut header[C_SW..C_SW + TAG_LEN], self.sw_version.as_deref(), 0);
        header[C_SHA..C_SHA + 32].copy_from_slice(&Sha256::digest(payload));
        header[C_UNPACKED_LEN..C_UNPACKED_LEN + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        header.extend_from_slice(payload);
        header
    }

    fn build_esp(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; ESP_HEADER_LEN];
        out[0] = ESP_IMAGE_MAGIC;
        out[1] = 1; // segment count
        out[2] = 2; // DIO
        out[ESP_CHIP_ID_OFFSET..ESP_CHIP_ID_OFFSET + 2].copy_from_slice(&self.chip_id.to_le_bytes());
        out[ESP_HASH_APPENDED_OFFSET] = 1;
        // single DROM segment carrying the app descriptor
        out[24..28].copy_from_slice(&0x3C00_0020u32.to_le_bytes());
        let segment_len = (ESP_HEADER_LEN - ESP_APP_DESC_OFFSET + payload.len()) as u32;
        out[28..32].copy_from_slice(&segment_len.to_le_bytes());
        out[ESP_APP_DESC_OFFSET..ESP_APP_DESC_OFFSET + 4].copy_from_slice(&ESP_APP_DESC_MAGIC.to_le_bytes());
        put_tag(&mut out[ESP_APP_VERSION_OFFSET..ESP_HEADER_LEN], self.sw_version.as_deref(), 0);
        out.extend_from_slice(payload);
        let hash = Sha256::digest(&out);
        out.extend_from_slice(&hash);
        out
    }
}

/// Offline check of a complete image, as the device would verify it
pub fn verify_image(image: &[u8]) -> OtaResult<ImageHeader> {
    let declared = u32::try_from(image.len()).map_err(|_| OtaError::HeaderInvalid("image too large"))?;
    let format = ImageFormat::detect(&image[..image.len().min(PROBE_LEN)])?;
    let header_end = format.header_len().min(image.len());
    let header = ImageHeader::parse(format, &image[..header_end], declared)?;

    let trailer_at = image.len() - format.trailer_len();
    let mut verifier = VerifierContext::new(format.digest_kind());
    verifier.update(&image[format.stripped_len()..trailer_at]);
    let digest = verifier.finalize();
    let expected = match &header.expected {
        ExpectedDigest::Trailer => &image[trailer_at..],
        ExpectedDigest::Embedded(hash) => hash.as_slice(),
    };
    if !digest.matches(expected) {
        return Err(OtaError::ChecksumMismatch {
            computed: digest.to_hex(),
            expected: super::verifier::expected_hex(format.digest_kind(), expected),
        });
    }
    Ok(header)
}
