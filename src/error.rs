// OTA error taxonomy shared by the engine, the REST layer and ota-tool

use thiserror::Error;

use crate::flash::FlashError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtaError {
    #[error("image of {declared} bytes does not fit target region of {capacity} bytes")]
    SizeExceedsPartition { declared: u32, capacity: u32 },

    #[error("invalid image header: {0}")]
    HeaderInvalid(&'static str),

    #[error("unsupported image type: {0}")]
    UnsupportedImageType(&'static str),

    #[error("flash erase failed at 0x{address:08x}: {source}")]
    FlashEraseFailure { address: u32, source: FlashError },

    #[error("flash write failed at 0x{address:08x}: {source}")]
    FlashWriteFailure { address: u32, source: FlashError },

    #[error("flash read failed at 0x{address:08x}: {source}")]
    FlashReadFailure { address: u32, source: FlashError },

    #[error("transport read failed after {received} of {expected} bytes")]
    TransportReadError { received: u32, expected: u32 },

    #[error("stream ended after {received} of {expected} bytes")]
    IncompleteData { received: u32, expected: u32 },

    #[error("checksum mismatch: computed {computed}, expected {expected}")]
    ChecksumMismatch { computed: String, expected: String },

    #[error("writing the commit signature failed: {0}")]
    SignatureWriteFailure(FlashError),

    #[error("an OTA session is already active")]
    SessionAlreadyActive,

    #[error("no OTA session with id {0}")]
    SessionNotFound(u32),

    #[error("operation not valid in state {0}")]
    InvalidState(&'static str),

    #[error("update aborted: {0}")]
    Aborted(&'static str),

    #[error("target region overlaps the running firmware")]
    RegionOverlapsActive,

    #[error("partition layout invalid: {0}")]
    LayoutInvalid(&'static str),

    #[error("boot configuration update failed: {0}")]
    BootConfigFailure(String),
}

impl OtaError {
    /// Stable identifier reported in REST error bodies
    pub fn code(&self) -> &'static str {
        match self {
            OtaError::SizeExceedsPartition { .. } => "SIZE_EXCEEDS_PARTITION",
            OtaError::HeaderInvalid(_) => "HEADER_INVALID",
            OtaError::UnsupportedImageType(_) => "UNSUPPORTED_IMAGE_TYPE",
            OtaError::FlashEraseFailure { .. } => "FLASH_ERASE_FAILURE",
            OtaError::FlashWriteFailure { .. } => "FLASH_WRITE_FAILURE",
            OtaError::FlashReadFailure { .. } => "FLASH_READ_FAILURE",
            OtaError::TransportReadError { .. } => "TRANSPORT_READ_ERROR",
            OtaError::IncompleteData { .. } => "INCOMPLETE_DATA",
            OtaError::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            OtaError::SignatureWriteFailure(_) => "SIGNATURE_WRITE_FAILURE",
            OtaError::SessionAlreadyActive => "SESSION_ALREADY_ACTIVE",
            OtaError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            OtaError::InvalidState(_) => "INVALID_STATE",
            OtaError::Aborted(_) => "ABORTED",
            OtaError::RegionOverlapsActive => "REGION_OVERLAPS_ACTIVE",
            OtaError::LayoutInvalid(_) => "LAYOUT_INVALID",
            OtaError::BootConfigFailure(_) => "BOOT_CONFIG_FAILURE",
        }
    }

    /// Numeric code in the negative range the device REST API has always used
    pub fn numeric(&self) -> i32 {
        match self {
            OtaError::SizeExceedsPartition { .. } => -20,
            OtaError::HeaderInvalid(_) => -19,
            OtaError::UnsupportedImageType(_) => -21,
            OtaError::FlashEraseFailure { .. } => -30,
            OtaError::FlashWriteFailure { .. } => -31,
            OtaError::FlashReadFailure { .. } => -32,
            OtaError::TransportReadError { .. } => -17,
            OtaError::IncompleteData { .. } => -16,
            OtaError::ChecksumMismatch { .. } => -40,
            OtaError::SignatureWriteFailure(_) => -41,
            OtaError::SessionAlreadyActive => -50,
            OtaError::SessionNotFound(_) => -51,
            OtaError::InvalidState(_) => -52,
            OtaError::Aborted(_) => -53,
            OtaError::RegionOverlapsActive => -22,
            OtaError::LayoutInvalid(_) => -23,
            OtaError::BootConfigFailure(_) => -42,
        }
    }

    /// HTTP status the management plane answers with
    pub fn http_status(&self) -> u16 {
        match self {
            OtaError::SizeExceedsPartition { .. } => 413,
            OtaError::HeaderInvalid(_)
            | OtaError::UnsupportedImageType(_)
            | OtaError::IncompleteData { .. }
            | OtaError::ChecksumMismatch { .. }
            | OtaError::RegionOverlapsActive => 400,
            OtaError::TransportReadError { .. } => 408,
            OtaError::SessionAlreadyActive | OtaError::InvalidState(_) => 409,
            OtaError::SessionNotFound(_) => 404,
            OtaError::Aborted(_) => 410,
            _ => 500,
        }
    }

    /// Failures that leave nothing to clean up on the device
    pub fn is_side_effect_free(&self) -> bool {
        matches!(
            self,
            OtaError::SessionAlreadyActive
                | OtaError::SessionNotFound(_)
                | OtaError::SizeExceedsPartition { .. }
                | OtaError::RegionOverlapsActive
                | OtaError::LayoutInvalid(_)
        )
    }
}

pub type OtaResult<T> = Result<T, OtaError>;
