// Centralized version information

// Engine version reported by /api/ota/status and the logger banner
pub const ENGINE_VERSION: &str = "v0.3-ota";

// Cargo package version from Cargo.toml
pub const CARGO_VERSION: &str = env!("CARGO_PKG_VERSION");

// Target profile the firmware was built for (build.rs, OTAFLASH_TARGET)
pub const TARGET_PROFILE: &str = env!("OTAFLASH_TARGET");

pub fn full_version() -> String {
    format!("{} ({}, {})", ENGINE_VERSION, CARGO_VERSION, TARGET_PROFILE)
}
