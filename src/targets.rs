//! Board profiles: flash geometry, partition layout and the image format
//! each bootloader expects. Addresses follow the vendors' default
//! partition tables.

use crate::flash::{FlashGeometry, FlashRegion};
use crate::ota::image::ImageFormat;
use crate::partition::{Bank, PartitionLayout};

const SECTOR: u32 = 0x1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetProfile {
    pub name: &'static str,
    pub geometry: FlashGeometry,
    pub layout: PartitionLayout,
    pub formats: &'static [ImageFormat],
}

const fn region(start: u32, length: u32) -> FlashRegion {
    FlashRegion::from_parts(start, length, SECTOR)
}

const fn dual(a: (u32, u32), b: (u32, u32)) -> PartitionLayout {
    PartitionLayout::DualBank {
        banks: [region(a.0, a.1), region(b.0, b.1)],
        active: Bank::A,
    }
}

pub const PROFILES: &[TargetProfile] = &[
    TargetProfile {
        name: "esp32-4mb",
        geometry: FlashGeometry { size: 0x40_0000, erase_block: SECTOR, max_write: 4096 },
        // ota_0 / ota_1 of the two-OTA partition table
        layout: dual((0x1_0000, 0x1E_0000), (0x1F_0000, 0x1E_0000)),
        formats: &[ImageFormat::EspApp],
    },
    TargetProfile {
        name: "rtl87x0c-2mb",
        geometry: FlashGeometry { size: 0x20_0000, erase_block: SECTOR, max_write: 256 },
        layout: dual((0x1_0000, 0xE_0000), (0xF_0000, 0xE_0000)),
        formats: &[ImageFormat::Checksummed],
    },
    TargetProfile {
        name: "bl602-2mb",
        geometry: FlashGeometry { size: 0x20_0000, erase_block: SECTOR, max_write: 256 },
        layout: dual((0x1_0000, 0xC_8000), (0xD_8000, 0xC_8000)),
        formats: &[ImageFormat::SignedContainer],
    },
    TargetProfile {
        name: "ln882h-2mb",
        geometry: FlashGeometry { size: 0x20_0000, erase_block: SECTOR, max_write: 256 },
        // the bootloader copies the OTA region over the app on next boot
        layout: PartitionLayout::SingleRegion {
            ota: region(0x13_3000, 0xA_A000),
            running: region(0x7000, 0x12_C000),
        },
        formats: &[ImageFormat::Checksummed],
    },
    TargetProfile {
        name: "bk7231-2mb",
        geometry: FlashGeometry { size: 0x20_0000, erase_block: SECTOR, max_write: 256 },
        layout: PartitionLayout::SingleRegion {
            ota: region(0x13_2000, 0x9_6000),
            running: region(0x1_1000, 0x12_1000),
        },
        formats: &[ImageFormat::Checksummed],
    },
];

pub fn find(name: &str) -> Option<&'static TargetProfile> {
    PROFILES.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

/// Profile selected at build time, falling back to esp32-4mb
pub fn built_in() -> &'static TargetProfile {
    find(crate::version::TARGET_PROFILE).unwrap_or(&PROFILES[0])
}

impl TargetProfile {
    pub fn names() -> impl Iterator<Item = &'static str> {
        PROFILES.iter().map(|p| p.name)
    }
}
