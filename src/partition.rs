//! Partition layouts and the selector that picks where a new image goes.

use serde::{Deserialize, Serialize};

use crate::error::{OtaError, OtaResult};
use crate::flash::{FlashGeometry, FlashRegion};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bank {
    A,
    B,
}

impl Bank {
    pub fn other(self) -> Bank {
        match self {
            Bank::A => Bank::B,
            Bank::B => Bank::A,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Bank::A => 0,
            Bank::B => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionLayout {
    /// One scratch region; the bootloader installs from it
    SingleRegion { ota: FlashRegion, running: FlashRegion },
    /// Two bootable banks, one of them active
    DualBank { banks: [FlashRegion; 2], active: Bank },
}

impl PartitionLayout {
    pub fn running_region(&self) -> FlashRegion {
        match self {
            PartitionLayout::SingleRegion { running, .. } => *running,
            PartitionLayout::DualBank { banks, active } => banks[active.index()],
        }
    }

    pub fn active_bank(&self) -> Option<Bank> {
        match self {
            PartitionLayout::SingleRegion { .. } => None,
            PartitionLayout::DualBank { active, .. } => Some(*active),
        }
    }

    pub fn validate(&self, geometry: &FlashGeometry) -> OtaResult<()> {
        let (first, second) = match self {
            PartitionLayout::SingleRegion { ota, running } => (ota, running),
            PartitionLayout::DualBank { banks, .. } => (&banks[0], &banks[1]),
        };
        for region in [first, second] {
            if !geometry.contains(region) {
                return Err(OtaError::LayoutInvalid("region outside the flash device"));
            }
            if region.erase_block() % geometry.erase_block != 0 {
                return Err(OtaError::LayoutInvalid("region not aligned to device erase block"));
            }
        }
        if first.overlaps(second) {
            return Err(OtaError::LayoutInvalid("regions overlap"));
        }
        Ok(())
    }
}

/// Where the next image is written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Target {
    pub region: FlashRegion,
    /// Bank to activate on commit; `None` for single-region layouts
    pub bank: Option<Bank>,
}

pub struct PartitionSelector;

impl PartitionSelector {
    pub fn select(
        layout: &PartitionLayout,
        geometry: &FlashGeometry,
        declared_length: u32,
        hint: Option<Bank>,
    ) -> OtaResult<Target> {
        layout.validate(geometry)?;

        let target = match layout {
            PartitionLayout::SingleRegion { ota, .. } => Target { region: *ota, bank: None },
            PartitionLayout::DualBank { banks, active } => {
                let bank = active.other();
                if hint.is_some_and(|wanted| wanted != bank) {
                    return Err(OtaError::RegionOverlapsActive);
                }
                Target { region: banks[bank.index()], bank: Some(bank) }
            }
        };

        if target.region.overlaps(&layout.running_region()) {
            return Err(OtaError::RegionOverlapsActive);
        }
        if declared_length > target.region.length() {
            return Err(OtaError::SizeExceedsPartition {
                declared: declared_length,
                capacity: target.region.length(),
            });
        }
        Ok(target)
    }
}

/// The device's boot configuration, the single owner of the active pointer
pub trait BootConfig {
    /// Current layout, read at the start of every session
    fn layout(&self) -> OtaResult<PartitionLayout>;

    /// Make a verified image bootable. For dual-bank layouts this is the one
    /// atomic write that flips the active bank.
    fn commit(&mut self, target: &Target) -> OtaResult<()>;
}

/// In-memory boot configuration for hosts and tests
#[derive(Debug, Clone)]
pub struct RamBootConfig {
    layout: PartitionLayout,
    commits: usize,
    pending: Option<FlashRegion>,
    fail_commit: bool,
}

impl RamBootConfig {
    pub fn new(layout: PartitionLayout) -> Self {
        Self { layout, commits: 0, pending: None, fail_commit: false }
    }

    /// Number of successful commits
    pub fn commits(&self) -> usize {
        self.commits
    }

    /// Region a single-region bootloader would install from on next boot
    pub fn pending(&self) -> Option<FlashRegion> {
        self.pending
    }

    pub fn set_fail_commit(&mut self, fail: bool) {
        self.fail_commit = fail;
    }
}

impl BootConfig for RamBootConfig {
    fn layout(&self) -> OtaResult<PartitionLayout> {
        Ok(self.layout.clone())
    }

    fn commit(&mut self, target: &Target) -> OtaResult<()> {
        if self.fail_commit {
            return Err(OtaError::BootConfigFailure("injected commit failure".into()));
        }
        match (&mut self.layout, target.bank) {
            (PartitionLayout::DualBank { active, .. }, Some(bank)) => *active = bank,
            (PartitionLayout::SingleRegion { .. }, None) => self.pending = Some(target.region),
            _ => return Err(OtaError::BootConfigFailure("target does not match layout".into())),
        }
        self.commits += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> FlashGeometry {
        FlashGeometry { size: 0x40_0000, erase_block: 0x1000, max_write: 256 }
    }

    fn dual(active: Bank) -> PartitionLayout {
        PartitionLayout::DualBank {
            banks: [
                FlashRegion::new(0x1_0000, 0x1E_0000, 0x1000).unwrap(),
                FlashRegion::new(0x1F_0000, 0x1E_0000, 0x1000).unwrap(),
            ],
            active,
        }
    }

    #[test]
    fn test_dual_bank_targets_inactive() {
        let target = PartitionSelector::select(&dual(Bank::A), &geometry(), 1024, None).unwrap();
        assert_eq!(target.bank, Some(Bank::B));
        assert_eq!(target.region.start(), 0x1F_0000);

        let target = PartitionSelector::select(&dual(Bank::B), &geometry(), 1024, None).unwrap();
        assert_eq!(target.bank, Some(Bank::A));
    }

    #[test]
    fn test_hint_for_active_bank_is_rejected() {
        let err = PartitionSelector::select(&dual(Bank::A), &geometry(), 1024, Some(Bank::A));
        assert_eq!(err, Err(OtaError::RegionOverlapsActive));
        assert!(PartitionSelector::select(&dual(Bank::A), &geometry(), 1024, Some(Bank::B)).is_ok());
    }

    #[test]
    fn test_oversized_image() {
        let err = PartitionSelector::select(&dual(Bank::A), &geometry(), 0x1E_0001, None);
        assert!(matches!(err, Err(OtaError::SizeExceedsPartition { capacity: 0x1E_0000, .. })));
    }

    #[test]
    fn test_capacity_check_counts_every_declared_byte() {
        // A container header counts even though it is never written
        assert!(PartitionSelector::select(&dual(Bank::A), &geometry(), 0x1E_0000, None).is_ok());
        let err = PartitionSelector::select(&dual(Bank::A), &geometry(), 0x1E_0000 + 512, None);
        assert_eq!(err, Err(OtaError::SizeExceedsPartition { declared: 0x1E_0200, capacity: 0x1E_0000 }));
    }

    #[test]
    fn test_overlapping_single_region_is_invalid() {
        let layout = PartitionLayout::SingleRegion {
            ota: FlashRegion::new(0x8_0000, 0x8_0000, 0x1000).unwrap(),
            running: FlashRegion::new(0x1_0000, 0x8_0000, 0x1000).unwrap(),
        };
        assert!(matches!(
            PartitionSelector::select(&layout, &geometry(), 16, None),
            Err(OtaError::LayoutInvalid(_))
        ));
    }

    #[test]
    fn test_commit_flips_once() {
        let mut boot = RamBootConfig::new(dual(Bank::B));
        let target = PartitionSelector::select(&boot.layout().unwrap(), &geometry(), 16, None).unwrap();
        boot.commit(&target).unwrap();
        assert_eq!(boot.layout().unwrap().active_bank(), Some(Bank::A));
        assert_eq!(boot.commits(), 1);
    }
}
