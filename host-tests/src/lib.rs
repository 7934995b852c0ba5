//! Host-side fixtures for the OTA engine scenario and property tests.
//! Everything here runs on the development machine against `RamFlash`.

use std::sync::{Arc, Mutex};

use otaflash::config::OtaConfig;
use otaflash::flash::{FlashRegion, RamFlash, SharedFlash};
use otaflash::ota::OtaManager;
use otaflash::partition::{Bank, PartitionLayout, RamBootConfig};

pub const FLASH_SIZE: u32 = 0x40_0000;
pub const BLOCK: u32 = 0x1000;
pub const MAX_WRITE: usize = 256;

pub type HostManager = OtaManager<RamFlash, RamBootConfig>;

/// A manager wired to RAM flash, plus a handle to inspect the device
pub struct Rig {
    pub manager: HostManager,
    pub device: Arc<Mutex<RamFlash>>,
}

impl Rig {
    pub fn new(flash: RamFlash, layout: PartitionLayout, config: OtaConfig) -> Self {
        let shared = SharedFlash::new(flash);
        let device = shared.handle();
        let manager = OtaManager::new(shared, RamBootConfig::new(layout), config)
            .expect("layout fits the device");
        Self { manager, device }
    }

    /// Two 1.5 MiB banks on a 4 MiB device
    pub fn dual_bank(active: Bank) -> Self {
        Self::new(
            RamFlash::new(FLASH_SIZE, BLOCK, MAX_WRITE),
            dual_layout(0x1_0000, 0x18_0000, active),
            OtaConfig::default(),
        )
    }

    pub fn with_config(mut self, config: OtaConfig) -> Self {
        self.manager.set_config(config);
        self
    }

    pub fn active_bank(&self) -> Option<Bank> {
        self.manager.layout().ok().and_then(|layout| layout.active_bank())
    }

    pub fn bank_region(&self, bank: Bank) -> FlashRegion {
        match self.manager.layout() {
            Ok(PartitionLayout::DualBank { banks, .. }) => banks[bank.index()],
            other => panic!("not a dual-bank layout: {:?}", other),
        }
    }

    pub fn contents(&self, address: u32, len: usize) -> Vec<u8> {
        self.device.lock().unwrap().contents(address, len).to_vec()
    }

    pub fn stats(&self) -> otaflash::flash::FlashStats {
        self.device.lock().unwrap().stats()
    }
}

/// Banks of `bank_len` bytes back to back from `first`
pub fn dual_layout(first: u32, bank_len: u32, active: Bank) -> PartitionLayout {
    PartitionLayout::DualBank {
        banks: [
            FlashRegion::new(first, bank_len, BLOCK).unwrap(),
            FlashRegion::new(first + bank_len, bank_len, BLOCK).unwrap(),
        ],
        active,
    }
}

/// Byte source that hands out the image in caller-chosen read sizes
pub struct ChunkedReader<'a> {
    data: &'a [u8],
    sizes: Vec<usize>,
    reads: usize,
    /// Fail with a transport error once this many bytes were delivered
    fail_at: Option<usize>,
    pos: usize,
}

#[derive(Debug)]
pub struct LinkDown;

impl embedded_io::Error for LinkDown {
    fn kind(&self) -> embedded_io::ErrorKind {
        embedded_io::ErrorKind::ConnectionReset
    }
}

impl<'a> ChunkedReader<'a> {
    pub fn new(data: &'a [u8], sizes: Vec<usize>) -> Self {
        Self { data, sizes, reads: 0, fail_at: None, pos: 0 }
    }

    pub fn failing_at(mut self, at: usize) -> Self {
        self.fail_at = Some(at);
        self
    }
}

impl embedded_io::ErrorType for ChunkedReader<'_> {
    type Error = LinkDown;
}

impl embedded_io::Read for ChunkedReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.fail_at.is_some_and(|at| self.pos >= at) {
            return Err(LinkDown);
        }
        let step = if self.sizes.is_empty() {
            buf.len()
        } else {
            self.sizes[self.reads % self.sizes.len()].max(1)
        };
        self.reads += 1;
        let mut n = step.min(buf.len()).min(self.data.len() - self.pos);
        if let Some(at) = self.fail_at {
            n = n.min(at - self.pos);
        }
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
