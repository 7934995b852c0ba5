//! One firmware update, from the first header byte to commit or rollback.

use serde::Serialize;

use super::image::{ExpectedDigest, ImageFormat, ImageHeader, CONTAINER_HEADER_LEN, PROBE_LEN, SIGNATURE_LEN};
use super::verifier::{expected_hex, VerifierContext};
use crate::config::{EraseStrategy, OtaConfig};
use crate::error::{OtaError, OtaResult};
use crate::flash::{FlashBackend, SharedFlash};
use crate::partition::{BootConfig, Target};

const MAX_TRAILER_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    HeaderPending,
    Writing,
    Verifying,
    Committed,
    Failed,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::HeaderPending => "headerpending",
            SessionState::Writing => "writing",
            SessionState::Verifying => "verifying",
            SessionState::Committed => "committed",
            SessionState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Committed | SessionState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FinishReport {
    pub bytes_written: u32,
    pub committed: bool,
}

pub struct OtaSession<B> {
    state: SessionState,
    flash: SharedFlash<B>,
    target: Target,
    declared: u32,
    /// Stream bytes processed past the header buffer
    cursor: u32,
    /// Region offset up to which blocks are erased
    erased_until: u32,
    /// Set by the first erase or write; failure then clears the signature zone
    touched: bool,
    detected: Option<ImageFormat>,
    head: heapless::Vec<u8, CONTAINER_HEADER_LEN>,
    header: Option<ImageHeader>,
    verifier: Option<VerifierContext>,
    signature: heapless::Vec<u8, SIGNATURE_LEN>,
    trailer: heapless::Vec<u8, MAX_TRAILER_LEN>,
    config: OtaConfig,
    last_error: Option<OtaError>,
}

impl<B: FlashBackend> OtaSession<B> {
    pub fn new(flash: SharedFlash<B>, target: Target, declared: u32, config: &OtaConfig) -> Self {
        Self {
            state: SessionState::Idle,
            flash,
            target,
            declared,
            cursor: 0,
            erased_until: 0,
            touched: false,
            detected: None,
            head: heapless::Vec::new(),
            header: None,
            verifier: None,
            signature: heapless::Vec::new(),
            trailer: heapless::Vec::new(),
            config: config.clone(),
            last_error: None,
        }
    }

    /// Prepare the target region and wait for the header
    pub fn start(&mut self) -> OtaResult<()> {
        if self.state != SessionState::Idle {
            return Err(OtaError::InvalidState(self.state.name()));
        }
        if self.config.erase_strategy == EraseStrategy::Upfront {
            let cover = self.declared.min(self.target.region.length());
            log::info!(
                "Erasing {} bytes at 0x{:08x} before download",
                cover,
                self.target.region.start()
            );
            if let Err(e) = self.ensure_erased(cover) {
                return Err(self.fail(e));
            }
        }
        self.state = SessionState::HeaderPending;
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn declared(&self) -> u32 {
        self.declared
    }

    /// Stream bytes accepted so far, buffered header included
    pub fn received(&self) -> u32 {
        self.cursor + self.head.len() as u32
    }

    pub fn format(&self) -> Option<ImageFormat> {
        self.detected
    }

    pub fn last_error(&self) -> Option<&OtaError> {
        self.last_error.as_ref()
    }

    /// Accept the next bytes of the stream. Returns how many were consumed,
    /// which is less than `chunk.len()` only once the declared length is reached.
    pub fn feed(&mut self, chunk: &[u8]) -> OtaResult<usize> {
        match self.state {
            SessionState::HeaderPending | SessionState::Writing => {}
            other => return Err(OtaError::InvalidState(other.name())),
        }
        let room = (self.declared - self.received()) as usize;
        let data = &chunk[..chunk.len().min(room)];
        match self.consume(data) {
            Ok(()) => Ok(data.len()),
            Err(e) => Err(self.fail(e)),
        }
    }

    pub fn finish<C: BootConfig>(&mut self, boot: &mut C) -> OtaResult<FinishReport> {
        match self.state {
            SessionState::HeaderPending | SessionState::Writing => {}
            other => return Err(OtaError::InvalidState(other.name())),
        }
        if self.state != SessionState::Writing || self.cursor != self.declared {
            let err = OtaError::IncompleteData { received: self.received(), expected: self.declared };
            return Err(self.fail(err));
        }

        self.state = SessionState::Verifying;
        match self.verify_and_commit(boot) {
            Ok(()) => {
                self.state = SessionState::Committed;
                log::info!(
                    "OTA committed: {} bytes at 0x{:08x}",
                    self.declared,
                    self.target.region.start()
                );
                Ok(FinishReport { bytes_written: self.declared, committed: true })
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Stop the update. Does nothing once the session is terminal.
    pub fn abort(&mut self, reason: &'static str) {
        if self.state.is_terminal() {
            return;
        }
        log::warn!("Aborting OTA session: {}", reason);
        self.fail(OtaError::Aborted(reason));
    }

    /// Move to `Failed`, clearing the signature zone if flash was touched
    pub(crate) fn fail(&mut self, err: OtaError) -> OtaError {
        if self.state.is_terminal() {
            return err;
        }
        log::error!("OTA session failed: {}", err);
        if self.touched {
            let block = self.target.region.signature_block();
            match self.flash.erase(block) {
                Ok(()) => log::info!("Signature zone at 0x{:08x} erased", block.start()),
                Err(e) => log::warn!("Failed to erase signature zone at 0x{:08x}: {}", block.start(), e),
            }
        }
        self.state = SessionState::Failed;
        self.last_error = Some(err.clone());
        err
    }

    fn consume(&mut self, data: &[u8]) -> OtaResult<()> {
        let data = if self.state == SessionState::HeaderPending {
            self.buffer_header(data)?
        } else {
            data
        };
        if data.is_empty() {
            return Ok(());
        }
        self.process(data)
    }

    /// Collect header bytes; once the header parses, replay them and return
    /// the part of `data` that follows
    fn buffer_header<'a>(&mut self, mut data: &'a [u8]) -> OtaResult<&'a [u8]> {
        loop {
            let need = match self.detected {
                None => PROBE_LEN,
                Some(format) => format.header_len(),
            }
            .min(self.declared as usize);
            let take = need.saturating_sub(self.head.len()).min(data.len());
            self.head
                .extend_from_slice(&data[..take])
                .map_err(|_| OtaError::HeaderInvalid("header buffer overflow"))?;
            data = &data[take..];
            if self.head.len() < need {
                return Ok(data);
            }

            let format = match self.detected {
                Some(format) => format,
                None => {
                    let format = ImageFormat::detect(&self.head)?;
                    if !self.config.accepts(format) {
                        return Err(OtaError::UnsupportedImageType("image format not accepted by this device"));
                    }
                    self.detected = Some(format);
                    continue;
                }
            };

            let header = ImageHeader::parse(format, &self.head, self.declared)?;
            header.check_hardware(self.config.hardware_tag.as_deref())?;
            log::info!(
                "OTA image: {} format, {} bytes, version {}",
                format.name(),
                self.declared,
                header.sw_version.as_deref().unwrap_or("unknown")
            );
            self.verifier = Some(VerifierContext::new(format.digest_kind()));
            self.header = Some(header);
            self.state = SessionState::Writing;

            let head = core::mem::take(&mut self.head);
            self.process(&head)?;
            return Ok(data);
        }
    }

    /// Route stream bytes starting at `cursor`: stripped header bytes are
    /// dropped, trailer bytes are held back, everything else is verified
    /// and flashed
    fn process(&mut self, mut bytes: &[u8]) -> OtaResult<()> {
        let format = self.detected.ok_or(OtaError::InvalidState("writing"))?;
        let stripped = format.stripped_len() as u32;
        let trailer_at = self.declared - format.trailer_len() as u32;

        while !bytes.is_empty() {
            let pos = self.cursor;
            let n = if pos < stripped {
                (stripped - pos) as usize
            } else if pos < trailer_at {
                (trailer_at - pos) as usize
            } else {
                bytes.len()
            }
            .min(bytes.len());
            let (piece, rest) = bytes.split_at(n);

            if pos >= trailer_at {
                self.trailer
                    .extend_from_slice(piece)
                    .map_err(|_| OtaError::HeaderInvalid("trailer overflow"))?;
            } else if pos >= stripped {
                if let Some(verifier) = self.verifier.as_mut() {
                    verifier.update(piece);
                }
                self.flash_bytes(pos - stripped, piece)?;
            }
            self.cursor += n as u32;
            bytes = rest;
        }
        Ok(())
    }

    fn flash_bytes(&mut self, mut offset: u32, mut piece: &[u8]) -> OtaResult<()> {
        if (offset as usize) < SIGNATURE_LEN {
            let n = (SIGNATURE_LEN - offset as usize).min(piece.len());
            self.signature
                .extend_from_slice(&piece[..n])
                .map_err(|_| OtaError::InvalidState("signature zone full"))?;
            offset += n as u32;
            piece = &piece[n..];
        }
        if piece.is_empty() {
            return Ok(());
        }
        self.ensure_erased(offset + piece.len() as u32)?;
        self.touched = true;
        self.flash
            .write_all(self.target.region.start() + offset, piece)
            .map_err(|(address, source)| OtaError::FlashWriteFailure { address, source })
    }

    /// Erase blocks up to region offset `end`; never erases a block twice
    fn ensure_erased(&mut self, end: u32) -> OtaResult<()> {
        let region = self.target.region;
        while self.erased_until < end {
            let block = region.block_at(self.erased_until).ok_or(OtaError::FlashEraseFailure {
                address: region.start() + self.erased_until,
                source: crate::flash::FlashError::OutOfBounds,
            })?;
            self.touched = true;
            log::debug!("Erasing block at 0x{:08x}", block.start());
            self.flash
                .erase(block)
                .map_err(|source| OtaError::FlashEraseFailure { address: block.start(), source })?;
            self.erased_until += block.length();
        }
        Ok(())
    }

    fn verify_and_commit<C: BootConfig>(&mut self, boot: &mut C) -> OtaResult<()> {
        let header = self.header.clone().ok_or(OtaError::InvalidState("verifying"))?;
        let verifier = self.verifier.take().ok_or(OtaError::InvalidState("verifying"))?;
        let digest = verifier.finalize();
        let expected: &[u8] = match &header.expected {
            ExpectedDigest::Trailer => &self.trailer,
            ExpectedDigest::Embedded(hash) => hash,
        };
        if !digest.matches(expected) {
            return Err(OtaError::ChecksumMismatch {
                computed: digest.to_hex(),
                expected: expected_hex(header.format.digest_kind(), expected),
            });
        }
        log::info!("OTA image verified ({})", digest.to_hex());

        let region = self.target.region;
        let flash_len = header.flash_len(self.declared);
        if !self.trailer.is_empty() {
            let trailer = self.trailer.clone();
            let offset = flash_len - trailer.len() as u32;
            self.ensure_erased(flash_len)?;
            self.touched = true;
            self.flash
                .write_all(region.start() + offset, &trailer)
                .map_err(|(address, source)| OtaError::FlashWriteFailure { address, source })?;
        }

        let signature = self.signature.clone();
        self.ensure_erased(signature.len() as u32)?;
        self.touched = true;
        self.flash
            .write_all(region.start(), &signature)
            .map_err(|(_, source)| OtaError::SignatureWriteFailure(source))?;

        boot.commit(&self.target).map_err(|e| match e {
            OtaError::BootConfigFailure(_) => e,
            other => OtaError::BootConfigFailure(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{FlashRegion, RamFlash};
    use crate::ota::image::ImageBuilder;
    use crate::partition::{Bank, PartitionLayout, RamBootConfig};

    const BLOCK: u32 = 0x1000;

    fn setup(config: &OtaConfig, declared: u32) -> (SharedFlash<RamFlash>, OtaSession<RamFlash>, RamBootConfig) {
        let flash = SharedFlash::new(RamFlash::new(0x4_0000, BLOCK, 256));
        let banks = [
            FlashRegion::new(0x0_0000, 0x2_0000, BLOCK).unwrap(),
            FlashRegion::new(0x2_0000, 0x2_0000, BLOCK).unwrap(),
        ];
        let target = Target { region: banks[1], bank: Some(Bank::B) };
        let boot = RamBootConfig::new(PartitionLayout::DualBank { banks, active: Bank::A });
        let mut session = OtaSession::new(flash.clone(), target, declared, config);
        session.start().unwrap();
        (flash, session, boot)
    }

    fn contents(flash: &SharedFlash<RamFlash>, address: u32, len: usize) -> Vec<u8> {
        flash.with(|f| Ok(f.contents(address, len).to_vec())).unwrap()
    }

    #[test]
    fn test_signature_is_written_last() {
        let image = ImageBuilder::new(ImageFormat::Checksummed).build_with_len(10_000).unwrap();
        let (flash, mut session, mut boot) = setup(&OtaConfig::default(), image.len() as u32);

        for chunk in image.chunks(1000) {
            assert_eq!(session.feed(chunk).unwrap(), chunk.len());
        }
        // body is in flash, signature zone and trailer are not
        assert_eq!(contents(&flash, 0x2_0000, SIGNATURE_LEN), vec![0xFF; SIGNATURE_LEN]);
        assert_eq!(contents(&flash, 0x2_0000 + 32, 100), image[32..132].to_vec());
        assert_eq!(contents(&flash, 0x2_0000 + 9996, 4), vec![0xFF; 4]);

        let report = session.finish(&mut boot).unwrap();
        assert_eq!(report, FinishReport { bytes_written: 10_000, committed: true });
        assert_eq!(contents(&flash, 0x2_0000, image.len()), image);
        assert_eq!(boot.layout().unwrap().active_bank(), Some(Bank::B));
    }

    #[test]
    fn test_container_header_is_stripped() {
        let payload: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let image = ImageBuilder::new(ImageFormat::SignedContainer).build(&payload);
        let (flash, mut session, mut boot) = setup(&OtaConfig::default(), image.len() as u32);

        // byte-at-a-time through the header
        for byte in &image[..600] {
            session.feed(core::slice::from_ref(byte)).unwrap();
        }
        session.feed(&image[600..]).unwrap();
        session.finish(&mut boot).unwrap();
        assert_eq!(contents(&flash, 0x2_0000, payload.len()), payload);
    }

    #[test]
    fn test_never_consumes_past_declared() {
        let image = ImageBuilder::new(ImageFormat::EspApp).build_with_len(500).unwrap();
        let (_flash, mut session, _boot) = setup(&OtaConfig::default(), 500);
        let mut padded = image.clone();
        padded.extend_from_slice(&[0u8; 64]);
        assert_eq!(session.feed(&padded).unwrap(), 500);
        assert_eq!(session.feed(&[1, 2, 3]).unwrap(), 0);
    }

    #[test]
    fn test_finish_before_end_is_incomplete() {
        let image = ImageBuilder::new(ImageFormat::Checksummed).build_with_len(8192).unwrap();
        let (flash, mut session, mut boot) = setup(&OtaConfig::default(), 8192);
        session.feed(&image[..5000]).unwrap();
        let err = session.finish(&mut boot).unwrap_err();
        assert_eq!(err, OtaError::IncompleteData { received: 5000, expected: 8192 });
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(contents(&flash, 0x2_0000, 4096), vec![0xFF; 4096]);
        assert_eq!(boot.commits(), 0);
        // terminal
        assert!(matches!(session.feed(&image[5000..]), Err(OtaError::InvalidState("failed"))));
    }

    #[test]
    fn test_unknown_magic() {
        let (flash, mut session, _boot) = setup(&OtaConfig::default(), 4096);
        let err = session.feed(&[0x42; 64]).unwrap_err();
        assert_eq!(err, OtaError::HeaderInvalid("unknown image magic"));
        let stats = flash.with(|f| Ok(f.stats())).unwrap();
        assert_eq!(stats.writes, 0);
        assert_eq!(stats.erases, 0);
    }

    #[test]
    fn test_format_filter() {
        let config = OtaConfig { formats: vec![ImageFormat::EspApp], ..OtaConfig::default() };
        let image = ImageBuilder::new(ImageFormat::Checksummed).build_with_len(1024).unwrap();
        let (_flash, mut session, _boot) = setup(&config, 1024);
        assert!(matches!(session.feed(&image), Err(OtaError::UnsupportedImageType(_))));
    }

    #[test]
    fn test_upfront_erase_covers_image() {
        let config = OtaConfig { erase_strategy: EraseStrategy::Upfront, ..OtaConfig::default() };
        let image = ImageBuilder::new(ImageFormat::EspApp).build_with_len(3 * BLOCK as usize + 10).unwrap();
        let (flash, mut session, mut boot) = setup(&config, image.len() as u32);
        assert_eq!(flash.with(|f| Ok(f.stats())).unwrap().erases, 4);
        session.feed(&image).unwrap();
        session.finish(&mut boot).unwrap();
        assert_eq!(flash.with(|f| Ok(f.stats())).unwrap().erases, 4);
    }

    #[test]
    fn test_abort_is_idempotent() {
        let image = ImageBuilder::new(ImageFormat::Checksummed).build_with_len(8192).unwrap();
        let (flash, mut session, _boot) = setup(&OtaConfig::default(), 8192);
        session.feed(&image[..6000]).unwrap();
        session.abort("user");
        session.abort("user again");
        assert_eq!(session.last_error(), Some(&OtaError::Aborted("user")));
        assert_eq!(contents(&flash, 0x2_0000, 4096), vec![0xFF; 4096]);
    }

    #[test]
    fn test_commit_failure_clears_signature() {
        let image = ImageBuilder::new(ImageFormat::Checksummed).build_with_len(2048).unwrap();
        let (flash, mut session, mut boot) = setup(&OtaConfig::default(), 2048);
        boot.set_fail_commit(true);
        session.feed(&image).unwrap();
        assert!(matches!(session.finish(&mut boot), Err(OtaError::BootConfigFailure(_))));
        assert_eq!(contents(&flash, 0x2_0000, SIGNATURE_LEN), vec![0xFF; SIGNATURE_LEN]);
        assert_eq!(boot.layout().unwrap().active_bank(), Some(Bank::A));
    }
}
