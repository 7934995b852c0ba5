// End-to-end update scenarios against RAM flash

use otaflash::config::{EraseStrategy, OtaConfig};
use otaflash::flash::{FaultPlan, FlashRegion, RamFlash};
use otaflash::ota::{receive_with_yield, ImageBuilder, ImageFormat, ReceiveOptions, SessionState};
use otaflash::partition::{Bank, PartitionLayout};
use otaflash::OtaError;
use otaflash_host_tests::{dual_layout, ChunkedReader, Rig, BLOCK, FLASH_SIZE, MAX_WRITE};

const MIB: usize = 1024 * 1024;

fn no_yield(_: std::time::Duration) {}

fn options(chunk_size: usize) -> ReceiveOptions {
    ReceiveOptions { chunk_size, ..ReceiveOptions::default() }
}

fn run(rig: &mut Rig, image: &[u8], chunk: usize) -> Result<otaflash::ota::FinishReport, OtaError> {
    let id = rig.manager.begin_update(image.len() as u32, None)?;
    let mut reader = ChunkedReader::new(image, Vec::new());
    receive_with_yield(&mut rig.manager, id, &mut reader, &options(chunk), no_yield)
}

#[test]
fn test_one_mib_checksummed_image_commits() {
    let mut rig = Rig::dual_bank(Bank::A);
    let image = ImageBuilder::new(ImageFormat::Checksummed)
        .version("1.2.0")
        .build_with_len(MIB)
        .unwrap();

    let report = run(&mut rig, &image, 2048).unwrap();
    assert_eq!(report.bytes_written, MIB as u32);
    assert!(report.committed);

    assert_eq!(rig.active_bank(), Some(Bank::B));
    let target = rig.bank_region(Bank::B);
    assert_eq!(rig.contents(target.start(), image.len()), image);
    assert_eq!(rig.manager.boot_config().commits(), 1);

    let status = rig.manager.status();
    assert_eq!(status.state, SessionState::Committed);
    assert_eq!(status.progress, 100);
    assert_eq!(status.target_bank, Some(Bank::B));
}

#[test]
fn test_incremental_erase_touches_only_covered_blocks() {
    let mut rig = Rig::dual_bank(Bank::A);
    let image = ImageBuilder::new(ImageFormat::Checksummed).build_with_len(10 * BLOCK as usize + 1).unwrap();

    run(&mut rig, &image, 1500).unwrap();
    // eleven covered blocks, nothing beyond
    assert_eq!(rig.stats().erases, 11);
    let target = rig.bank_region(Bank::B);
    assert!(rig.contents(target.start() + 11 * BLOCK, BLOCK as usize).iter().all(|b| *b == 0xFF));
}

#[test]
fn test_upfront_erase_strategy_commits() {
    let config = OtaConfig { erase_strategy: EraseStrategy::Upfront, ..OtaConfig::default() };
    let mut rig = Rig::dual_bank(Bank::A).with_config(config);
    let image = ImageBuilder::new(ImageFormat::EspApp).build_with_len(5 * BLOCK as usize).unwrap();

    let report = run(&mut rig, &image, 4096).unwrap();
    assert!(report.committed);
    // every covered block erased once, before the first write
    assert_eq!(rig.stats().erases, 5);
}

#[test]
fn test_flipped_trailer_is_rejected() {
    let mut rig = Rig::dual_bank(Bank::A);
    let mut image = ImageBuilder::new(ImageFormat::Checksummed).build_with_len(64 * 1024).unwrap();
    let last = image.len() - 1;
    image[last] ^= 0x01;

    let err = run(&mut rig, &image, 2048).unwrap_err();
    assert!(matches!(err, OtaError::ChecksumMismatch { .. }));
    assert_eq!(err.code(), "CHECKSUM_MISMATCH");

    assert_eq!(rig.active_bank(), Some(Bank::A));
    assert_eq!(rig.manager.boot_config().commits(), 0);
    let target = rig.bank_region(Bank::B);
    assert!(rig.contents(target.start(), BLOCK as usize).iter().all(|b| *b == 0xFF));
    assert_eq!(rig.manager.status().last_error, Some("CHECKSUM_MISMATCH"));
}

#[test]
fn test_signed_container_strips_header() {
    let mut rig = Rig::dual_bank(Bank::A);
    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let image = ImageBuilder::new(ImageFormat::SignedContainer)
        .hardware("bl602")
        .version("2.0.1")
        .build(&payload);

    let report = run(&mut rig, &image, 1000).unwrap();
    assert_eq!(report.bytes_written, image.len() as u32);
    let target = rig.bank_region(Bank::B);
    assert_eq!(rig.contents(target.start(), payload.len()), payload);
    assert!(rig.contents(target.start() + payload.len() as u32, 16).iter().all(|b| *b == 0xFF));
}

#[test]
fn test_hardware_tag_mismatch_leaves_flash_untouched() {
    let config = OtaConfig { hardware_tag: Some("bl602".into()), ..OtaConfig::default() };
    let mut rig = Rig::dual_bank(Bank::A).with_config(config);
    let image = ImageBuilder::new(ImageFormat::SignedContainer).hardware("bl616").build(&[0x5A; 4096]);

    let err = run(&mut rig, &image, 2048).unwrap_err();
    assert_eq!(err, OtaError::HeaderInvalid("hardware tag mismatch"));
    assert_eq!(rig.stats().erases, 0);
    assert_eq!(rig.stats().writes, 0);
}

#[test]
fn test_stream_ending_early_is_incomplete() {
    let mut rig = Rig::dual_bank(Bank::A);
    let image = ImageBuilder::new(ImageFormat::Checksummed).build_with_len(10_000).unwrap();

    let id = rig.manager.begin_update(image.len() as u32, None).unwrap();
    let mut reader = ChunkedReader::new(&image[..9000], Vec::new());
    let err = receive_with_yield(&mut rig.manager, id, &mut reader, &options(2048), no_yield).unwrap_err();

    assert_eq!(err, OtaError::IncompleteData { received: 9000, expected: 10_000 });
    assert_eq!(rig.active_bank(), Some(Bank::A));
    let target = rig.bank_region(Bank::B);
    assert!(rig.contents(target.start(), BLOCK as usize).iter().all(|b| *b == 0xFF));
    assert!(!rig.manager.is_active());
}

#[test]
fn test_transport_error_fails_session() {
    let mut rig = Rig::dual_bank(Bank::A);
    let image = ImageBuilder::new(ImageFormat::Checksummed).build_with_len(10_000).unwrap();

    let id = rig.manager.begin_update(image.len() as u32, None).unwrap();
    let mut reader = ChunkedReader::new(&image, vec![1000]).failing_at(5000);
    let err = receive_with_yield(&mut rig.manager, id, &mut reader, &options(2048), no_yield).unwrap_err();

    assert_eq!(err, OtaError::TransportReadError { received: 5000, expected: 10_000 });
    assert_eq!(rig.manager.status().state, SessionState::Failed);
    assert_eq!(rig.manager.boot_config().commits(), 0);
}

#[test]
fn test_updates_alternate_banks() {
    let mut rig = Rig::dual_bank(Bank::B);
    let image = ImageBuilder::new(ImageFormat::EspApp).version("3.1").build_with_len(40_000).unwrap();

    run(&mut rig, &image, 2048).unwrap();
    assert_eq!(rig.active_bank(), Some(Bank::A));
    let first = rig.bank_region(Bank::A);
    assert_eq!(rig.contents(first.start(), image.len()), image);

    run(&mut rig, &image, 2048).unwrap();
    assert_eq!(rig.active_bank(), Some(Bank::B));
    assert_eq!(rig.manager.boot_config().commits(), 2);
}

#[test]
fn test_oversized_image_is_refused_before_erase() {
    // 128-byte erase blocks so the banks can be exactly 2,000,000 bytes
    let layout = PartitionLayout::DualBank {
        banks: [
            FlashRegion::new(0, 2_000_000, 128).unwrap(),
            FlashRegion::new(2_000_000, 2_000_000, 128).unwrap(),
        ],
        active: Bank::A,
    };
    let mut rig = Rig::new(RamFlash::new(FLASH_SIZE, 128, MAX_WRITE), layout, OtaConfig::default());

    let err = rig.manager.begin_update(3_000_000, None).unwrap_err();
    assert_eq!(err, OtaError::SizeExceedsPartition { declared: 3_000_000, capacity: 2_000_000 });
    assert!(err.is_side_effect_free());
    assert_eq!(rig.stats().erases, 0);
    assert_eq!(rig.stats().writes, 0);
    assert!(!rig.manager.is_active());
}

#[test]
fn test_hint_for_active_bank_is_refused() {
    let mut rig = Rig::dual_bank(Bank::A);
    assert_eq!(rig.manager.begin_update(4096, Some(Bank::A)), Err(OtaError::RegionOverlapsActive));
    assert!(rig.manager.begin_update(4096, Some(Bank::B)).is_ok());
}

#[test]
fn test_second_session_is_refused() {
    let mut rig = Rig::dual_bank(Bank::A);
    let id = rig.manager.begin_update(4096, None).unwrap();
    assert_eq!(rig.manager.begin_update(4096, None), Err(OtaError::SessionAlreadyActive));
    assert_eq!(rig.manager.status().session, Some(id));
}

#[test]
fn test_abort_clears_signature_zone() {
    let mut rig = Rig::dual_bank(Bank::A);
    let image = ImageBuilder::new(ImageFormat::Checksummed).build_with_len(3 * BLOCK as usize).unwrap();
    let abort = rig.manager.abort_handle();

    let id = rig.manager.begin_update(image.len() as u32, None).unwrap();
    rig.manager.feed(id, &image[..2 * BLOCK as usize]).unwrap();
    let target = rig.bank_region(Bank::B);
    // past the signature zone the payload is already in flash
    assert_eq!(rig.contents(target.start() + 32, 64), image[32..96].to_vec());

    abort.abort();
    let err = rig.manager.feed(id, &image[2 * BLOCK as usize..]).unwrap_err();
    assert!(matches!(err, OtaError::Aborted(_)));
    assert!(rig.contents(target.start(), BLOCK as usize).iter().all(|b| *b == 0xFF));
    assert_eq!(rig.active_bank(), Some(Bank::A));
    assert_eq!(rig.manager.status().state, SessionState::Failed);
}

#[test]
fn test_abort_of_unknown_session_is_ignored() {
    let mut rig = Rig::dual_bank(Bank::A);
    rig.manager.abort(42);
    assert_eq!(rig.manager.status().state, SessionState::Idle);
}

#[test]
fn test_repeated_failures_keep_targeting_inactive_bank() {
    let mut rig = Rig::dual_bank(Bank::A);
    let mut image = ImageBuilder::new(ImageFormat::Checksummed).build_with_len(20_000).unwrap();
    image[100] ^= 0xFF;

    for _ in 0..3 {
        let err = run(&mut rig, &image, 2048).unwrap_err();
        assert!(matches!(err, OtaError::ChecksumMismatch { .. }));
        assert_eq!(rig.manager.status().target_bank, Some(Bank::B));
        assert_eq!(rig.active_bank(), Some(Bank::A));
    }

    image[100] ^= 0xFF;
    run(&mut rig, &image, 2048).unwrap();
    assert_eq!(rig.active_bank(), Some(Bank::B));
}

#[test]
fn test_write_fault_reports_address() {
    let mut rig = Rig::dual_bank(Bank::A);
    let target = rig.bank_region(Bank::B);
    let fault_at = target.start() + 2 * BLOCK + 10;
    rig.device.lock().unwrap().set_faults(FaultPlan { fail_write_at: Some(fault_at), ..FaultPlan::default() });
    let image = ImageBuilder::new(ImageFormat::Checksummed).build_with_len(4 * BLOCK as usize).unwrap();

    let err = run(&mut rig, &image, 2048).unwrap_err();
    match err {
        OtaError::FlashWriteFailure { address, .. } => {
            assert!(address <= fault_at && fault_at < address + MAX_WRITE as u32)
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(rig.active_bank(), Some(Bank::A));
}

#[test]
fn test_commit_failure_is_reported() {
    let mut rig = Rig::dual_bank(Bank::A);
    rig.manager.boot_config_mut().set_fail_commit(true);
    let image = ImageBuilder::new(ImageFormat::Checksummed).build_with_len(8192).unwrap();

    let err = run(&mut rig, &image, 2048).unwrap_err();
    assert!(matches!(err, OtaError::BootConfigFailure(_)));
    let target = rig.bank_region(Bank::B);
    assert!(rig.contents(target.start(), 32).iter().all(|b| *b == 0xFF));
}

#[test]
fn test_single_region_arms_bootloader_copy() {
    let ota = FlashRegion::new(0x13_3000, 0xA_A000, BLOCK).unwrap();
    let layout = PartitionLayout::SingleRegion {
        ota,
        running: FlashRegion::new(0x7000, 0x12_C000, BLOCK).unwrap(),
    };
    let mut rig = Rig::new(RamFlash::new(0x20_0000, BLOCK, MAX_WRITE), layout, OtaConfig::default());
    let image = ImageBuilder::new(ImageFormat::Checksummed).build_with_len(100_000).unwrap();

    let report = run(&mut rig, &image, 2048).unwrap();
    assert!(report.committed);
    assert_eq!(rig.manager.boot_config().pending(), Some(ota));
    assert_eq!(rig.contents(ota.start(), image.len()), image);
}

#[test]
fn test_flash_dump_refused_during_session() {
    let mut rig = Rig::dual_bank(Bank::A);
    let running = dual_layout(0x1_0000, 0x18_0000, Bank::A).running_region();
    assert_eq!(rig.manager.read_flash(running.start(), 16).unwrap(), vec![0xFF; 16]);

    rig.manager.begin_update(4096, None).unwrap();
    assert_eq!(rig.manager.read_flash(running.start(), 16), Err(OtaError::SessionAlreadyActive));
}

#[test]
fn test_erase_fault_fails_and_clears_signature_zone() {
    let mut rig = Rig::dual_bank(Bank::A);
    let target = rig.bank_region(Bank::B);
    let bad_block = target.start() + 2 * BLOCK;
    rig.device.lock().unwrap().set_faults(FaultPlan { fail_erase_at: Some(bad_block), ..FaultPlan::default() });
    let image = ImageBuilder::new(ImageFormat::Checksummed).build_with_len(4 * BLOCK as usize).unwrap();

    let err = run(&mut rig, &image, 2048).unwrap_err();
    match err {
        OtaError::FlashEraseFailure { address, .. } => assert_eq!(address, bad_block),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(rig.manager.status().last_error, Some("FLASH_ERASE_FAILURE"));
    assert!(rig.contents(target.start(), BLOCK as usize).iter().all(|b| *b == 0xFF));
    assert_eq!(rig.manager.boot_config().commits(), 0);
    assert_eq!(rig.active_bank(), Some(Bank::A));
}

#[test]
fn test_signature_write_fault_keeps_active_bank() {
    let mut rig = Rig::dual_bank(Bank::A);
    let target = rig.bank_region(Bank::B);
    // only the held-back signature is ever written at the region start
    rig.device.lock().unwrap().set_faults(FaultPlan { fail_write_at: Some(target.start()), ..FaultPlan::default() });
    let image = ImageBuilder::new(ImageFormat::EspApp).build_with_len(3 * BLOCK as usize).unwrap();

    let err = run(&mut rig, &image, 2048).unwrap_err();
    assert!(matches!(err, OtaError::SignatureWriteFailure(_)));
    assert_eq!(err.code(), "SIGNATURE_WRITE_FAILURE");
    assert_eq!(rig.active_bank(), Some(Bank::A));
    assert_eq!(rig.manager.boot_config().commits(), 0);
    assert!(rig.contents(target.start(), 32).iter().all(|b| *b == 0xFF));
}

#[test]
fn test_device_giving_up_mid_stream_fails_session() {
    let mut rig = Rig::dual_bank(Bank::A);
    rig.device.lock().unwrap().set_faults(FaultPlan { fail_after_writes: Some(3), ..FaultPlan::default() });
    let image = ImageBuilder::new(ImageFormat::Checksummed).build_with_len(4 * BLOCK as usize).unwrap();

    let err = run(&mut rig, &image, 2048).unwrap_err();
    assert!(matches!(err, OtaError::FlashWriteFailure { .. }));
    assert_eq!(rig.manager.status().state, SessionState::Failed);
    assert_eq!(rig.active_bank(), Some(Bank::A));
}
