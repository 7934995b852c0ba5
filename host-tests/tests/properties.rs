// Properties of the engine under arbitrary chunking and corruption

use proptest::prelude::*;

use otaflash::ota::{receive_with_yield, verify_image, ImageBuilder, ImageFormat, ReceiveOptions};
use otaflash::partition::Bank;
use otaflash::OtaError;
use otaflash_host_tests::{ChunkedReader, Rig, BLOCK};

fn format_strategy() -> impl Strategy<Value = ImageFormat> {
    prop_oneof![
        Just(ImageFormat::Checksummed),
        Just(ImageFormat::SignedContainer),
        Just(ImageFormat::EspApp),
    ]
}

fn stream(rig: &mut Rig, image: &[u8], reads: Vec<usize>, chunk_size: usize) -> Result<(), OtaError> {
    let id = rig.manager.begin_update(image.len() as u32, None)?;
    let mut reader = ChunkedReader::new(image, reads);
    let options = ReceiveOptions { chunk_size, ..ReceiveOptions::default() };
    receive_with_yield(&mut rig.manager, id, &mut reader, &options, |_| {}).map(|_| ())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_chunking_does_not_change_flash_contents(
        format in format_strategy(),
        payload_len in 0usize..20_000,
        reads in prop::collection::vec(1usize..3000, 1..8),
        chunk_size in 256usize..4096,
    ) {
        let builder = ImageBuilder::new(format).version("9.9");
        let total = (builder.overhead() + payload_len).max(format.min_len());
        let image = builder.build_with_len(total).unwrap();

        let mut rig = Rig::dual_bank(Bank::A);
        stream(&mut rig, &image, reads, chunk_size).unwrap();

        let kept = &image[format.stripped_len()..];
        let target = rig.bank_region(Bank::B);
        prop_assert_eq!(rig.active_bank(), Some(Bank::B));
        prop_assert_eq!(rig.contents(target.start(), kept.len()), kept.to_vec());
    }

    #[test]
    fn prop_single_byte_corruption_never_commits(
        format in format_strategy(),
        payload_len in 64usize..8_000,
        flip_seed in any::<prop::sample::Index>(),
        mask in 1u8..=255,
    ) {
        let mut image = ImageBuilder::new(format).build_with_len(
            ImageBuilder::new(format).overhead() + payload_len,
        ).unwrap();
        // the container header is not covered by the digest
        let covered = format.stripped_len();
        let at = covered + flip_seed.index(image.len() - covered);
        image[at] ^= mask;

        let mut rig = Rig::dual_bank(Bank::A);
        prop_assert!(stream(&mut rig, &image, vec![1024], 2048).is_err());
        prop_assert!(verify_image(&image).is_err());
        prop_assert_eq!(rig.active_bank(), Some(Bank::A));
        prop_assert_eq!(rig.manager.boot_config().commits(), 0);

        // nothing bootable left behind in the target bank
        let target = rig.bank_region(Bank::B);
        prop_assert!(rig.contents(target.start(), 32).iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn prop_writes_stay_inside_target_region(
        payload_len in 0usize..(4 * BLOCK as usize),
        chunk_size in 256usize..2048,
    ) {
        let image = ImageBuilder::new(ImageFormat::Checksummed)
            .build_with_len(ImageBuilder::new(ImageFormat::Checksummed).overhead() + payload_len)
            .unwrap();

        let mut rig = Rig::dual_bank(Bank::A);
        stream(&mut rig, &image, Vec::new(), chunk_size).unwrap();

        let written = rig.stats().bytes_written;
        prop_assert_eq!(written, image.len() as u64);
        let active = rig.bank_region(Bank::A);
        prop_assert!(rig.contents(active.start(), active.length() as usize).iter().all(|b| *b == 0xFF));
    }
}
