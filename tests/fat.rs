//! Mounting, opening and reading FAT volumes, in memory and through the SD
//! card driver.

mod common;

use async_sdmmc::fat::{Completion, FatError, FatType, File, ReadDone};
use async_sdmmc::sdmmc::{SdCard, SdConfig};
use async_sdmmc::{BlockIdx, ChannelPool, Fat, MemoryBlockDevice, Spi};

use common::{
    buffer, init_logging, pattern, settle_card, settle_memory, Cs, FakeBus, FatImage, Recorder,
    SimCard, ROOT,
};

fn engine() -> Fat<Recorder> {
    Fat::with_owner(buffer(), buffer(), Recorder::default())
}

fn mount(fat: &mut Fat<Recorder>, device: &mut MemoryBlockDevice) -> Result<Completion, FatError> {
    let handle = fat.f_mount(device).unwrap();
    settle_memory(fat, device, handle).result
}

fn open(fat: &mut Fat<Recorder>, device: &mut MemoryBlockDevice, path: &str) -> Result<File, FatError> {
    let handle = fat.f_open(device, path)?;
    match settle_memory(fat, device, handle).result? {
        Completion::Opened(file) => Ok(file),
        other => panic!("open finished with {:?}", other),
    }
}

fn read(fat: &mut Fat<Recorder>, device: &mut MemoryBlockDevice, file: &File, len: u32) -> ReadDone {
    let handle = fat.f_read(device, file, buffer(), len).unwrap();
    let outcome = settle_memory(fat, device, handle);
    assert!(outcome.buffer.is_some());
    match outcome.result {
        Ok(Completion::Read(done)) => done,
        other => panic!("read finished with {:?}", other),
    }
}

fn short(name: &str) -> [u8; 11] {
    let mut raw = [b' '; 11];
    raw[..name.len()].copy_from_slice(name.as_bytes());
    raw
}

#[test]
fn superfloppy_fat16() {
    init_logging();
    let mut image = FatImage::fat16(8192, 0, 8192, 1);
    image.add_label(b"CARD       ");
    image.add_file(ROOT, b"HELLO   TXT", None, b"hello, world\n", 1);
    let root = image.root_dir_sector();
    let clusters = image.cluster_begin();
    let mut disk = image.image;
    let mut device = MemoryBlockDevice::new(&mut disk);
    let mut fat = engine();
    assert!(!fat.f_mounted());

    match mount(&mut fat, &mut device) {
        Ok(Completion::Mounted { label }) => {
            assert_eq!(label.unwrap().contents(), b"CARD       ")
        }
        other => panic!("mount finished with {:?}", other),
    }
    assert!(fat.f_mounted());
    let volume = *fat.volume().unwrap();
    assert_eq!(volume.fat_type, FatType::Fat16);
    assert_eq!(volume.fat_begin_lba, BlockIdx(1));
    assert_eq!(volume.root_dir_sector, BlockIdx(root));
    assert_eq!(volume.cluster_begin_lba, BlockIdx(clusters));

    let file = open(&mut fat, &mut device, "/hello.txt").unwrap();
    assert_eq!(file.size(), 13);
    let done = read(&mut fat, &mut device, &file, 512);
    assert_eq!(done.bytes, 13);
    assert!(done.file.is_eof());
    assert_eq!(fat.owner().data, b"hello, world\n");
    assert_eq!(fat.pending(), 0);
}

#[test]
fn partitioned_fat32_nested_path() {
    init_logging();
    let start = 2048;
    let total = 68_000;
    let mut image = FatImage::fat32(start + total, start, total, 1).with_mbr(0x0C);
    let docs = image.add_dir(ROOT, b"DOCS       ", None);
    let notes = image.add_dir(docs, b"NOTES      ", None);
    // Push the target into the directory's second cluster.
    for i in 0..20 {
        image.add_file(notes, &short(&format!("FILE{:04}TXT", i)), None, b"x", 1);
    }
    let data = pattern(1500, 3);
    let first = image.add_file(notes, b"README  TXT", None, &data, 3);
    let fat_begin = image.fat_begin();
    let mut disk = image.image;
    let mut device = MemoryBlockDevice::new(&mut disk);
    let mut fat = engine();

    assert!(matches!(
        mount(&mut fat, &mut device),
        Ok(Completion::Mounted { label: None })
    ));
    let volume = *fat.volume().unwrap();
    assert_eq!(volume.fat_type, FatType::Fat32);
    assert_eq!(volume.fat_begin_lba, BlockIdx(fat_begin));

    let file = open(&mut fat, &mut device, "docs/notes/readme.txt").unwrap();
    assert_eq!(file.size(), 1500);
    assert_eq!(file.first_cluster().number(), first);

    // Three clusters, each a stride apart
    let done = read(&mut fat, &mut device, &file, 4096);
    assert_eq!(done.bytes, 1500);
    assert!(done.file.is_eof());
    assert_eq!(fat.owner().data, data);
}

#[test]
fn reads_continue_from_the_returned_file() {
    let mut image = FatImage::fat16(20480, 0, 20480, 4);
    let data = pattern(5000, 9);
    image.add_file(ROOT, b"LOG     TXT", None, &data, 2);
    let mut disk = image.image;
    let mut device = MemoryBlockDevice::new(&mut disk);
    let mut fat = engine();
    mount(&mut fat, &mut device).unwrap();

    let file = open(&mut fat, &mut device, "LOG.TXT").unwrap();
    let first = read(&mut fat, &mut device, &file, 1000);
    // Whole sectors only
    assert_eq!(first.bytes, 1024);
    assert_eq!(first.file.position(), 1024);
    let rest = read(&mut fat, &mut device, &first.file, 10_000);
    assert_eq!(rest.bytes, 5000 - 1024);
    assert!(rest.file.is_eof());
    assert_eq!(fat.owner().data, data);

    let empty = read(&mut fat, &mut device, &rest.file, 512);
    assert_eq!(empty.bytes, 0);
}

#[cfg(feature = "lfn")]
#[test]
fn open_by_long_name() {
    let mut image = FatImage::fat16(8192, 0, 8192, 1);
    let reports = image.add_dir(ROOT, b"REPORT~1   ", Some("Quarterly Reports"));
    let data = pattern(700, 5);
    image.add_file(reports, b"SUMMAR~1CSV", Some("Summary for the board.csv"), &data, 1);
    image.add_file(reports, b"OTHER   CSV", None, b"nope", 1);
    let mut disk = image.image;
    let mut device = MemoryBlockDevice::new(&mut disk);
    let mut fat = engine();
    mount(&mut fat, &mut device).unwrap();

    let file = open(&mut fat, &mut device, "/Quarterly Reports/Summary for the board.csv").unwrap();
    assert_eq!(file.name().contents(), b"SUMMAR~1CSV");
    assert_eq!(file.size(), 700);
    read(&mut fat, &mut device, &file, 700);
    assert_eq!(fat.owner().data, data);

    // The 8.3 alias still works.
    let alias = open(&mut fat, &mut device, "/REPORT~1/SUMMAR~1.CSV").unwrap();
    assert_eq!(alias.first_cluster(), file.first_cluster());
}

#[test]
fn open_failures() {
    let mut image = FatImage::fat16(8192, 0, 8192, 1);
    let sub = image.add_dir(ROOT, b"SUB        ", None);
    image.add_file(sub, b"A       TXT", None, b"a", 1);
    image.add_deleted(ROOT, b"GONE    TXT");
    image.add_file(ROOT, b"PLAIN   TXT", None, b"p", 1);
    let mut disk = image.image;
    let mut device = MemoryBlockDevice::new(&mut disk);
    let mut fat = engine();

    assert_eq!(
        fat.f_open(&mut device, "/sub/a.txt").unwrap_err(),
        FatError::NotMounted
    );
    mount(&mut fat, &mut device).unwrap();

    assert_eq!(open(&mut fat, &mut device, "/missing.txt").unwrap_err(), FatError::NotFound);
    assert_eq!(open(&mut fat, &mut device, "/gone.txt").unwrap_err(), FatError::NotFound);
    assert_eq!(open(&mut fat, &mut device, "/sub").unwrap_err(), FatError::NotAFile);
    assert_eq!(
        open(&mut fat, &mut device, "/plain.txt/a.txt").unwrap_err(),
        FatError::NotADirectory
    );
    assert_eq!(open(&mut fat, &mut device, "/sub/b.txt").unwrap_err(), FatError::NotFound);
    let long = "/".repeat(2) + &"a".repeat(80);
    assert_eq!(fat.f_open(&mut device, &long).unwrap_err(), FatError::PathTooLong);

    // Failures leave the engine usable.
    let file = open(&mut fat, &mut device, "/sub/a.txt").unwrap();
    assert_eq!(file.size(), 1);
    assert_eq!(fat.pending(), 0);
}

#[test]
fn unrecognized_disks() {
    let mut blank = vec![0u8; 1024 * 512];
    let mut device = MemoryBlockDevice::new(&mut blank);
    let mut fat = engine();
    assert_eq!(mount(&mut fat, &mut device).unwrap_err(), FatError::BadSignature);
    assert!(!fat.f_mounted());

    let mut image = FatImage::fat16(4096, 0, 4096, 1);
    // Only a Linux partition, and no boot sector at block 0
    image.image[..512].iter_mut().for_each(|b| *b = 0);
    image.partition(0, 0x00, 0x83, 64, 1024);
    let mut disk = image.image;
    let mut device = MemoryBlockDevice::new(&mut disk);
    let mut fat = engine();
    assert_eq!(mount(&mut fat, &mut device).unwrap_err(), FatError::Unrecognized);
    assert!(fat.volume().is_none());
}

#[test]
fn mount_refused_while_busy() {
    let mut image = FatImage::fat16(8192, 0, 8192, 1);
    let sub = image.add_dir(ROOT, b"SUB        ", None);
    image.add_file(sub, b"A       TXT", None, b"a", 1);
    let mut disk = image.image;
    let mut device = MemoryBlockDevice::new(&mut disk);
    let mut fat = engine();
    mount(&mut fat, &mut device).unwrap();

    // The subdirectory is not cached yet, so the open has to wait for it.
    let handle = fat.f_open(&mut device, "/sub/a.txt").unwrap();
    assert_eq!(fat.f_mount(&mut device).unwrap_err(), FatError::Busy);
    settle_memory(&mut fat, &mut device, handle).result.unwrap();
    assert_eq!(fat.owner().finished.last(), Some(&handle));
}

#[test]
fn device_failures_fail_the_request() {
    let mut image = FatImage::fat16(8192, 0, 8192, 4);
    let sub = image.add_dir(ROOT, b"SUB        ", None);
    image.add_file(sub, b"A       TXT", None, b"a", 1);
    let data = pattern(5000, 7);
    let first = image.add_file(ROOT, b"DATA    BIN", None, &data, 1);
    let root = image.root_dir_sector();
    let sub_lba = image.cluster_lba(2);
    let first_lba = image.cluster_lba(first);
    let fat_begin = image.fat_begin();
    let mut disk = image.image;
    let mut device = MemoryBlockDevice::new(&mut disk);
    let mut fat = engine();

    // Root directory unreadable while looking for the label
    device.set_bad_block(Some(BlockIdx(root)));
    assert_eq!(mount(&mut fat, &mut device).unwrap_err(), FatError::Device);
    assert!(!fat.f_mounted());
    assert_eq!(fat.pending(), 0);
    assert!(!device.is_busy());

    device.set_bad_block(None);
    assert!(matches!(
        mount(&mut fat, &mut device),
        Ok(Completion::Mounted { label: None })
    ));

    // A subdirectory load fails the open that needed it.
    device.set_bad_block(Some(BlockIdx(sub_lba)));
    assert_eq!(open(&mut fat, &mut device, "/sub/a.txt").unwrap_err(), FatError::Device);
    assert_eq!(fat.pending(), 0);
    assert!(fat.f_mounted());

    device.set_bad_block(None);
    let file = open(&mut fat, &mut device, "/data.bin").unwrap();

    // The FAT is needed after the first cluster.
    device.set_bad_block(Some(BlockIdx(fat_begin)));
    let before = fat.owner().data.len();
    let handle = fat.f_read(&mut device, &file, buffer(), 5000).unwrap();
    let outcome = settle_memory(&mut fat, &mut device, handle);
    assert_eq!(outcome.result.unwrap_err(), FatError::Device);
    assert!(outcome.buffer.is_some());
    assert_eq!(fat.owner().data[before..], data[..2048]);
    assert_eq!(fat.pending(), 0);

    // A bad sector in the middle of a run
    device.set_bad_block(Some(BlockIdx(first_lba + 2)));
    let before = fat.owner().data.len();
    let handle = fat.f_read(&mut device, &file, buffer(), 5000).unwrap();
    let outcome = settle_memory(&mut fat, &mut device, handle);
    assert_eq!(outcome.result.unwrap_err(), FatError::Device);
    assert!(outcome.buffer.is_some());
    assert_eq!(fat.owner().data[before..], data[..1024]);
    assert!(!device.is_busy());
    assert_eq!(fat.pending(), 0);

    // Everything still works once the disk behaves.
    device.set_bad_block(None);
    let before = fat.owner().data.len();
    let done = read(&mut fat, &mut device, &file, 5000);
    assert_eq!(done.bytes, 5000);
    assert_eq!(fat.owner().data[before..], data[..]);
    assert!(matches!(
        mount(&mut fat, &mut device),
        Ok(Completion::Mounted { label: None })
    ));
}

#[test]
fn end_to_end_over_sd_card() {
    init_logging();
    let start = 1024;
    let mut image = FatImage::fat16(17 * 1024, start, 16384, 4).with_mbr(0x06);
    let data = pattern(5000, 1);
    let first = image.add_file(ROOT, b"DATA    BIN", None, &data, 1);
    let sub = image.add_dir(ROOT, b"SUB        ", None);
    let other = pattern(600, 2);
    image.add_file(sub, b"OTHER   BIN", None, &other, 1);
    let first_lba = image.cluster_lba(first);
    let sub_lba = image.cluster_lba(first + 3);
    let fat_begin = image.fat_begin();

    let bus = FakeBus::new(SimCard::new(image.image));
    let pool = ChannelPool::new();
    let spi = Spi::new(&bus, Cs(&bus)).unwrap();
    let mut card = SdCard::new(spi, &bus, &pool, SdConfig::default());
    card.init().unwrap();
    let mut fat = engine();

    let handle = fat.f_mount(&mut card).unwrap();
    let mounted = settle_card(&mut fat, &mut card, &pool, &bus, handle);
    assert!(mounted.result.is_ok());
    assert_eq!(fat.volume().unwrap().fat_type, FatType::Fat16);

    let handle = fat.f_open(&mut card, "/data.bin").unwrap();
    let file = match settle_card(&mut fat, &mut card, &pool, &bus, handle).result {
        Ok(Completion::Opened(file)) => file,
        other => panic!("open finished with {:?}", other),
    };

    // Queue a read, then an open that has to wait for it.
    let read = fat.f_read(&mut card, &file, buffer(), 5000).unwrap();
    let open = fat.f_open(&mut card, "/sub/other.bin").unwrap();
    assert_eq!(fat.pending(), 2);
    let done = settle_card(&mut fat, &mut card, &pool, &bus, read);
    assert!(matches!(done.result, Ok(Completion::Read(ReadDone { bytes: 5000, .. }))));
    assert_eq!(fat.owner().data, data);
    let opened = settle_card(&mut fat, &mut card, &pool, &bus, open);
    assert!(matches!(opened.result, Ok(Completion::Opened(_))));

    let sim = bus.card.borrow();
    // One device run per cluster: 4 + 4 + 2 sectors
    let runs: Vec<u32> = sim.args(18);
    assert_eq!(runs, vec![first_lba, first_lba + 4, first_lba + 8]);
    // Every sector of the read came before the directory the open needed.
    let order: Vec<u32> = sim
        .commands
        .iter()
        .filter(|(c, _)| *c == 17 || *c == 18)
        .map(|(_, arg)| *arg)
        .collect();
    let last_run = order.iter().rposition(|lba| *lba == first_lba + 8).unwrap();
    let sub_dir = order.iter().position(|lba| *lba == sub_lba).unwrap();
    assert!(last_run < sub_dir);
    assert!(order.contains(&fat_begin));
    assert!(!bus.is_selected());
}

#[test]
fn write_is_unsupported() {
    let mut image = FatImage::fat16(8192, 0, 8192, 1);
    image.add_file(ROOT, b"A       TXT", None, b"a", 1);
    let mut disk = image.image;
    let mut device = MemoryBlockDevice::new(&mut disk);
    let mut fat = engine();
    mount(&mut fat, &mut device).unwrap();
    let file = open(&mut fat, &mut device, "/a.txt").unwrap();

    assert_eq!(fat.f_write(&file, b"more").unwrap_err(), FatError::WriteUnsupported);
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
