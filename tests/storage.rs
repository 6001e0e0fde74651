//! Mount manager scenarios on a simulated W25Q128.

use alarm_clock::mem::block_device::FlashBlockDevice;
use alarm_clock::mem::ex_flash::{FLASH_CAPACITY, W25Q128};
use alarm_clock::mem::fs::{FileKind, FlashFs, OpenFlags, SeekFrom, StorageError};
use alarm_clock::mem::sim::SimFlash;
use embedded_hal_mock::eh1::delay::NoopDelay;
use littlefs2::fs::Filesystem;
use littlefs2::io::Error as LfsError;

type Device = FlashBlockDevice<SimFlash, NoopDelay>;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn device(sim: &SimFlash) -> Device {
    FlashBlockDevice::new(W25Q128::new(sim.clone(), NoopDelay::new())).unwrap()
}

fn tree(fs: &mut FlashFs<Device>) -> Vec<(usize, String, FileKind)> {
    let mut seen = Vec::new();
    fs.list_tree(|depth, e| seen.push((depth, e.name.to_string(), e.kind)))
        .unwrap();
    seen
}

fn write(fs: &mut FlashFs<Device>, path: &str, data: &[u8]) {
    let file = fs
        .open(path, OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNC)
        .unwrap();
    assert_eq!(fs.write(&file, data).unwrap(), data.len());
    fs.close(file).unwrap();
}

#[test]
fn fresh_sixteen_megabyte_chip() {
    init_logger();
    let sim = SimFlash::new(FLASH_CAPACITY);
    let mut dev = device(&sim);

    // An erased chip holds no filesystem
    assert_eq!(
        Filesystem::mount_and_then(&mut dev, |_| Ok(())),
        Err(LfsError::CORRUPTION)
    );

    let mut fs = FlashFs::new(dev);
    fs.mount().unwrap();
    write(&mut fs, "/uploads/test.txt", b"hello");

    let file = fs.open("/uploads/test.txt", OpenFlags::READ).unwrap();
    let mut all = [0u8; 16];
    assert_eq!(fs.read(&file, &mut all).unwrap(), 5);
    assert_eq!(&all[..5], b"hello");

    fs.seek(&file, SeekFrom::Start(0)).unwrap();
    let mut short = [0xAAu8; 4];
    assert_eq!(fs.read_as_string(&file, &mut short).unwrap(), 3);
    assert_eq!(&short, b"hel\0");
    fs.close(file).unwrap();
}

#[test]
fn corrupted_image_is_reformatted_with_the_standard_directories() {
    init_logger();
    let sim = SimFlash::new(FLASH_CAPACITY);
    {
        let mut fs = FlashFs::new(device(&sim));
        fs.mount().unwrap();
        write(&mut fs, "/uploads/old.txt", b"stale");
        fs.mkdir("/extra").unwrap();
    }
    // Both superblock copies
    sim.poke(0, &[0x5A; 64]);
    sim.poke(4096, &[0xA5; 64]);

    let mut fs = FlashFs::new(device(&sim));
    fs.mount().unwrap();
    assert_eq!(
        tree(&mut fs),
        vec![
            (0, "uploads".to_string(), FileKind::Dir),
            (0, "www".to_string(), FileKind::Dir),
        ]
    );
}

#[test]
fn contents_survive_a_remount() {
    init_logger();
    let sim = SimFlash::new(FLASH_CAPACITY);
    let big: Vec<u8> = (0..20_000u32).map(|i| (i % 97) as u8).collect();
    {
        let mut fs = FlashFs::new(device(&sim));
        fs.mount().unwrap();
        write(&mut fs, "/www/index.html", b"<h1>alarm</h1>");
        write(&mut fs, "/uploads/tune.wav", &big);
        let empty = fs
            .open("/uploads/new.bin", OpenFlags::WRITE | OpenFlags::CREATE)
            .unwrap();
        fs.close(empty).unwrap();
    }

    let mut fs = FlashFs::new(device(&sim));
    fs.mount().unwrap();
    let seen = tree(&mut fs);
    assert!(seen.contains(&(1, "new.bin".to_string(), FileKind::File)));
    assert!(seen.contains(&(1, "index.html".to_string(), FileKind::File)));
    assert_eq!(fs.stat("/www/index.html").unwrap().size, 14);

    let file = fs.open("/uploads/tune.wav", OpenFlags::READ).unwrap();
    let mut back = vec![0u8; big.len()];
    let mut got = 0;
    while got < back.len() {
        let n = fs.read(&file, &mut back[got..]).unwrap();
        assert!(n > 0);
        got += n;
    }
    fs.close(file).unwrap();
    assert_eq!(back, big);
}

#[test]
fn corrupt_directory_costs_the_whole_volume() {
    init_logger();
    let sim = SimFlash::new(FLASH_CAPACITY);
    let mut fs = FlashFs::new(device(&sim));
    fs.mount().unwrap();
    write(&mut fs, "/uploads/victim.txt", b"marker-payload");
    write(&mut fs, "/www/bystander.txt", b"innocent");

    // Break the first commit of every block holding the inlined file
    let mut hits = 0;
    while let Some(at) = sim.find(b"marker-payload") {
        sim.poke(at / 4096 * 4096 + 4, &[0, 0, 0, 0]);
        sim.poke(at, b"xxxxxxxxxxxxxx");
        hits += 1;
    }
    assert!(hits > 0);

    let file = fs
        .open("/uploads/victim.txt", OpenFlags::READ | OpenFlags::CREATE)
        .unwrap();
    assert!(file.after_reformat());
    assert_eq!(fs.size(&file).unwrap(), 0);
    fs.close(file).unwrap();
    assert!(!fs.exists("/www/bystander.txt"));
    assert!(fs.exists("/www"));
}

#[test]
fn dead_chip_is_reported_unavailable() {
    init_logger();
    let sim = SimFlash::new(FLASH_CAPACITY);
    let mut fs = FlashFs::new(device(&sim));
    sim.set_stuck_busy(true);
    assert!(matches!(fs.mount(), Err(StorageError::Unavailable(_))));
    assert!(!fs.is_mounted());
    assert_eq!(fs.mkdir("/x"), Err(StorageError::NotMounted));
}
