use metro_vfs::{
    error::Result, Codec, Container, ContainerKind, FileSystem, VfiWriter, VfiWriterOptions,
    VfxArchive, VfxWriter, VfxWriterOptions,
};
use pretty_assertions::{assert_eq, assert_str_eq};
use tempfile::tempdir;
use tracing_test::traced_test;

/// Data that compresses, but not into a single block of either codec
fn large_payload() -> Vec<u8> {
    (0..600 * 1024u32)
        .map(|i| ((i / 3) ^ (i >> 11)) as u8)
        .collect()
}

#[test]
fn vfi_packages_split_the_content() -> Result<()> {
    let game = tempdir()?;
    let mut writer = VfiWriter::new(VfiWriterOptions::default());
    let first = writer.add_package("content.vfi0");
    let second = writer.add_package("content.vfi1");
    writer.add_file(first, "content\\levels\\l01\\level", &large_payload())?;
    writer.add_file(first, "content\\levels\\l01\\level.bin", b"bin")?;
    writer.add_file(second, "content\\sounds\\ambient.ogg", &[0x4F; 2048])?;
    let registry = writer.finish(game.path())?;

    let container = Container::open(&registry)?;
    assert_eq!(container.kind(), ContainerKind::Vfi);
    assert_eq!(container.codec(), Codec::Legacy);
    assert_eq!(container.packages().len(), 2);
    assert_eq!(container.file_count(), 3);

    let mut fs = FileSystem::new();
    assert_eq!(fs.mount_game_folder(game.path())?, 1);
    assert_eq!(fs.open_file_from_path("content/levels/l01/level").as_slice(), large_payload());
    assert_eq!(fs.open_file_from_path("content\\sounds\\ambient.ogg").len(), 2048);

    let level = fs.find_folder("content\\levels\\l01");
    assert!(level.is_some_and(|folder| fs.count_files(folder, false) == 2));
    let ogg = fs.find_file("content\\sounds\\ambient.ogg");
    assert_eq!(ogg.and_then(|h| fs.source(h)).map(|s| s.location.package), Some(1));
    Ok(())
}

#[test]
fn lz4_payloads_span_blocks() -> Result<()> {
    let game = tempdir()?;
    let mut writer = VfxWriter::new(VfxWriterOptions::default());
    writer.add_file("meshes\\big.mesh", &large_payload(), true)?;
    writer.add_file("meshes\\stored.mesh", &large_payload(), false)?;
    let registry = writer.finish(game.path())?;

    let archive = VfxArchive::open(&registry)?;
    assert_eq!(archive.codec(), Codec::Lz4);

    let packed = archive
        .find("meshes\\big.mesh")
        .and_then(|index| archive.record(index))
        .and_then(|record| record.location().copied());
    let stored = archive
        .find("meshes\\stored.mesh")
        .and_then(|index| archive.record(index))
        .and_then(|record| record.location().copied());
    assert!(packed.is_some_and(|l| l.compressed < l.uncompressed));
    assert!(stored.is_some_and(|l| l.compressed == l.uncompressed));

    for location in packed.iter().chain(stored.iter()) {
        assert_eq!(archive.extract(location)?, large_payload());
    }
    Ok(())
}

#[traced_test]
#[test]
fn duplicates_are_written_after_the_tree() -> Result<()> {
    let game = tempdir()?;
    let mut writer = VfxWriter::new(VfxWriterOptions::default());
    writer.add_file("ui\\font.bin", b"first copy", false)?;
    writer.add_duplicate("ui\\font.bin", b"second copy", false)?;
    writer.add_duplicate("ui\\font.bin", b"third copy", true)?;
    assert!(writer.add_duplicate("ui\\missing.bin", b"x", false).is_err());
    let registry = writer.finish(game.path())?;
    assert!(logs_contain("wrote registry"));

    let archive = VfxArchive::open(&registry)?;
    assert_eq!(archive.duplicates().len(), 2);
    assert_eq!(archive.file_count(), 1);

    let font = archive.find("ui\\font.bin").unwrap_or_default();
    let copies = archive
        .duplicate_chain(font)
        .map(|duplicate| archive.extract(&duplicate.location))
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(copies.len(), 2);
    assert!(copies.contains(&b"second copy".to_vec()));
    assert!(copies.contains(&b"third copy".to_vec()));

    let container = Container::Vfx(archive);
    assert_eq!(container.duplicate_locations(font).len(), 2);
    assert_str_eq!(container.name(font), "font.bin");
    Ok(())
}
