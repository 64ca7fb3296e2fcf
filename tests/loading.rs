mod common;

use common::*;
use rstest::rstest;
use rtld::{Linker, Loader, PAGE_SIZE, SearchConfig, mmap::MmapImpl, object::ElfBinary};

#[rstest]
fn maps_file_bytes_and_zeroes_bss() {
    init_log();
    let payload: Vec<u8> = (0..64u8).map(|i| i + 1).collect();
    let mut builder = DylibBuilder::new();
    builder.data(&payload).bss(PAGE_SIZE + 0x100);
    let image = builder.build();

    let loaded = Loader::<MmapImpl>::new()
        .load(ElfBinary::new("libmap.so", &image))
        .unwrap();
    let base = loaded.base();
    assert!(base != 0);

    // Every mapped byte of the file-backed range equals the file byte.
    for (off, byte) in image.iter().enumerate() {
        assert_eq!(unsafe { *((base + off) as *const u8) }, *byte, "offset {off:#x}");
    }
    // Everything past the file image up to memsz is zero.
    for off in FILE_SIZE..FILE_SIZE + PAGE_SIZE + 0x100 {
        assert_eq!(unsafe { *((base + off) as *const u8) }, 0, "bss offset {off:#x}");
    }
}

#[rstest]
fn load_library_is_idempotent() {
    init_log();
    let dir = scratch_dir("idempotent");
    let path = write_image(&DylibBuilder::new().build(), &dir, "liba.so");

    let mut linker = Linker::<MmapImpl>::new(SearchConfig::new());
    let first = linker.load_library(&path).unwrap();
    let second = linker.load_library(&path).unwrap();
    assert_eq!(first, second);
    assert_eq!(linker.objects().len(), 1);
}

#[rstest]
fn search_prefers_configured_directories() {
    init_log();
    let dir = scratch_dir("search");
    write_image(&DylibBuilder::new().build(), &dir, "libsearch.so");

    let mut config = SearchConfig::new();
    config.set_library_path(dir.to_str().unwrap());
    let mut linker = Linker::<MmapImpl>::new(config);
    let idx = linker.load_library("libsearch.so").unwrap();
    assert!(linker.objects()[idx].name().contains("libsearch.so"));

    // Without the configured directory the bare name cannot be found.
    let mut unconfigured = Linker::<MmapImpl>::new(SearchConfig::new());
    assert!(unconfigured.load_library("libsearch.so").is_err());
}

#[rstest]
fn dependencies_load_in_discovery_order() {
    init_log();
    let dir = scratch_dir("deps");
    write_image(&DylibBuilder::new().build(), &dir, "libx.so");
    write_image(&DylibBuilder::new().build(), &dir, "liby.so");
    let mut builder = DylibBuilder::new();
    builder.needed("libx.so").needed("liby.so");
    let path = write_image(&builder.build(), &dir, "libroot.so");

    let mut config = SearchConfig::new();
    config.set_library_path(dir.to_str().unwrap());
    let mut linker = Linker::<MmapImpl>::new(config);
    let root = linker.load_library(&path).unwrap();
    assert_eq!(root, 0);
    let names: Vec<&str> = linker.objects().iter().map(|obj| obj.name()).collect();
    assert_eq!(names.len(), 3);
    assert!(names[1].contains("libx.so"));
    assert!(names[2].contains("liby.so"));
    assert_eq!(linker.objects()[root].needed_libs(), ["libx.so", "liby.so"]);
}

#[rstest]
fn dlopen_returns_the_existing_handle() {
    init_log();
    let dir = scratch_dir("dlopen");
    let path = write_image(&DylibBuilder::new().build(), &dir, "liba.so");

    let mut linker = Linker::<MmapImpl>::new(SearchConfig::new());
    let idx = linker.load_library(&path).unwrap();
    let handle = linker.dlopen(&path).unwrap();
    assert_eq!(
        handle.as_ptr() as *const rtld::LoadedObject,
        &linker.objects()[idx] as *const rtld::LoadedObject
    );
    assert!(linker.dlerror().is_none());
}

#[rstest]
fn dlopen_failure_sets_dlerror() {
    init_log();
    let mut linker = Linker::<MmapImpl>::new(SearchConfig::new());
    assert!(linker.dlopen("libdoesnotexist.so").is_none());
    assert!(linker.dlerror().is_some());
    // The diagnostic is cleared once taken.
    assert!(linker.dlerror().is_none());
}
