//! Entry orchestration: disks to config to protocol.
//!
//! The firmware stub hands over a [`Services`] bundle; everything after
//! that is firmware-agnostic. The sequence is fixed: enumerate disks and
//! probe their filesystems, find and parse `hyper.cfg`, pick a loadable
//! entry, then hand control to the selected boot protocol.

use alloc::string::String;
use alloc::vec;

use crate::config::{Config, LoadableEntry, ValueType};
use crate::disk::BlockCache;
use crate::errors::BootError;
use crate::fs::table::FsTable;
use crate::fs::{partitions, path};
use crate::mem::MemoryType;
use crate::oops;
use crate::proto::{self, ultra};
use crate::services::Services;

/// Canonical config locations, searched in filesystem-table order.
pub const CONFIG_PATHS: &[&str] = &["/hyper.cfg", "/boot/hyper.cfg", "/boot/hyper/hyper.cfg"];

/// Probes every firmware-visible disk for partition tables and
/// filesystems.
pub fn init_all_disks(services: &Services) -> FsTable {
    let mut table = FsTable::new();
    let io = &services.disk;

    for index in 0..io.disk_count() {
        let Some(disk) = io.disk(index) else {
            continue;
        };

        // One page worth of probe cache per disk, whatever its sector size.
        let mut bc = BlockCache::new(
            io.clone(),
            disk.handle,
            disk.block_shift,
            (4096usize >> disk.block_shift).max(1),
        );

        partitions::detect_all(io, &mut table, &disk, &mut bc);
    }

    table
}

/// Searches every discovered filesystem for a config file. Returns the
/// fs-table index it was found on and the open file.
fn find_config_file(table: &FsTable) -> Option<(usize, crate::fs::File)> {
    for (index, entry) in table.entries().iter().enumerate() {
        for candidate in CONFIG_PATHS {
            if let Some(file) = path::open(&*entry.fs, candidate) {
                return Some((index, file));
            }
        }
    }

    None
}

fn pick_loadable_entry<'src>(cfg: &Config<'src>) -> Result<LoadableEntry<'src>, BootError> {
    let default_entry = cfg.get_global("default-entry", ValueType::STRING, true)?;

    let Some(wanted) = default_entry else {
        let Some(first) = cfg.first_loadable_entry() else {
            oops!("configuration file must contain at least one loadable entry");
        };

        return Ok(first);
    };

    let name = wanted.as_str().unwrap();

    let Some(entry) = cfg.get_loadable_entry(name) else {
        oops!("no loadable entry \"{name}\"");
    };

    Ok(entry)
}

/// Everything up to (but not including) the jump. Separated from
/// [`boot`] so it stays exercisable without giving up the machine.
pub fn run(services: &mut Services) -> Result<ultra::Prepared, BootError> {
    services
        .memory
        .set_default_alloc_type(MemoryType::LOADER_RECLAIMABLE);

    let mut fs_table = init_all_disks(services);

    let Some((origin_index, mut cfg_file)) = find_config_file(&fs_table) else {
        oops!("couldn't find hyper.cfg anywhere on disk!");
    };

    fs_table.set_origin(origin_index);

    let mut raw = vec![0u8; cfg_file.size() as usize];
    if cfg_file.read(&mut raw, 0).is_err() {
        oops!("failed to read config file");
    }

    let Ok(text) = String::from_utf8(raw) else {
        oops!("config file is not valid text");
    };

    let cfg = match Config::parse(&text) {
        Ok(cfg) => cfg,
        Err(err) => {
            let pretty = err.pretty_print(&text);
            log::error!(target: "config", "{pretty}");
            oops!("{pretty}");
        }
    };

    let entry = pick_loadable_entry(&cfg)?;

    let protocol = cfg
        .entry_child(&entry, "protocol", ValueType::STRING, true)?
        .map(|v| v.as_str().unwrap())
        .unwrap_or("ultra");

    if !proto::is_known_protocol(protocol) {
        oops!("unknown boot protocol \"{protocol}\"");
    }

    log::info!(target: "loader", "booting entry \"{}\" via {protocol}", entry.name);

    ultra::prepare(services, &fs_table, &cfg, &entry)
}

/// The whole thing: on success this never returns.
#[cfg(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"))]
pub fn boot(services: &mut Services) -> Result<core::convert::Infallible, BootError> {
    let prepared = run(services)?;

    // SAFETY: `prepared` was built for this machine by `run`.
    unsafe { ultra::execute(&prepared) }
}
