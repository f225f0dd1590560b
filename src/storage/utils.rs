use std::{env, fs, path::Path, path::PathBuf, sync::Arc};

use alloy_primitives::{hex, B256};
use rocksdb::{Options, DB as RocksDB};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::{error::StateError, overlay_db::OverlayDB};

const STATE_DATA_DIR: &str = "merkle-state";

/// Bumped whenever the on-disk layout changes; part of the database path so
/// incompatible layouts never share a directory.
pub const DATABASE_VERSION: u32 = 1;

/// Opening the database below this much free space fails with
/// `NotEnoughAvailableSpace` instead of `DatabaseAlreadyOpen`.
const MIN_AVAILABLE_SPACE: u64 = 1024;

/// What to do when a state database already exists at the target path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithExisting {
    Trust,
    Kill,
}

/// Opens the state database for the given chain.
///
/// The store lives at `<base>/<first 4 bytes of genesis hash>/<version>/state`
/// so states of different chains and incompatible layouts never mix.
/// `WithExisting::Kill` wipes any existing store at that path first.
pub fn open_db(
    base_path: &Path,
    genesis_hash: B256,
    with_existing: WithExisting,
) -> Result<OverlayDB, StateError> {
    let dir = base_path
        .join(hex::encode(&genesis_hash[..4]))
        .join(DATABASE_VERSION.to_string());
    let state_dir = dir.join("state");

    if with_existing == WithExisting::Kill && state_dir.exists() {
        info!(path = %state_dir.display(), "Killing existing state database");
        fs::remove_dir_all(&state_dir)?;
    }

    fs::create_dir_all(&dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&dir, fs::Permissions::from_mode(0o700));
    }

    let mut db_opts = Options::default();
    db_opts.create_if_missing(true);
    db_opts.set_max_open_files(256);

    match RocksDB::open(&db_opts, &state_dir) {
        Ok(db) => {
            debug!(path = %state_dir.display(), "Opened state DB");
            Ok(OverlayDB::new(false, Arc::new(db)))
        }
        Err(err) => {
            if available_space(&dir).is_some_and(|space| space < MIN_AVAILABLE_SPACE) {
                warn!("Not enough available space found on hard drive. Please free some up and then re-run.");
                Err(StateError::NotEnoughAvailableSpace)
            } else {
                warn!(%err, path = %state_dir.display(), "State database appears to be already open by another instance");
                Err(StateError::DatabaseAlreadyOpen(err.to_string()))
            }
        }
    }
}

/// Helper function for opening a plain RocksDB connection.
pub fn setup_rocksdb(path: PathBuf) -> anyhow::Result<RocksDB> {
    let rocksdb_path = path.join("rocksdb");
    debug!(path = %rocksdb_path.display(), "Setting up RocksDB");

    let mut db_opts = Options::default();
    db_opts.create_if_missing(true);
    db_opts.set_max_open_files(256);
    Ok(RocksDB::open(&db_opts, rocksdb_path)?)
}

/// Create a directory on the file system that is deleted once it goes out of
/// scope.
pub fn create_temp_test_dir() -> anyhow::Result<TempDir> {
    let mut os_temp = env::temp_dir();
    os_temp.push(STATE_DATA_DIR);
    debug!("Creating temp dir: {os_temp:?}");
    fs::create_dir_all(&os_temp)?;

    let temp_dir = TempDir::new_in(&os_temp)?;
    Ok(temp_dir)
}

#[cfg(unix)]
fn available_space(path: &Path) -> Option<u64> {
    use std::{ffi::CString, os::unix::ffi::OsStrExt};

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } == 0 {
        Some(stat.f_bavail as u64 * stat.f_frsize as u64)
    } else {
        None
    }
}

#[cfg(not(unix))]
fn available_space(_path: &Path) -> Option<u64> {
    None
}
