use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

/// Global flag to control whether to use system-installed decoders from PATH
/// instead of bundled ones beside the executable.
/// Defaults to false (bundled binaries win).
static USE_SYSTEM_DEPS: AtomicBool = AtomicBool::new(false);

/// Set whether to use system dependencies (from PATH) instead of bundled ones.
pub fn set_use_system_deps(use_system: bool) {
    USE_SYSTEM_DEPS.store(use_system, Ordering::Relaxed);
}

/// Check whether to use system dependencies from PATH.
pub fn should_use_system_deps() -> bool {
    USE_SYSTEM_DEPS.load(Ordering::Relaxed)
}

pub fn data_dir() -> PathBuf {
    // On macOS and Linux, use ~/.local/share/spiral/ (XDG standard)
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("spiral")
    }
    #[cfg(windows)]
    {
        // Portable installs keep their data next to the executable
        if let Some(dir) = exe_dir() {
            let portable_data = dir.join("data");
            if portable_data.exists() {
                return portable_data;
            }
        }

        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("spiral")
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Some(dir) = exe_dir() {
            if dir.join("config.toml").exists() {
                return dir;
            }
        }
    }

    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("spiral")
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("spiral")
    }
}

fn exe_dir() -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    current_exe.parent().map(|p| p.to_path_buf())
}

#[cfg(unix)]
fn ffmpeg_binary_names() -> &'static [&'static str] {
    &["ffmpeg"]
}

#[cfg(windows)]
fn ffmpeg_binary_names() -> &'static [&'static str] {
    &["ffmpeg.exe", "ffmpeg"]
}

#[cfg(unix)]
fn mplayer_binary_names() -> &'static [&'static str] {
    &["mplayer"]
}

#[cfg(windows)]
fn mplayer_binary_names() -> &'static [&'static str] {
    &["mplayer.exe", "mplayer"]
}

fn find_beside_exe(names: &[&str]) -> Option<PathBuf> {
    let dir = exe_dir()?;
    for name in names {
        let p = dir.join(name);
        if p.exists() {
            return Some(p);
        }
        let p = dir.join("external").join(name);
        if p.exists() {
            return Some(p);
        }
    }
    None
}

fn find_on_path(names: &[&str]) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        for name in names {
            let p = dir.join(name);
            if p.is_file() {
                return Some(p);
            }
        }
    }
    None
}

fn find_binary(env_override: &str, names: &[&str]) -> Option<PathBuf> {
    if let Ok(p) = std::env::var(env_override) {
        let path = PathBuf::from(p);
        if path.exists() {
            debug!("{} -> {:?}", env_override, path);
            return Some(path);
        }
        warn!("{} points at missing file {:?}, searching", env_override, path);
    }

    if !should_use_system_deps() {
        if let Some(p) = find_beside_exe(names) {
            debug!("using bundled {:?}", p);
            return Some(p);
        }
    }

    find_on_path(names)
}

/// Find the ffmpeg binary used for stream decoding.
///
/// Searches in order:
/// 1. FFMPEG_PATH environment variable
/// 2. Beside current executable (unless use_system_deps is true)
/// 3. PATH
pub fn find_ffmpeg_binary() -> Option<PathBuf> {
    find_binary("FFMPEG_PATH", ffmpeg_binary_names())
}

/// Find the mplayer binary. Same search order as ffmpeg, with MPLAYER_PATH.
pub fn find_mplayer_binary() -> Option<PathBuf> {
    find_binary("MPLAYER_PATH", mplayer_binary_names())
}
