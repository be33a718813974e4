// src/constants.rs

//! Defines global constants, enums, and bitflags used throughout the daemon.

use bitflags::bitflags;
use konst::primitive::parse_i32;
use konst::unwrap_ctx;
use log::LevelFilter;
use num_enum::TryFromPrimitive;
use std::time::Duration;

// --- Versioning Constants ---
// These are set at compile time by `build.rs`.

/// The human readable version of the daemon.
pub const VERSION_NAME: &str = env!("LSPD_VERSION_NAME");
/// The monotonically increasing version code of the daemon.
pub const VERSION_CODE: i32 = unwrap_ctx!(parse_i32(env!("LSPD_VERSION_CODE")));
/// The Xposed API level implemented for modules.
pub const XPOSED_API_VERSION: i32 = unwrap_ctx!(parse_i32(env!("XPOSED_API_VERSION")));
/// The implementation name reported to modules.
pub const IMPLEMENTATION_NAME: &str = "LSPosed";

// --- Manager Identity ---

/// Package name of the standalone manager; its installer may fetch the management handle.
pub const MANAGER_PKG_NAME: &str = env!("MANAGER_PKG_NAME");
/// Package that hosts the parasitic manager.
pub const MANAGER_INJECTED_PKG_NAME: &str = env!("MANAGER_INJECTED_PKG_NAME");
/// Assigned uid of [`MANAGER_INJECTED_PKG_NAME`].
pub const MANAGER_INJECTED_UID: u32 =
    unwrap_ctx!(parse_i32(env!("MANAGER_INJECTED_UID"))) as u32;

/// Intent category requesting the parasitic manager.
pub const LAUNCH_MANAGER_CATEGORY: &str = "org.lsposed.manager.LAUNCH_MANAGER";

/// Component of the vendor helper bound while a manager session is alive.
pub const VENDOR_HELPER_COMPONENT: &str =
    "com.miui.securitycore/com.miui.xspace.service.XSpaceService";

// --- Configuration Constants ---

/// The maximum log level for the daemon. Set to `Trace` for debug builds and `Info` for release builds.
#[cfg(debug_assertions)]
pub const MAX_LOG_LEVEL: LevelFilter = LevelFilter::Trace;
#[cfg(not(debug_assertions))]
pub const MAX_LOG_LEVEL: LevelFilter = LevelFilter::Info;

/// Single-line file naming the directory that holds the broker sockets.
pub const DEV_PATH_FILE: &str = "/data/adb/lspd/dev_path";

/// Directory holding the stock `dex2oat32` / `dex2oat64` binaries.
pub const STOCK_DEX2OAT_DIR: &str = "/apex/com.android.art/bin";

/// Label assigned to the broker sockets when they are created.
pub const DEX2OAT_SOCKET_CONTEXT: &str = "u:r:dex2oat:s0";
/// Label assigned to the broker socket files so the compiler may connect.
pub const DEX2OAT_FILE_CONTEXT: &str = "u:object_r:magisk_file:s0";

/// How often the daemon checks that every broker worker is still running.
pub const SUPERVISE_INTERVAL: Duration = Duration::from_secs(5);

// --- Platform Constants ---

/// Uids per Android user.
pub const PER_USER_RANGE: u32 = 100_000;
/// Uid of the platform (`android` package).
pub const SYSTEM_UID: u32 = 1000;
/// Package name the platform calls providers as.
pub const SYSTEM_PACKAGE_NAME: &str = "android";

/// First platform SDK level whose provider `call` takes an attribution source.
pub const SDK_S: i32 = 31;
pub const SDK_R: i32 = 30;
pub const SDK_Q: i32 = 29;

// --- Bridge Constants ---

const fn fourcc(tag: &[u8; 4]) -> u32 {
    ((tag[0] as u32) << 24) | ((tag[1] as u32) << 16) | ((tag[2] as u32) << 8) | tag[3] as u32
}

/// Transaction code carried by every bridge transaction.
pub const BRIDGE_TRANSACTION_CODE: u32 = fourcc(b"_LSP");
/// Interface descriptor of the host service we piggyback on.
pub const BRIDGE_DESCRIPTOR: &str = "android.app.IActivityManager";
/// Registry name of the host service.
pub const BRIDGE_SERVICE_NAME: &str = "activity";

/// Suffix appended to a module package name to form its provider authority.
pub const AUTHORITY_SUFFIX: &str = ".XposedService";
/// Provider method used to hand a module its service handle.
pub const SEND_BINDER: &str = "SendBinder";
/// Bundle key carrying the module handle.
pub const BINDER_EXTRA_KEY: &str = "binder";

/// Interface descriptor of the per-module service object.
pub const MODULE_SERVICE_DESCRIPTOR: &str = "io.github.libxposed.service.IXposedService";

/// Opcodes understood on the bridge transaction.
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, Copy, Clone)]
#[repr(i32)]
pub enum BridgeAction {
    SendServiceHandle = 0,
    SendManagementHandle = 1,
    GetManagementHandle = 2,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct TransactionFlags: u32 {
        /// The caller does not wait for a reply.
        const ONEWAY = 1 << 0;
    }
}
