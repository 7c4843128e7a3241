mod child;
mod dylib;
mod env;
mod error;
mod files;
mod launch;
mod libpath;
mod platform;
mod pump;
mod scratch;
mod status;

pub use child::{
    create_child, create_child_with_pump, filter_platform_args, strip_psn_args, ChildOutcome,
    SignalDisposition, PSN_ARG_PREFIX,
};
pub use dylib::DynLib;
pub use env::{get_env, get_env_string, set_env, unset_env};
pub use error::LaunchError;
pub use files::{copy_file, copy_tree, open_target};
pub use launch::{run, validate_bundle_path, validate_payload, BundleMode, LaunchPlan};
pub use libpath::{
    set_dynamic_library_path, set_environment, strjoin, LIBRARY_PATH_VAR, ORIG_SUFFIX,
    PATH_LIST_SEP,
};
pub use platform::{LaunchPlatform, NativePlatform};
pub use pump::{native_pump, DesktopEvent, EventPump, POLL_INTERVAL};
pub use scratch::{
    cleanup, create_temp_path, get_temp_path, get_temp_path_with, remove_temp_path,
    SCRATCH_PREFIX,
};
pub use status::{ArchiveStatus, OptionLookup, OPT_IGNORE_SIGNALS, OPT_RUNTIME_TMPDIR};

#[cfg(all(target_os = "macos", feature = "windowed"))]
pub use pump::AppleEventPump;
