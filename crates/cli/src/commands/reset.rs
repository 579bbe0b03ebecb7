//! Reset state cached by the resource manager

use resmgr_lib::relay::is_listening_socket;
use resmgr_lib::resmgr::{reset_cached_config, reset_cached_policy};
use resmgr_lib::ResmgrOptions;
use std::path::PathBuf;

use crate::output::{print_error, print_success};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ResetTarget {
    /// The cached active policy and its state
    Policy,
    /// The cached configuration
    Config,
}

fn options(relay_socket: PathBuf, cache_dir: PathBuf) -> ResmgrOptions {
    let mut options = ResmgrOptions::for_node("", relay_socket, PathBuf::new());
    options.cache_dir = cache_dir;
    options
}

/// Reset the cached `target`, returning the process exit code
pub async fn reset(target: ResetTarget, relay_socket: PathBuf, cache_dir: PathBuf) -> i32 {
    if is_listening_socket(&relay_socket).await {
        print_error(&format!(
            "resource manager is running at {}, stop it first",
            relay_socket.display()
        ));
        return 1;
    }

    let options = options(relay_socket, cache_dir);
    let (what, code) = match target {
        ResetTarget::Policy => ("active policy", reset_cached_policy(&options).await),
        ResetTarget::Config => ("configuration", reset_cached_config(&options).await),
    };

    if code == 0 {
        print_success(&format!(
            "Cached {} reset in {}",
            what,
            options.cache_dir.display()
        ));
    } else {
        print_error(&format!("Failed to reset cached {}", what));
    }
    code
}
