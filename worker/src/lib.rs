use cfg_if::cfg_if;

pub mod config;
pub mod files;
pub mod parser;
pub mod queue;
pub mod restful;
pub mod runner;
pub mod status;
pub mod worker;

cfg_if! {
    if #[cfg(feature = "build-version")] {
        include!(concat!(env!("OUT_DIR"), "/version.rs"));
    } else {
        pub const VERSION: &str = "unknown";
        pub const USER_AGENT: &str = "gpu-worker/unknown";
    }
}
