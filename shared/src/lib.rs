pub mod errors;
pub mod interaction;
pub mod log;
pub mod types;
pub mod utils;

/// local wall-clock time, as shown in the status message
pub fn local_time() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
