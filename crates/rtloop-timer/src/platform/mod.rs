//! OS scheduling backends for the dispatcher bootstrap.

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::LinuxBackend;
