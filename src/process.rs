//! Process-level helpers for the supervisor and its workers.

use std::{ffi::CString, fmt};

use crate::error::{NetworkError, Result};

/// Host operating system family, as far as process management cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Linux,
    MacOs,
    FreeBsd,
    Other,
}

impl Os {
    pub fn current() -> Self {
        if cfg!(any(target_os = "linux", target_os = "android")) {
            Os::Linux
        } else if cfg!(target_os = "macos") {
            Os::MacOs
        } else if cfg!(target_os = "freebsd") {
            Os::FreeBsd
        } else {
            Os::Other
        }
    }

    /// Whether the kernel spreads connections across listeners sharing a
    /// port via SO_REUSEPORT.
    pub fn balances_reuse_port(&self) -> bool {
        matches!(self, Os::Linux | Os::FreeBsd)
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Os::Linux => "linux",
            Os::MacOs => "macos",
            Os::FreeBsd => "freebsd",
            Os::Other => "other",
        };
        f.write_str(name)
    }
}

/// Sets the calling process's name as shown by `ps` and `top`. The kernel
/// keeps the first 15 bytes. A no-op where unsupported.
pub fn set_title(title: &str) -> Result<()> {
    let title = CString::new(title)
        .map_err(|_| NetworkError::Configuration(format!("invalid process title {title:?}")))?;

    #[cfg(target_os = "linux")]
    nix::sys::prctl::set_name(&title).map_err(|errno| NetworkError::Io(errno.into()))?;

    #[cfg(not(target_os = "linux"))]
    let _ = title;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_detection() {
        #[cfg(target_os = "linux")]
        assert_eq!(Os::current(), Os::Linux);
        assert!(!Os::current().to_string().is_empty());
    }

    #[test]
    fn test_title_with_nul_is_rejected() {
        assert!(matches!(
            set_title("bad\0title"),
            Err(NetworkError::Configuration(_))
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_set_title() {
        // runs on a test thread, so only that thread is renamed
        set_title("rush-test").unwrap();
        let name = nix::sys::prctl::get_name().unwrap();
        assert_eq!(name.to_str().unwrap(), "rush-test");
    }
}
