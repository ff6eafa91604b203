use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::PythiaError;

/// Address of a Pythia endpoint.
///
/// A description starting with `unix:` denotes a Unix stream socket at the
/// given path; anything else is a TCP `host:port` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    Tcp(String),
    Unix(PathBuf),
}

impl FromStr for Addr {
    type Err = PythiaError;

    fn from_str(description: &str) -> Result<Self, Self::Err> {
        if let Some(path) = description.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(PythiaError::InvalidAddress(description.to_string()));
            }
            Ok(Addr::Unix(PathBuf::from(path)))
        } else {
            // A TCP address needs at least a host:port split.
            match description.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                    Ok(Addr::Tcp(description.to_string()))
                }
                _ => Err(PythiaError::InvalidAddress(description.to_string())),
            }
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Tcp(addr) => write!(f, "{}", addr),
            Addr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl Addr {
    /// A random Unix socket address in the system temporary directory,
    /// usable for tests and local setups.
    pub fn local() -> std::io::Result<Addr> {
        let dir = std::env::temp_dir();
        let file = tempfile::Builder::new()
            .prefix("pythia.sock-")
            .tempfile_in(&dir)?;
        let path = file.path().to_path_buf();
        // Only the unique name is needed; the socket is bound later.
        file.close()?;
        Ok(Addr::Unix(path))
    }
}
