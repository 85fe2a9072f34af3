use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Request-local cookie file built from client-uploaded material.
///
/// The file lives exactly as long as this value: dropping it (including when
/// the owning request future is cancelled) removes it from disk.
#[derive(Debug)]
pub struct CredentialScope {
    file: NamedTempFile,
}

impl CredentialScope {
    /// Writes `material` to a fresh private temp file.
    pub fn open(material: &[u8]) -> io::Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("grabby-relay-cookies-")
            .suffix(".txt")
            .tempfile()?;
        file.write_all(material)?;
        file.flush()?;

        debug!("Opened credential scope at {}", file.path().display());
        Ok(Self { file })
    }

    /// Opens a scope only when the caller actually sent material. No material,
    /// or an empty upload, means the public-content flow and no file at all.
    pub fn open_optional(material: Option<&[u8]>) -> io::Result<Option<Self>> {
        match material {
            Some(bytes) if !bytes.is_empty() => Self::open(bytes).map(Some),
            _ => Ok(None),
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Deletes the file now, reporting a failure instead of swallowing it
    /// the way `Drop` has to.
    pub fn close(self) -> io::Result<()> {
        let path = self.file.path().to_path_buf();
        match self.file.close() {
            Ok(()) => {
                debug!("Closed credential scope at {}", path.display());
                Ok(())
            }
            Err(e) => {
                warn!("Failed to delete credential file {}: {}", path.display(), e);
                Err(e)
            }
        }
    }
}

/// Path of an optional scope, for threading into probe options.
pub fn scope_path(scope: Option<&CredentialScope>) -> Option<&Path> {
    scope.map(CredentialScope::path)
}
