//! Scratch space for envelope files.

use std::path::{Path, PathBuf};

use tempfile::{Builder, TempDir, TempPath};

/// A private per-session directory, removed with everything in it on drop.
#[derive(Debug)]
pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    /// Create the directory inside `base`, or the system temp dir.
    ///
    /// # Errors
    /// Returns error if the directory cannot be created.
    pub fn new(base: Option<&Path>) -> std::io::Result<Self> {
        let mut builder = Builder::new();
        builder.prefix("octbridge-");
        let dir = match base {
            Some(base) => {
                std::fs::create_dir_all(base)?;
                builder.tempdir_in(base)?
            }
            None => builder.tempdir()?,
        };
        Ok(Self { dir })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Fresh, uniquely named request and response files for one command.
    ///
    /// # Errors
    /// Returns error if the files cannot be created.
    pub fn pair(&self) -> std::io::Result<EnvelopePair> {
        let file = |prefix: &str| -> std::io::Result<TempPath> {
            Ok(Builder::new()
                .prefix(prefix)
                .suffix(".mat")
                .tempfile_in(self.dir.path())?
                .into_temp_path())
        };
        Ok(EnvelopePair {
            request: file("req-")?,
            response: file("resp-")?,
        })
    }
}

/// Request and response envelope files for one command, deleted on drop.
#[derive(Debug)]
pub struct EnvelopePair {
    request: TempPath,
    response: TempPath,
}

impl EnvelopePair {
    #[must_use]
    pub fn request(&self) -> &Path {
        &self.request
    }

    #[must_use]
    pub fn response(&self) -> &Path {
        &self.response
    }

    /// Paths of both files, for checks after the pair is gone.
    #[must_use]
    pub fn paths(&self) -> (PathBuf, PathBuf) {
        (self.request.to_path_buf(), self.response.to_path_buf())
    }
}
