//! Defines snapshots of a handler's build output, used to notice that
//! a long-lived worker is running stale code.

use anyhow::Result;
use base64ct::{Base64, Encoding};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs::{metadata, File};
use std::io::copy;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Folders never considered part of a build output.
const IGNORED_DIRS: [&str; 2] = ["node_modules", ".git"];

/// Visit files within `dir`, skipping dependency folders.
fn visit_files<F>(dir: &Path, cb: &mut F) -> Result<()>
where
    F: FnMut(PathBuf) -> Result<()>,
{
    if dir.is_dir() {
        for entry in dir.read_dir()? {
            let path = entry?.path();
            if path.is_dir() {
                let ignored = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| IGNORED_DIRS.contains(&name))
                    .unwrap_or(false);
                if !ignored {
                    visit_files(&path, cb)?;
                }
            } else {
                cb(path)?;
            }
        }
    }
    Ok(())
}

/// Produce a hash for the given path.
fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    copy(&mut file, &mut hasher)?;
    Ok(Base64::encode_string(&hasher.finalize()))
}

/// Size and modification time of a file. Files whose stamp didn't
/// change aren't hashed again.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Stamp {
    len: u64,
    modified: Option<SystemTime>,
}

impl Stamp {
    fn of(path: &Path) -> Result<Self> {
        let meta = metadata(path)?;
        Ok(Stamp {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Signature {
    stamp: Stamp,
    hash: String,
}

/// The content signatures of every file under a folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    dir: PathBuf,
    signatures: BTreeMap<PathBuf, Signature>,
}

impl Snapshot {
    /// Take a snapshot of the given folder. A missing folder yields an
    /// empty snapshot.
    pub fn take(dir: &Path) -> Result<Self> {
        let mut signatures = BTreeMap::new();
        visit_files(dir, &mut |path| {
            let stamp = Stamp::of(&path)?;
            let hash = hash_file(&path)?;
            signatures.insert(path, Signature { stamp, hash });
            Ok(())
        })?;
        Ok(Snapshot {
            dir: dir.to_path_buf(),
            signatures,
        })
    }

    /// Lists files added, modified or removed since the snapshot was
    /// taken. Contents are only compared for files whose size or
    /// modification time changed.
    pub fn differences(&self) -> Result<Vec<PathBuf>> {
        let mut differences = Vec::new();
        let mut seen = 0;
        visit_files(&self.dir, &mut |path| {
            match self.signatures.get(&path) {
                Some(signature) => {
                    seen += 1;
                    if Stamp::of(&path)? != signature.stamp
                        && hash_file(&path)? != signature.hash
                    {
                        differences.push(path);
                    }
                }
                None => differences.push(path),
            }
            Ok(())
        })?;
        if seen < self.signatures.len() {
            differences.extend(
                self.signatures
                    .keys()
                    .filter(|path| !path.exists())
                    .cloned(),
            );
        }
        Ok(differences)
    }
}
