//! Sandboxed object area for intermediate trees and commits.
//!
//! All objects a run produces go into an in-memory mempack backend attached
//! to the repository ODB. Nothing touches the on-disk object store until
//! `finalize`, which dumps the mempack as a single pack into the primary
//! store. Dropping the sandbox without finalizing discards every
//! intermediate object, so an aborted run leaves no trace.

use std::io::Write;

use crate::errors::{Error, Result};

pub struct Sandbox<'odb> {
    mempack: git2::Mempack<'odb>,
}

impl<'odb> Sandbox<'odb> {
    /// Attach the sandbox to the repository ODB. The priority outranks the
    /// loose/pack backends so every new object lands in the mempack.
    pub fn attach(odb: &'odb git2::Odb) -> Result<Sandbox<'odb>> {
        let mempack = odb.add_new_mempack_backend(1000)?;
        Ok(Sandbox { mempack })
    }

    /// Promote the sandboxed objects into the primary object store.
    pub fn finalize(&self, repo: &git2::Repository, odb: &git2::Odb) -> Result<()> {
        let mut buf = git2::Buf::new();
        self.mempack.dump(repo, &mut buf)?;
        let mut writer = odb.packwriter()?;
        writer.write_all(&buf)?;
        writer.commit()?;
        Ok(())
    }

    /// Drop all sandboxed objects.
    pub fn discard(&self) -> Result<()> {
        self.mempack.reset()?;
        Ok(())
    }
}

/// Compare-and-swap update of a ref. Fails with `RefConflict` when the ref
/// no longer points at `expected_old`, which callers surface as exit code 5.
pub fn cas_update_ref(
    repo: &git2::Repository,
    name: &str,
    expected_old: git2::Oid,
    new: git2::Oid,
    log_message: &str,
) -> Result<()> {
    match repo.reference_matching(name, new, true, expected_old, log_message) {
        Ok(_) => Ok(()),
        Err(e) if e.code() == git2::ErrorCode::Modified => {
            Err(Error::RefConflict(name.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}
