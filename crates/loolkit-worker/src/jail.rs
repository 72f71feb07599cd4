//! Jail construction and privilege reduction.
//!
//! The worker materializes a minimal filesystem view by hard-linking two
//! donor trees (a system template and an engine template) under a fresh
//! directory, optionally bind-mounting `/usr` through an external helper,
//! creating the random-device nodes, chrooting in, and surrendering the
//! capabilities that made the construction possible.
//!
//! Every preparation failure is fatal. A partially constructed jail has
//! weaker security properties than a dead worker, and the supervisor
//! replaces dead workers; nothing here tries to limp along.

use std::fs::{self, File};
use std::os::unix::fs::symlink;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use caps::{CapSet, Capability};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{chdir, chroot};
use tracing::{debug, info, trace, warn};

/// Resolver files copied from the host so hostname lookup works inside
/// the jail.
const RESOLVER_FILES: [&str; 4] = [
    "/etc/host.conf",
    "/etc/hosts",
    "/etc/nsswitch.conf",
    "/etc/resolv.conf",
];

/// Capabilities required for construction, dropped after entry.
const CONSTRUCTION_CAPS: [Capability; 3] = [
    Capability::CAP_SYS_CHROOT,
    Capability::CAP_MKNOD,
    Capability::CAP_FOWNER,
];

/// Errors from jail construction or privilege reduction.
#[derive(Debug, thiserror::Error)]
pub enum JailError {
    /// A filesystem operation failed.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// What the builder was doing.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Creating a device node failed.
    #[error("mknod {} failed: {source}", path.display())]
    DeviceNode {
        /// Node path.
        path: PathBuf,
        /// Underlying errno.
        #[source]
        source: nix::Error,
    },

    /// Entering the jail failed.
    #[error("chroot into {} failed: {source}", path.display())]
    Chroot {
        /// Jail path.
        path: PathBuf,
        /// Underlying errno.
        #[source]
        source: nix::Error,
    },

    /// Changing to the jail root failed.
    #[error("chdir to / inside jail failed: {source}")]
    Chdir {
        /// Underlying errno.
        #[source]
        source: nix::Error,
    },

    /// Manipulating the capability sets failed. Exits with its own code
    /// so the supervisor can distinguish it from filesystem trouble.
    #[error("dropping capability {capability} failed: {source}")]
    Capability {
        /// The capability being cleared.
        capability: Capability,
        /// Underlying error.
        #[source]
        source: caps::errors::CapsError,
    },
}

impl JailError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether this is a capability-manipulation failure.
    #[must_use]
    pub fn is_capability(&self) -> bool {
        matches!(self, Self::Capability { .. })
    }
}

/// Which subtrees a donor walk links into the jail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Everything.
    CopyAll,
    /// Engine template: skip wizards, sdk, galleries, and other payload
    /// a rendering worker never reads.
    CopyLo,
    /// System template with `/usr` already bind-mounted: skip `usr`.
    CopyNoUsr,
}

impl LinkMode {
    fn should_descend(self, relative: &Path) -> bool {
        match self {
            Self::CopyAll => true,
            Self::CopyNoUsr => relative != Path::new("usr"),
            Self::CopyLo => !matches!(
                relative.to_str(),
                Some(
                    "program/wizards"
                        | "sdk"
                        | "share/basic"
                        | "share/gallery"
                        | "share/Scripts"
                        | "share/template"
                        | "share/config/wizard"
                )
            ),
        }
    }
}

/// Paths the rest of the worker needs once the jail is entered.
#[derive(Debug, Clone)]
pub struct JailPaths {
    /// Jail root, as seen from outside.
    pub jail: PathBuf,
    /// Engine install directory, as seen from inside the jail.
    pub install_dir: String,
    /// Engine user-profile URL, as seen from inside the jail.
    pub user_profile_url: String,
}

/// Builds and enters the chroot jail.
#[derive(Debug)]
pub struct JailBuilder {
    child_root: PathBuf,
    sys_template: PathBuf,
    lo_template: PathBuf,
    lo_sub_path: String,
    jail_id: String,
}

impl JailBuilder {
    /// Describes a jail under `child_root/<jail_id>` built from the two
    /// donor templates.
    #[must_use]
    pub fn new(
        child_root: impl Into<PathBuf>,
        sys_template: impl Into<PathBuf>,
        lo_template: impl Into<PathBuf>,
        lo_sub_path: impl Into<String>,
        jail_id: impl Into<String>,
    ) -> Self {
        Self {
            child_root: child_root.into(),
            sys_template: sys_template.into(),
            lo_template: lo_template.into(),
            lo_sub_path: lo_sub_path.into(),
            jail_id: jail_id.into(),
        }
    }

    /// The jail root, as seen from outside.
    #[must_use]
    pub fn jail_path(&self) -> PathBuf {
        self.child_root.join(&self.jail_id)
    }

    /// Populates the jail, enters it, and drops construction
    /// capabilities.
    ///
    /// # Errors
    ///
    /// Any failure is returned; the caller is expected to treat every
    /// variant as fatal for the process.
    pub fn build(&self) -> Result<JailPaths, JailError> {
        let jail = self.populate()?;
        self.enter()?;
        Ok(jail)
    }

    /// Materializes the jail filesystem without entering it.
    ///
    /// # Errors
    ///
    /// Returns [`JailError`] on any preparation failure.
    pub fn populate(&self) -> Result<JailPaths, JailError> {
        let jail = self.jail_path();
        info!(jail = %jail.display(), "building jail");
        fs::create_dir_all(&jail)
            .map_err(|err| JailError::io(format!("create jail at {}", jail.display()), err))?;

        // The engine resolves its own installation through the template's
        // absolute path; make that path valid inside the chroot.
        symlink_path_to_jail(&jail, &self.lo_template, &self.lo_sub_path)?;
        // Font paths can surface as realpaths, so match those too.
        if let Ok(resolved) = fs::canonicalize(&self.lo_template) {
            if resolved != self.lo_template {
                symlink_path_to_jail(&jail, &resolved, &self.lo_sub_path)?;
            }
        }

        let jail_lo = jail.join(&self.lo_sub_path);
        fs::create_dir_all(&jail_lo).map_err(|err| {
            JailError::io(
                format!("create engine directory {}", jail_lo.display()),
                err,
            )
        })?;

        let mut sys_mode = LinkMode::CopyAll;
        if std::env::var_os("LOOL_BIND_MOUNT").is_some() && self.bind_mount_usr(&jail)? {
            sys_mode = LinkMode::CopyNoUsr;
        }

        link_or_copy(&self.sys_template, &jail, sys_mode)?;
        link_or_copy(&self.lo_template, &jail_lo, LinkMode::CopyLo)?;
        copy_resolver_files(&jail)?;
        create_device_nodes(&jail)?;
        debug!("initialized jail files");

        Ok(JailPaths {
            jail,
            install_dir: format!("/{}/program", self.lo_sub_path),
            user_profile_url: crate::engine::USER_PROFILE_URL.to_string(),
        })
    }

    /// Chroots into the populated jail and drops the construction
    /// capabilities from the effective and permitted sets, in that order.
    ///
    /// # Errors
    ///
    /// Returns [`JailError::Chroot`], [`JailError::Chdir`], or
    /// [`JailError::Capability`].
    pub fn enter(&self) -> Result<(), JailError> {
        let jail = self.jail_path();
        info!(jail = %jail.display(), "entering chroot");
        chroot(&jail).map_err(|source| JailError::Chroot {
            path: jail.clone(),
            source,
        })?;
        chdir("/").map_err(|source| JailError::Chdir { source })?;

        for capability in CONSTRUCTION_CAPS {
            drop_capability(capability)?;
        }
        debug!("initialized jail nodes, dropped capabilities");
        Ok(())
    }

    /// Attempts the `/usr` bind-mount fast path via the external helper.
    /// Helper failure falls back to linking; only filesystem errors are
    /// fatal.
    fn bind_mount_usr(&self, jail: &Path) -> Result<bool, JailError> {
        let usr_src = self.sys_template.join("usr");
        let usr_dest = jail.join("usr");
        fs::create_dir_all(&usr_dest).map_err(|err| {
            JailError::io(format!("create bind target {}", usr_dest.display()), err)
        })?;
        debug!("initializing jail bind mount");
        match Command::new("loolmount").arg(&usr_src).arg(&usr_dest).status() {
            Ok(status) if status.success() => {
                debug!("initialized jail bind mount");
                Ok(true)
            }
            Ok(status) => {
                warn!(%status, "bind mount helper failed, linking /usr instead");
                Ok(false)
            }
            Err(err) => {
                warn!(error = %err, "bind mount helper unavailable, linking /usr instead");
                Ok(false)
            }
        }
    }
}

/// Creates the symlink that makes the absolute `template` path, when
/// interpreted inside the chroot, resolve to `lo_sub_path` relative to
/// the jail root.
pub fn symlink_path_to_jail(
    jail: &Path,
    template: &Path,
    lo_sub_path: &str,
) -> Result<(), JailError> {
    let relative_source = template.strip_prefix("/").unwrap_or(template);
    let link_path = jail.join(relative_source);
    if let Some(parent) = link_path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            JailError::io(format!("create symlink parent {}", parent.display()), err)
        })?;
    }

    let parents = relative_source
        .components()
        .filter(|component| matches!(component, Component::Normal(_)))
        .count()
        .saturating_sub(1);
    let mut target = String::new();
    for _ in 0..parents {
        target.push_str("../");
    }
    target.push_str(lo_sub_path);

    debug!(
        link = %link_path.display(),
        target,
        "creating jail symlink"
    );
    symlink(&target, &link_path).map_err(|err| {
        JailError::io(
            format!("symlink {} -> {target}", link_path.display()),
            err,
        )
    })
}

/// Hard-links the donor tree at `source` into `dest`, skipping the
/// subtrees excluded by `mode`. Directory timestamps are copied after
/// their contents are placed.
pub fn link_or_copy(source: &Path, dest: &Path, mode: LinkMode) -> Result<(), JailError> {
    trace!(source = %source.display(), dest = %dest.display(), ?mode, "linking donor tree");
    fs::create_dir_all(dest)
        .map_err(|err| JailError::io(format!("create {}", dest.display()), err))?;
    link_tree(source, Path::new(""), dest, mode)
}

fn link_tree(root: &Path, relative: &Path, dest_root: &Path, mode: LinkMode) -> Result<(), JailError> {
    let dir = root.join(relative);
    let entries = fs::read_dir(&dir)
        .map_err(|err| JailError::io(format!("read directory {}", dir.display()), err))?;
    for entry in entries {
        let entry = entry
            .map_err(|err| JailError::io(format!("read directory {}", dir.display()), err))?;
        let rel = relative.join(entry.file_name());
        let src = root.join(&rel);
        let dst = dest_root.join(&rel);
        let file_type = entry
            .file_type()
            .map_err(|err| JailError::io(format!("stat {}", src.display()), err))?;

        // The walk follows symlinks: a symlink to a live directory is
        // descended like a directory, so subtree exclusions apply to it
        // too. Only dangling links stay links.
        let is_dir = if file_type.is_symlink() {
            match fs::metadata(&src) {
                Ok(metadata) => metadata.is_dir(),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
                Err(err) => {
                    return Err(JailError::io(format!("stat {}", src.display()), err));
                }
            }
        } else {
            file_type.is_dir()
        };

        if is_dir {
            if !mode.should_descend(&rel) {
                trace!(path = %rel.display(), "skipping excluded subtree");
                continue;
            }
            fs::create_dir_all(&dst)
                .map_err(|err| JailError::io(format!("create {}", dst.display()), err))?;
            link_tree(root, &rel, dest_root, mode)?;
            copy_directory_times(&src, &dst)?;
        } else {
            // Regular files, file links, and dangling links share the
            // donor inode; the jail never mutates them.
            fs::hard_link(&src, &dst).map_err(|err| {
                JailError::io(
                    format!("link {} to {}", src.display(), dst.display()),
                    err,
                )
            })?;
        }
    }
    Ok(())
}

fn copy_directory_times(src: &Path, dst: &Path) -> Result<(), JailError> {
    let metadata = fs::metadata(src)
        .map_err(|err| JailError::io(format!("stat {}", src.display()), err))?;
    let (Ok(accessed), Ok(modified)) = (metadata.accessed(), metadata.modified()) else {
        return Ok(());
    };
    let times = fs::FileTimes::new()
        .set_accessed(accessed)
        .set_modified(modified);
    File::open(dst)
        .and_then(|dir| dir.set_times(times))
        .map_err(|err| JailError::io(format!("set times on {}", dst.display()), err))
}

fn copy_resolver_files(jail: &Path) -> Result<(), JailError> {
    for file in RESOLVER_FILES {
        let source = Path::new(file);
        let dest = jail.join(&file[1..]);
        if !source.exists() || dest.exists() {
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| JailError::io(format!("create {}", parent.display()), err))?;
        }
        // A real copy: the host may rewrite these while the jail lives.
        fs::copy(source, &dest)
            .map_err(|err| JailError::io(format!("copy {file} into jail"), err))?;
    }
    Ok(())
}

fn create_device_nodes(jail: &Path) -> Result<(), JailError> {
    let dev = jail.join("dev");
    fs::create_dir_all(&dev)
        .map_err(|err| JailError::io(format!("create {}", dev.display()), err))?;
    for (name, minor) in [("random", 8u64), ("urandom", 9u64)] {
        let path = dev.join(name);
        mknod(
            &path,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o666),
            makedev(1, minor),
        )
        .map_err(|source| JailError::DeviceNode {
            path: path.clone(),
            source,
        })?;
    }
    Ok(())
}

/// Clears one capability from the effective set, then the permitted set.
/// The process must still be able to read its own capability sets
/// afterwards, which doubles as verification.
fn drop_capability(capability: Capability) -> Result<(), JailError> {
    for set in [CapSet::Effective, CapSet::Permitted] {
        caps::drop(None, set, capability).map_err(|source| JailError::Capability {
            capability,
            source,
        })?;
    }
    let remaining = caps::read(None, CapSet::Effective).map_err(|source| {
        JailError::Capability { capability, source }
    })?;
    trace!(%capability, ?remaining, "capability cleared");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::MetadataExt;

    use super::*;

    fn write(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_link_farm_shares_inodes() {
        let tmp = tempfile::tempdir().unwrap();
        let donor = tmp.path().join("donor");
        let jail = tmp.path().join("jail");
        write(&donor.join("etc/ld.so.conf"), "include");
        write(&donor.join("lib/libm.so.6"), "elf");

        link_or_copy(&donor, &jail, LinkMode::CopyAll).unwrap();

        for rel in ["etc/ld.so.conf", "lib/libm.so.6"] {
            let src = fs::metadata(donor.join(rel)).unwrap();
            let dst = fs::metadata(jail.join(rel)).unwrap();
            assert_eq!(src.ino(), dst.ino(), "{rel} must share the donor inode");
        }
    }

    #[test]
    fn test_copy_lo_skips_excluded_subtrees() {
        let tmp = tempfile::tempdir().unwrap();
        let donor = tmp.path().join("lo");
        let jail = tmp.path().join("jail/lo");
        write(&donor.join("program/soffice.bin"), "elf");
        write(&donor.join("program/wizards/letter.py"), "py");
        write(&donor.join("share/basic/script.bas"), "bas");
        write(&donor.join("share/registry/main.xcd"), "xml");
        write(&donor.join("sdk/include/sdk.h"), "h");

        link_or_copy(&donor, &jail, LinkMode::CopyLo).unwrap();

        assert!(jail.join("program/soffice.bin").exists());
        assert!(jail.join("share/registry/main.xcd").exists());
        assert!(!jail.join("program/wizards").exists());
        assert!(!jail.join("share/basic").exists());
        assert!(!jail.join("sdk").exists());
    }

    #[test]
    fn test_copy_no_usr_skips_usr() {
        let tmp = tempfile::tempdir().unwrap();
        let donor = tmp.path().join("sys");
        let jail = tmp.path().join("jail");
        write(&donor.join("usr/bin/true"), "elf");
        write(&donor.join("etc/hosts"), "127.0.0.1 localhost");

        link_or_copy(&donor, &jail, LinkMode::CopyNoUsr).unwrap();

        assert!(!jail.join("usr").exists());
        assert!(jail.join("etc/hosts").exists());
    }

    #[test]
    fn test_symlink_points_back_to_subpath() {
        let tmp = tempfile::tempdir().unwrap();
        let jail = tmp.path().join("jail");
        fs::create_dir_all(&jail).unwrap();

        symlink_path_to_jail(&jail, Path::new("/opt/collab/lo"), "lo").unwrap();

        let link = jail.join("opt/collab/lo");
        let target = fs::read_link(&link).unwrap();
        assert_eq!(target, PathBuf::from("../../lo"));
    }

    #[test]
    fn test_symlink_at_root_depth() {
        let tmp = tempfile::tempdir().unwrap();
        let jail = tmp.path().join("jail");
        fs::create_dir_all(&jail).unwrap();

        symlink_path_to_jail(&jail, Path::new("/lotpl"), "lo").unwrap();
        assert_eq!(fs::read_link(jail.join("lotpl")).unwrap(), PathBuf::from("lo"));
    }

    #[test]
    fn test_symlinked_excluded_subtree_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let donor = tmp.path().join("lo");
        let jail = tmp.path().join("jail/lo");
        // share/basic is a symlink to a live directory elsewhere; the
        // exclusion must apply to it like to a plain directory.
        write(&tmp.path().join("basic-store/script.bas"), "bas");
        fs::create_dir_all(donor.join("share")).unwrap();
        symlink(tmp.path().join("basic-store"), donor.join("share/basic")).unwrap();
        write(&donor.join("share/registry/main.xcd"), "xml");

        link_or_copy(&donor, &jail, LinkMode::CopyLo).unwrap();

        assert!(jail.join("share/registry/main.xcd").exists());
        assert!(fs::symlink_metadata(jail.join("share/basic")).is_err());
    }

    #[test]
    fn test_symlinked_directory_is_walked() {
        let tmp = tempfile::tempdir().unwrap();
        let donor = tmp.path().join("donor");
        let jail = tmp.path().join("jail");
        write(&tmp.path().join("fonts-store/dejavu.ttf"), "ttf");
        fs::create_dir_all(&donor).unwrap();
        symlink(tmp.path().join("fonts-store"), donor.join("fonts")).unwrap();

        link_or_copy(&donor, &jail, LinkMode::CopyAll).unwrap();

        // The link became a real directory with the contents linked in.
        let carried = jail.join("fonts");
        assert!(fs::symlink_metadata(&carried).unwrap().file_type().is_dir());
        let src = fs::metadata(tmp.path().join("fonts-store/dejavu.ttf")).unwrap();
        let dst = fs::metadata(carried.join("dejavu.ttf")).unwrap();
        assert_eq!(src.ino(), dst.ino());
    }

    #[test]
    fn test_dangling_symlink_is_carried() {
        let tmp = tempfile::tempdir().unwrap();
        let donor = tmp.path().join("donor");
        let jail = tmp.path().join("jail");
        fs::create_dir_all(&donor).unwrap();
        symlink("missing-target", donor.join("dangling")).unwrap();

        link_or_copy(&donor, &jail, LinkMode::CopyAll).unwrap();

        let carried = jail.join("dangling");
        assert!(fs::symlink_metadata(&carried).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&carried).unwrap(), PathBuf::from("missing-target"));
    }

    #[test]
    fn test_capability_error_is_distinguished() {
        let err = JailError::Capability {
            capability: Capability::CAP_SYS_CHROOT,
            source: caps::errors::CapsError::from("denied"),
        };
        assert!(err.is_capability());
        assert!(!JailError::Chdir {
            source: nix::Error::EPERM,
        }
        .is_capability());
    }
}
