//! End-to-end pass-through behavior over both lower backends

use stackfs::fs::{ModeClass, MountSession};
use stackfs::lower::{MemFs, OpenFlags};
use stackfs::{Error, MountConfig};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;

fn mount_mem() -> (Arc<MemFs>, Arc<MountSession>) {
    let fs = Arc::new(MemFs::new());
    let session = Arc::new(
        MountSession::mount(fs.clone(), MountConfig::new(PathBuf::from("/"))).unwrap(),
    );
    (fs, session)
}

#[test]
fn lookup_create_link_unlink_scenario() {
    let (fs, session) = mount_mem();
    let root = session.root().clone();

    // lookup in an empty directory: negative entry, no error
    let foo = session.lookup(&root, OsStr::new("foo")).unwrap();
    assert!(foo.is_negative());

    // create on that negative entry turns it positive with a regular inode
    let foo = session.create(&root, OsStr::new("foo"), 0o644).unwrap();
    let foo_inode = foo.inode().unwrap();
    assert_eq!(foo_inode.mode_class(), ModeClass::Regular);

    // hard link: both names report the same inode identity and nlink 2
    let bar = session.link(&foo, &root, OsStr::new("bar")).unwrap();
    let bar_inode = bar.inode().unwrap();
    assert!(Arc::ptr_eq(&foo_inode, &bar_inode));
    assert_eq!(foo_inode.identity(), bar_inode.identity());
    assert_eq!(foo_inode.attrs().nlink, 2);

    // unlink the first name: count drops, entry is dropped from the
    // cache, the second name still resolves positively
    session.unlink(&root, OsStr::new("foo")).unwrap();
    assert_eq!(bar_inode.attrs().nlink, 1);
    assert!(root.cached_child(OsStr::new("foo")).is_none());
    let bar_again = session.lookup(&root, OsStr::new("bar")).unwrap();
    assert!(!bar_again.is_negative());
    assert!(Arc::ptr_eq(&bar_again.inode().unwrap(), &bar_inode));

    // teardown returns every lower reference
    drop((foo, bar, bar_again, foo_inode, bar_inode, root));
    drop(session);
    assert_eq!(fs.sb_active(), 0);
    assert_eq!(fs.outstanding_location_refs(), 0);
    assert_eq!(fs.outstanding_node_refs(), 0);
}

#[test]
fn reference_counts_conserved_across_concurrent_operations() {
    let (fs, session) = mount_mem();

    let mut threads = Vec::new();
    for t in 0..4 {
        let session = session.clone();
        threads.push(std::thread::spawn(move || {
            let root = session.root().clone();
            let dirname = format!("dir{}", t);
            let dir = session.mkdir(&root, OsStr::new(&dirname), 0o755).unwrap();
            for i in 0..16 {
                let name = format!("f{}", i);
                let entry = session.create(&dir, OsStr::new(&name), 0o644).unwrap();
                let file = session
                    .open(&entry, OpenFlags {
                        write: true,
                        ..Default::default()
                    })
                    .unwrap();
                file.write(0, name.as_bytes()).unwrap();
                drop(file);
                if i % 2 == 0 {
                    session.unlink(&dir, OsStr::new(&name)).unwrap();
                } else if i % 3 == 0 {
                    let renamed = format!("r{}", i);
                    session
                        .rename(&dir, OsStr::new(&name), &root, OsStr::new(&renamed))
                        .unwrap();
                }
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }

    // every completed operation balanced its acquisitions: after the
    // session and all cached entries go away, nothing is left pinned
    drop(session);
    assert_eq!(fs.sb_active(), 0);
    assert_eq!(fs.outstanding_location_refs(), 0);
    assert_eq!(fs.outstanding_node_refs(), 0);
}

#[test]
fn concurrent_lookups_of_hard_links_converge_on_one_inode() {
    let (_fs, session) = mount_mem();
    let root = session.root().clone();
    let first = session.create(&root, OsStr::new("name0"), 0o644).unwrap();
    for i in 1..6 {
        let name = format!("name{}", i);
        session.link(&first, &root, OsStr::new(&name)).unwrap();
    }
    // fresh session state for the race: drop all cached entries
    for i in 0..6 {
        root.drop_child(OsStr::new(&format!("name{}", i)));
    }
    drop(first);

    let mut threads = Vec::new();
    for i in 0..6 {
        let session = session.clone();
        threads.push(std::thread::spawn(move || {
            let name = format!("name{}", i);
            let entry = session
                .lookup(session.root(), OsStr::new(&name))
                .unwrap();
            entry.inode().unwrap()
        }));
    }
    let inodes: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    for inode in &inodes[1..] {
        assert!(Arc::ptr_eq(&inodes[0], inode));
    }
}

#[test]
fn positive_entries_never_turn_negative_in_place() {
    let (_fs, session) = mount_mem();
    let root = session.root().clone();
    let entry = session.create(&root, OsStr::new("f"), 0o644).unwrap();
    assert!(!entry.is_negative());

    session.unlink(&root, OsStr::new("f")).unwrap();
    // the removed entry object stays positive; removal destroyed the
    // cache slot instead of flipping the entry back
    assert!(!entry.is_negative());
    let fresh = session.lookup(&root, OsStr::new("f")).unwrap();
    assert!(!Arc::ptr_eq(&fresh, &entry));
    assert!(fresh.is_negative());
}

#[test]
fn rename_cycle_rejection_leaves_trees_unchanged() {
    let (_fs, session) = mount_mem();
    let root = session.root().clone();
    let d = session.mkdir(&root, OsStr::new("d"), 0o755).unwrap();
    let x = session.mkdir(&d, OsStr::new("x"), 0o755).unwrap();

    let err = session
        .rename(&root, OsStr::new("d"), &x, OsStr::new("y"))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    assert!(!session.lookup(&root, OsStr::new("d")).unwrap().is_negative());
    assert!(!session.lookup(&d, OsStr::new("x")).unwrap().is_negative());
    assert!(session.lookup(&x, OsStr::new("y")).unwrap().is_negative());
}

#[test]
fn entry_budget_surfaces_out_of_memory() {
    let fs = Arc::new(MemFs::new());
    let mut config = MountConfig::new(PathBuf::from("/"));
    config.entry_cache_limit = 3; // root + two lookups
    let session = MountSession::mount(fs, config).unwrap();
    let root = session.root().clone();

    session.lookup(&root, OsStr::new("a")).unwrap();
    session.lookup(&root, OsStr::new("b")).unwrap();
    assert!(matches!(
        session.lookup(&root, OsStr::new("c")),
        Err(Error::OutOfMemory)
    ));
}

mod local_backend {
    use super::*;
    use stackfs::lower::LocalFs;
    use tempfile::tempdir;

    #[test]
    fn scenario_on_a_real_directory() {
        let dir = tempdir().unwrap();
        let lower = Arc::new(LocalFs::new(dir.path().to_path_buf()).unwrap());
        let session = Arc::new(
            MountSession::mount(lower, MountConfig::new(dir.path().to_path_buf())).unwrap(),
        );
        let root = session.root().clone();

        let foo = session.lookup(&root, OsStr::new("foo.txt")).unwrap();
        assert!(foo.is_negative());

        let foo = session.create(&root, OsStr::new("foo.txt"), 0o644).unwrap();
        assert!(dir.path().join("foo.txt").is_file());

        let file = session
            .open(&foo, OpenFlags {
                write: true,
                ..Default::default()
            })
            .unwrap();
        file.write(0, b"mirrored").unwrap();
        drop(file);
        assert_eq!(std::fs::read(dir.path().join("foo.txt")).unwrap(), b"mirrored");

        session.link(&foo, &root, OsStr::new("bar.txt")).unwrap();
        assert_eq!(foo.inode().unwrap().attrs().nlink, 2);

        session.unlink(&root, OsStr::new("foo.txt")).unwrap();
        assert!(!dir.path().join("foo.txt").exists());
        assert!(dir.path().join("bar.txt").is_file());
        let bar = session.lookup(&root, OsStr::new("bar.txt")).unwrap();
        assert_eq!(bar.inode().unwrap().attrs().nlink, 1);
    }

    #[test]
    fn directories_and_rename_on_disk() {
        let dir = tempdir().unwrap();
        let lower = Arc::new(LocalFs::new(dir.path().to_path_buf()).unwrap());
        let session = Arc::new(
            MountSession::mount(lower, MountConfig::new(dir.path().to_path_buf())).unwrap(),
        );
        let root = session.root().clone();

        let a = session.mkdir(&root, OsStr::new("a"), 0o755).unwrap();
        session.create(&a, OsStr::new("inner"), 0o644).unwrap();
        session
            .rename(&a, OsStr::new("inner"), &root, OsStr::new("moved"))
            .unwrap();
        assert!(dir.path().join("moved").is_file());
        assert!(!dir.path().join("a/inner").exists());
        assert!(!session.lookup_path("moved").unwrap().is_negative());

        // renaming a directory into its own subtree is caught before the
        // lower rename runs
        let b = session.mkdir(&a, OsStr::new("b"), 0o755).unwrap();
        let err = session
            .rename(&root, OsStr::new("a"), &b, OsStr::new("inside"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(dir.path().join("a/b").is_dir());

        session.rmdir(&a, OsStr::new("b")).unwrap();
        session.rmdir(&root, OsStr::new("a")).unwrap();
        assert!(!dir.path().join("a").exists());
    }

    #[test]
    fn symlinks_round_trip() {
        let dir = tempdir().unwrap();
        let lower = Arc::new(LocalFs::new(dir.path().to_path_buf()).unwrap());
        let session = Arc::new(
            MountSession::mount(lower, MountConfig::new(dir.path().to_path_buf())).unwrap(),
        );
        let root = session.root().clone();

        let ln = session
            .symlink(&root, OsStr::new("ln"), OsStr::new("foo/bar"))
            .unwrap();
        assert_eq!(ln.inode().unwrap().mode_class(), ModeClass::Symlink);
        assert_eq!(session.readlink(&ln).unwrap().to_string_lossy(), "foo/bar");
        assert_eq!(
            std::fs::read_link(dir.path().join("ln")).unwrap(),
            PathBuf::from("foo/bar")
        );
    }
}
