use std::collections::BTreeMap;

use arbor_cache::Cache;
use arbor_treeobj::{Blobref, HashAlgo, TreeObj};
use arbor_types::{
    Cred, KvsError, UserId, LOOKUP_READDIR, LOOKUP_READLINK, LOOKUP_TREEOBJ,
};

use crate::root::RootMgr;

use super::*;

const NS: &str = "primary";

fn cache_insert(cache: &mut Cache, obj: &TreeObj) -> Blobref {
    let (blobref, data) = obj.hash(HashAlgo::Sha1).unwrap();
    cache.set_raw(&blobref, data, 0);
    blobref
}

fn cache_insert_raw(cache: &mut Cache, data: &[u8]) -> Blobref {
    let blobref = HashAlgo::Sha1.hash(data);
    cache.set_raw(&blobref, data.to_vec(), 0);
    blobref
}

fn dir_of(entries: Vec<(&str, TreeObj)>) -> TreeObj {
    TreeObj::Dir(
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect::<BTreeMap<_, _>>(),
    )
}

fn roots_with(ns: &str, owner: u32, rootref: &Blobref) -> RootMgr<()> {
    let mut roots = RootMgr::new(HashAlgo::Sha1, 4096);
    let root = roots.create_root(ns, UserId(owner), 0).unwrap();
    root.setroot(rootref, 0);
    roots
}

/// Root used by most tests:
///
/// ```text
/// root
///   "val"     : val "42"
///   "valref"  : valref [raw "ABCD", raw "EFGH"]
///   "dir"     : dirref -> { "inner": val "x" }
///   "link"    : symlink -> "val"
///   "dirlink" : symlink -> "dir"
/// ```
fn setup(cache: &mut Cache) -> Blobref {
    let raw1 = cache_insert_raw(cache, b"ABCD");
    let raw2 = cache_insert_raw(cache, b"EFGH");
    let dir = dir_of(vec![("inner", TreeObj::val(*b"x"))]);
    let dir_ref = cache_insert(cache, &dir);
    let root = dir_of(vec![
        ("val", TreeObj::val(*b"42")),
        ("valref", TreeObj::ValRef(vec![raw1, raw2])),
        ("dir", TreeObj::dirref(dir_ref)),
        ("link", TreeObj::symlink(None, "val")),
        ("dirlink", TreeObj::symlink(None, "dir")),
    ]);
    cache_insert(cache, &root)
}

fn finished_value(
    cache: &mut Cache,
    roots: &RootMgr<()>,
    key: &str,
    flags: u32,
) -> Result<Option<TreeObj>, KvsError> {
    let mut lh = Lookup::new(NS, None, 0, key, Cred::owner(0), flags, 0);
    match lh.process(cache, roots) {
        LookupResult::Finished => Ok(lh.value().cloned()),
        LookupResult::Error => Err(lh.errnum()),
        other => panic!("unexpected stall {other:?}"),
    }
}

#[test]
fn val_and_nested_lookups() {
    let mut cache = Cache::new();
    let root_ref = setup(&mut cache);
    let roots = roots_with(NS, 0, &root_ref);

    assert_eq!(finished_value(&mut cache, &roots, "val", 0).unwrap(),
               Some(TreeObj::val(*b"42")));
    assert_eq!(finished_value(&mut cache, &roots, "dir.inner", 0).unwrap(),
               Some(TreeObj::val(*b"x")));
    // normalization collapses separators
    assert_eq!(finished_value(&mut cache, &roots, ".dir..inner", 0).unwrap(),
               Some(TreeObj::val(*b"x")));
}

#[test]
fn missing_keys_yield_null_not_error() {
    let mut cache = Cache::new();
    let root_ref = setup(&mut cache);
    let roots = roots_with(NS, 0, &root_ref);

    assert_eq!(finished_value(&mut cache, &roots, "nope", 0).unwrap(), None);
    assert_eq!(finished_value(&mut cache, &roots, "dir.nope", 0).unwrap(), None);
    // walking through a leaf is also a null result
    assert_eq!(finished_value(&mut cache, &roots, "val.deeper", 0).unwrap(), None);
}

#[test]
fn flag_shape_mismatches() {
    let mut cache = Cache::new();
    let root_ref = setup(&mut cache);
    let roots = roots_with(NS, 0, &root_ref);

    assert_eq!(finished_value(&mut cache, &roots, "dir", 0).err(), Some(KvsError::IsDir));
    assert_eq!(finished_value(&mut cache, &roots, "val", LOOKUP_READDIR).err(),
               Some(KvsError::NotDir));
    assert_eq!(finished_value(&mut cache, &roots, "valref", LOOKUP_READDIR).err(),
               Some(KvsError::NotDir));
    assert_eq!(finished_value(&mut cache, &roots, "val", LOOKUP_READLINK).err(),
               Some(KvsError::Invalid));
    assert_eq!(finished_value(&mut cache, &roots, "dir", LOOKUP_READLINK).err(),
               Some(KvsError::Invalid));
}

#[test]
fn readdir_returns_directory_contents() {
    let mut cache = Cache::new();
    let root_ref = setup(&mut cache);
    let roots = roots_with(NS, 0, &root_ref);

    let dir = finished_value(&mut cache, &roots, "dir", LOOKUP_READDIR).unwrap().unwrap();
    assert!(dir.is_dir());
    assert_eq!(dir.entry("inner").unwrap(), Some(&TreeObj::val(*b"x")));

    // trailing separator implies the directory itself
    let dir2 = finished_value(&mut cache, &roots, "dir.", 0).unwrap().unwrap();
    assert_eq!(dir2, dir);
}

#[test]
fn root_lookup_forms() {
    let mut cache = Cache::new();
    let root_ref = setup(&mut cache);
    let roots = roots_with(NS, 0, &root_ref);

    assert_eq!(finished_value(&mut cache, &roots, ".", 0).err(), Some(KvsError::IsDir));
    let root = finished_value(&mut cache, &roots, ".", LOOKUP_READDIR).unwrap().unwrap();
    assert!(root.is_dir());
    let dirent = finished_value(&mut cache, &roots, ".", LOOKUP_TREEOBJ).unwrap().unwrap();
    assert_eq!(dirent, TreeObj::dirref(root_ref));
}

#[test]
fn symlinks_follow_unless_asked_not_to() {
    let mut cache = Cache::new();
    let root_ref = setup(&mut cache);
    let roots = roots_with(NS, 0, &root_ref);

    assert_eq!(finished_value(&mut cache, &roots, "link", 0).unwrap(),
               Some(TreeObj::val(*b"42")));
    assert_eq!(finished_value(&mut cache, &roots, "dirlink.inner", 0).unwrap(),
               Some(TreeObj::val(*b"x")));
    assert_eq!(finished_value(&mut cache, &roots, "link", LOOKUP_READLINK).unwrap(),
               Some(TreeObj::symlink(None, "val")));
    assert_eq!(finished_value(&mut cache, &roots, "link", LOOKUP_TREEOBJ).unwrap(),
               Some(TreeObj::symlink(None, "val")));
    // READLINK through a followed link still errors on the target type
    assert_eq!(finished_value(&mut cache, &roots, "dirlink", LOOKUP_READDIR).unwrap()
                   .unwrap()
                   .is_dir(),
               true);
    assert_eq!(
        finished_value(&mut cache, &roots, "link", LOOKUP_READLINK | LOOKUP_READDIR).err(),
        Some(KvsError::NotDir)
    );
}

#[test]
fn valref_concatenates_in_order() {
    let mut cache = Cache::new();
    let root_ref = setup(&mut cache);
    let roots = roots_with(NS, 0, &root_ref);

    assert_eq!(finished_value(&mut cache, &roots, "valref", 0).unwrap(),
               Some(TreeObj::val(*b"ABCDEFGH")));
}

#[test]
fn valref_stalls_on_missing_raw_blobs() {
    let mut cache = Cache::new();
    let raw_present = cache_insert_raw(&mut cache, b"AB");
    let raw_absent = HashAlgo::Sha1.hash(b"CD");
    let root = dir_of(vec![(
        "v",
        TreeObj::ValRef(vec![raw_present, raw_absent.clone()]),
    )]);
    let root_ref = cache_insert(&mut cache, &root);
    let roots = roots_with(NS, 0, &root_ref);

    let mut lh = Lookup::new(NS, None, 0, "v", Cred::owner(0), 0, 0);
    assert_eq!(lh.process(&mut cache, &roots), LookupResult::LoadMissingRefs);
    // only the still-missing blob is reported
    assert_eq!(lh.missing_refs(&cache), vec![raw_absent.clone()]);
    assert_eq!(lh.errnum(), KvsError::Again);

    cache.set_raw(&raw_absent, b"CD".to_vec(), 0);
    assert_eq!(lh.process(&mut cache, &roots), LookupResult::Finished);
    assert_eq!(lh.value(), Some(&TreeObj::val(*b"ABCD")));
}

#[test]
fn dirref_stall_and_resume() {
    let mut cache = Cache::new();
    let dir = dir_of(vec![("inner", TreeObj::val(*b"x"))]);
    let (dir_ref, dir_data) = dir.hash(HashAlgo::Sha1).unwrap();
    let root = dir_of(vec![("dir", TreeObj::dirref(dir_ref.clone()))]);
    let root_ref = cache_insert(&mut cache, &root);
    let roots = roots_with(NS, 0, &root_ref);

    let mut lh = Lookup::new(NS, None, 0, "dir.inner", Cred::owner(0), 0, 0);
    assert_eq!(lh.process(&mut cache, &roots), LookupResult::LoadMissingRefs);
    assert_eq!(lh.missing_refs(&cache), vec![dir_ref.clone()]);

    cache.set_raw(&dir_ref, dir_data, 0);
    assert_eq!(lh.process(&mut cache, &roots), LookupResult::Finished);
    assert_eq!(lh.value(), Some(&TreeObj::val(*b"x")));
    assert_eq!(lh.root_ref(), Some(&root_ref));
}

#[test]
fn symlink_cycle_limit() {
    let mut cache = Cache::new();
    let root = dir_of(vec![
        ("a", TreeObj::symlink(None, "b")),
        ("b", TreeObj::symlink(None, "a")),
    ]);
    let root_ref = cache_insert(&mut cache, &root);
    let roots = roots_with(NS, 0, &root_ref);

    assert_eq!(finished_value(&mut cache, &roots, "a", 0).err(), Some(KvsError::Loop));
}

#[test]
fn cross_namespace_symlink() {
    let mut cache = Cache::new();
    let b_root = dir_of(vec![("val", TreeObj::val(*b"2"))]);
    let b_root_ref = cache_insert(&mut cache, &b_root);
    let a_root = dir_of(vec![("symlink2B", TreeObj::symlink(Some("B"), "."))]);
    let a_root_ref = cache_insert(&mut cache, &a_root);

    let mut roots: RootMgr<()> = RootMgr::new(HashAlgo::Sha1, 4096);
    roots.create_root("A", UserId(1000), 0).unwrap().setroot(&a_root_ref, 0);
    roots.create_root("B", UserId(1000), 0).unwrap().setroot(&b_root_ref, 0);

    let mut lh = Lookup::new("A", None, 0, "symlink2B.val", Cred::user(1000), 0, 0);
    assert_eq!(lh.process(&mut cache, &roots), LookupResult::Finished);
    assert_eq!(lh.value(), Some(&TreeObj::val(*b"2")));

    // a user that does not own B may not cross into it
    let mut lh = Lookup::new("A", None, 0, "symlink2B.val", Cred::user(1001), 0, 0);
    roots.lookup_mut("A").unwrap().owner = UserId(1001);
    assert_eq!(lh.process(&mut cache, &roots), LookupResult::Error);
    assert_eq!(lh.errnum(), KvsError::Perm);
}

#[test]
fn cross_namespace_symlink_stalls_on_missing_namespace() {
    let mut cache = Cache::new();
    let a_root = dir_of(vec![("link", TreeObj::symlink(Some("B"), "val"))]);
    let a_root_ref = cache_insert(&mut cache, &a_root);
    let mut roots = roots_with("A", 0, &a_root_ref);

    let mut lh = Lookup::new("A", None, 0, "link", Cred::owner(0), 0, 0);
    assert_eq!(lh.process(&mut cache, &roots), LookupResult::LoadMissingNamespace);
    assert_eq!(lh.missing_namespace(), Some("B"));

    let b_root = dir_of(vec![("val", TreeObj::val(*b"7"))]);
    let b_root_ref = cache_insert(&mut cache, &b_root);
    roots.create_root("B", UserId(0), 0).unwrap().setroot(&b_root_ref, 0);

    assert_eq!(lh.process(&mut cache, &roots), LookupResult::Finished);
    assert_eq!(lh.value(), Some(&TreeObj::val(*b"7")));
}

#[test]
fn missing_namespace_stalls_at_creation() {
    let mut cache = Cache::new();
    let roots: RootMgr<()> = RootMgr::new(HashAlgo::Sha1, 4096);
    let mut lh = Lookup::new("ghost", None, 0, "x", Cred::owner(0), 0, 0);
    assert_eq!(lh.process(&mut cache, &roots), LookupResult::LoadMissingNamespace);
    assert_eq!(lh.missing_namespace(), Some("ghost"));
}

#[test]
fn namespace_removed_during_stall() {
    let mut cache = Cache::new();
    let dir = dir_of(vec![("inner", TreeObj::val(*b"x"))]);
    let (dir_ref, _) = dir.hash(HashAlgo::Sha1).unwrap();
    let root = dir_of(vec![("dir", TreeObj::dirref(dir_ref))]);
    let root_ref = cache_insert(&mut cache, &root);
    let mut roots = roots_with(NS, 1000, &root_ref);

    let mut lh = Lookup::new(NS, None, 0, "dir.inner", Cred::user(1000), 0, 0);
    assert_eq!(lh.process(&mut cache, &roots), LookupResult::LoadMissingRefs);

    roots.lookup_mut(NS).unwrap().remove = true;
    assert_eq!(lh.process(&mut cache, &roots), LookupResult::Error);
    assert_eq!(lh.errnum(), KvsError::NotSup);
}

#[test]
fn namespace_recreated_with_new_owner_during_stall() {
    let mut cache = Cache::new();
    let dir = dir_of(vec![("inner", TreeObj::val(*b"x"))]);
    let (dir_ref, _) = dir.hash(HashAlgo::Sha1).unwrap();
    let root = dir_of(vec![("dir", TreeObj::dirref(dir_ref))]);
    let root_ref = cache_insert(&mut cache, &root);
    let mut roots = roots_with(NS, 1000, &root_ref);

    let mut lh = Lookup::new(NS, None, 0, "dir.inner", Cred::user(1000), 0, 0);
    assert_eq!(lh.process(&mut cache, &roots), LookupResult::LoadMissingRefs);

    roots.remove_root(NS);
    let recreated = roots.create_root(NS, UserId(2000), 0).unwrap();
    recreated.setroot(&root_ref, 0);
    assert_eq!(lh.process(&mut cache, &roots), LookupResult::Error);
    assert_eq!(lh.errnum(), KvsError::Perm);
}

#[test]
fn explicit_root_ref_waives_namespace_checks() {
    let mut cache = Cache::new();
    let root_ref = setup(&mut cache);
    // no such namespace registered at all
    let roots: RootMgr<()> = RootMgr::new(HashAlgo::Sha1, 4096);

    let mut lh = Lookup::new("ghost", Some(root_ref.clone()), 7, "val", Cred::user(9), 0, 0);
    assert_eq!(lh.process(&mut cache, &roots), LookupResult::Finished);
    assert_eq!(lh.value(), Some(&TreeObj::val(*b"42")));
    assert_eq!(lh.root_seq(), 7);
}

#[test]
fn user_role_checked_against_namespace_owner() {
    let mut cache = Cache::new();
    let root_ref = setup(&mut cache);
    let roots = roots_with(NS, 1000, &root_ref);

    let mut lh = Lookup::new(NS, None, 0, "val", Cred::user(1001), 0, 0);
    assert_eq!(lh.process(&mut cache, &roots), LookupResult::Error);
    assert_eq!(lh.errnum(), KvsError::Perm);

    let mut lh = Lookup::new(NS, None, 0, "val", Cred::user(1000), 0, 0);
    assert_eq!(lh.process(&mut cache, &roots), LookupResult::Finished);
}

#[test]
fn corrupt_dirref_target_is_unrecoverable() {
    let mut cache = Cache::new();
    // dirref pointing at raw, non-treeobj bytes
    let junk_ref = cache_insert_raw(&mut cache, b"junk bytes");
    let root = dir_of(vec![("dir", TreeObj::dirref(junk_ref))]);
    let root_ref = cache_insert(&mut cache, &root);
    let roots = roots_with(NS, 0, &root_ref);

    assert_eq!(
        finished_value(&mut cache, &roots, "dir.x", 0).err(),
        Some(KvsError::NotRecoverable)
    );
}

#[test]
fn user_supplied_bad_root_is_invalid() {
    let mut cache = Cache::new();
    let junk_ref = cache_insert_raw(&mut cache, b"junk bytes");
    let roots: RootMgr<()> = RootMgr::new(HashAlgo::Sha1, 4096);

    let mut lh = Lookup::new(NS, Some(junk_ref), 0, "a.b", Cred::owner(0), 0, 0);
    assert_eq!(lh.process(&mut cache, &roots), LookupResult::Error);
    assert_eq!(lh.errnum(), KvsError::Invalid);
}
