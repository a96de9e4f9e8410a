//! Key lookup.
//!
//! A [`Lookup`] resolves a (namespace, root, key) triple to a value by
//! walking the tree through the content cache. It is a resumable state
//! machine: a pass either finishes, errors, or stalls asking the caller to
//! load a missing namespace or a set of missing refs, after which the same
//! pass is retried. Symlink following is reentrant across stalls: each
//! link pushes a walk level, and finishing a level's path unwinds the
//! resolved dirent back into its parent.
//!
//! On every resumed pass the namespace is re-resolved by name: it may
//! have been removed (`NotSup`) or removed and re-created with another
//! owner (`Perm`) while the lookup slept.

use std::collections::VecDeque;

use tracing::error;

use arbor_cache::Cache;
use arbor_treeobj::{Blobref, TreeObj};
use arbor_types::{
    normalize_key, Cred, KvsError, LOOKUP_READDIR, LOOKUP_READLINK, LOOKUP_TREEOBJ,
    SYMLINK_CYCLE_LIMIT,
};

use crate::root::RootMgr;

/// Result of one [`Lookup::process`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult {
    /// Lookup failed; see [`Lookup::errnum`].
    Error,
    /// Stalled: fetch the namespace named by [`Lookup::missing_namespace`].
    LoadMissingNamespace,
    /// Stalled: load the refs from [`Lookup::missing_refs`] into the cache.
    LoadMissingRefs,
    /// Done. [`Lookup::value`] holds the result (`None` means the key does
    /// not exist; the caller decides whether that is `NotFound`).
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    CheckNamespace,
    CheckRoot,
    WalkInit,
    Walk,
    Value,
    Finished,
}

#[derive(Debug)]
struct WalkLevel {
    pathcomps: VecDeque<String>,
    depth: u32,
    root_ref: Blobref,
    dirent: TreeObj,
}

impl WalkLevel {
    fn new(root_ref: &Blobref, path: &str, depth: u32) -> Self {
        Self {
            pathcomps: path.split('.').map(str::to_string).collect(),
            depth,
            root_ref: root_ref.clone(),
            dirent: TreeObj::dirref(root_ref.clone()),
        }
    }

    fn at_last_comp(&self) -> bool {
        self.pathcomps.len() == 1
    }
}

enum WalkStatus {
    Finished,
    MissingNamespace,
    MissingRef,
}

enum SymlinkStep {
    Resolved,
    Recursed,
    MissingNamespace,
}

//─────────────────────────────
//  Lookup handle
//─────────────────────────────

/// One in-flight lookup.
#[derive(Debug)]
pub struct Lookup {
    ns: String,
    root_ref: Option<Blobref>,
    root_seq: u64,
    root_ref_set_by_user: bool,
    path: String,
    flags: u32,
    cred: Cred,
    epoch: u64,

    levels: Vec<WalkLevel>,
    wdirent: Option<TreeObj>,
    val: Option<TreeObj>,
    missing_ref: Option<Blobref>,
    valref_missing: Option<Vec<Blobref>>,
    missing_namespace: Option<String>,
    errnum: Option<KvsError>,
    aux_errnum: Option<KvsError>,
    state: State,
}

impl Lookup {
    /// Initialize a lookup handle.
    ///
    /// When `root_ref` is given, the namespace is not consulted (and its
    /// security is waived; possession of the ref pre-proves access);
    /// `root_seq` then merely rides along for the caller's convenience.
    pub fn new(
        ns: &str,
        root_ref: Option<Blobref>,
        root_seq: u64,
        key: &str,
        cred: Cred,
        flags: u32,
        epoch: u64,
    ) -> Self {
        let (path, want_directory) = normalize_key(key);
        let flags = if want_directory { flags | LOOKUP_READDIR } else { flags };
        let root_ref_set_by_user = root_ref.is_some();
        Self {
            ns: ns.to_string(),
            root_ref,
            root_seq: if root_ref_set_by_user { root_seq } else { 0 },
            root_ref_set_by_user,
            path,
            flags,
            cred,
            epoch,
            levels: Vec::new(),
            wdirent: None,
            val: None,
            missing_ref: None,
            valref_missing: None,
            missing_namespace: None,
            errnum: None,
            aux_errnum: None,
            state: State::Init,
        }
    }

    /// Namespace the lookup was created for.
    pub fn namespace(&self) -> &str {
        &self.ns
    }

    /// Error after a [`LookupResult::Error`] return; [`KvsError::Again`]
    /// while stalled.
    pub fn errnum(&self) -> KvsError {
        match self.state {
            State::Finished => self.errnum.unwrap_or(KvsError::Invalid),
            State::Init => KvsError::Invalid,
            _ => KvsError::Again,
        }
    }

    /// Error recorded while stalled (e.g. a failed load RPC).
    pub fn aux_errnum(&self) -> Option<KvsError> {
        self.aux_errnum
    }

    /// Record a stall-time error; checked by the caller before resuming.
    pub fn set_aux_errnum(&mut self, errnum: KvsError) {
        if self.aux_errnum.is_none() {
            self.aux_errnum = Some(errnum);
        }
    }

    /// Resulting value once finished without error. `None` means the key
    /// does not exist.
    pub fn value(&self) -> Option<&TreeObj> {
        if self.state == State::Finished && self.errnum.is_none() {
            self.val.as_ref()
        } else {
            None
        }
    }

    /// Root ref the lookup ran against (valid once finished).
    pub fn root_ref(&self) -> Option<&Blobref> {
        if self.state == State::Finished {
            self.root_ref.as_ref()
        } else {
            None
        }
    }

    /// Root seq the lookup ran against (valid once finished; only
    /// meaningful when the root came from the namespace).
    pub fn root_seq(&self) -> u64 {
        self.root_seq
    }

    /// Missing namespace after [`LookupResult::LoadMissingNamespace`].
    pub fn missing_namespace(&self) -> Option<&str> {
        self.missing_namespace.as_deref()
    }

    /// Missing refs after [`LookupResult::LoadMissingRefs`], filtered to
    /// those still absent or invalid in the cache.
    pub fn missing_refs(&self, cache: &Cache) -> Vec<Blobref> {
        if let Some(refs) = &self.valref_missing {
            refs.iter()
                .filter(|r| !cache.is_valid(r))
                .cloned()
                .collect()
        } else {
            self.missing_ref.iter().cloned().collect()
        }
    }

    /// Refresh the epoch on an RPC replay.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    //─────────────────────────────
    //  Processing
    //─────────────────────────────

    /// Drive the lookup forward one pass.
    pub fn process<R>(&mut self, cache: &mut Cache, roots: &RootMgr<R>) -> LookupResult {
        if self.errnum.is_some() {
            return LookupResult::Error;
        }
        let is_replay = self.state != State::Init && self.state != State::Finished;

        if self.state == State::Init {
            self.state = State::CheckNamespace;
        }

        if self.state == State::CheckNamespace {
            if self.root_ref.is_none() {
                let Some(root) = roots.lookup_safe(&self.ns) else {
                    self.missing_namespace = Some(self.ns.clone());
                    return LookupResult::LoadMissingNamespace;
                };
                if let Err(errnum) = root.check_user(self.cred) {
                    return self.fail(errnum);
                }
                // copy rather than borrow: the namespace can be removed or
                // replaced while this lookup is stalled
                self.root_ref = Some(root.rootref.clone());
                self.root_seq = root.seq;
            }
            self.state = State::CheckRoot;
        }

        if self.state == State::CheckRoot {
            if is_replay {
                if let Err(errnum) = self.namespace_still_valid(roots) {
                    return self.fail(errnum);
                }
            }
            let root_ref = self.root_ref.clone().expect("root ref resolved");
            if self.path == "." {
                if self.flags & LOOKUP_TREEOBJ != 0 {
                    self.val = Some(TreeObj::dirref(root_ref));
                    return self.finish();
                }
                if self.flags & LOOKUP_READDIR == 0 {
                    return self.fail(KvsError::IsDir);
                }
                let Some(entry) = cache.lookup(&root_ref, self.epoch).filter(|e| e.is_valid())
                else {
                    self.missing_ref = Some(root_ref);
                    return LookupResult::LoadMissingRefs;
                };
                let val = match entry.treeobj() {
                    None => {
                        error!(ns = %self.ns, "root ref names a non-treeobj");
                        return self.fail(KvsError::Invalid);
                    }
                    Some(obj) if !obj.is_dir() => {
                        return self.fail(KvsError::NotRecoverable);
                    }
                    Some(obj) => obj.clone(),
                };
                self.val = Some(val);
                return self.finish();
            }
            self.state = State::WalkInit;
        }

        if self.state == State::WalkInit {
            let root_ref = self.root_ref.clone().expect("root ref resolved");
            self.levels.push(WalkLevel::new(&root_ref, &self.path, 0));
            self.state = State::Walk;
        }

        if self.state == State::Walk {
            if is_replay {
                if let Err(errnum) = self.namespace_still_valid(roots) {
                    return self.fail(errnum);
                }
            }
            match self.walk(cache, roots) {
                Ok(WalkStatus::MissingNamespace) => return LookupResult::LoadMissingNamespace,
                Ok(WalkStatus::MissingRef) => return LookupResult::LoadMissingRefs,
                Ok(WalkStatus::Finished) => {}
                Err(errnum) => return self.fail(errnum),
            }
            if self.wdirent.is_none() {
                // a null dirent is not necessarily an error; caller decides
                return self.finish();
            }
            self.state = State::Value;
        }

        if self.state == State::Value {
            if is_replay {
                if let Err(errnum) = self.namespace_still_valid(roots) {
                    return self.fail(errnum);
                }
            }
            match self.materialize(cache) {
                Ok(true) => return self.finish(),
                Ok(false) => return LookupResult::LoadMissingRefs,
                Err(errnum) => return self.fail(errnum),
            }
        }

        LookupResult::Finished
    }

    fn finish(&mut self) -> LookupResult {
        self.state = State::Finished;
        LookupResult::Finished
    }

    fn fail(&mut self, errnum: KvsError) -> LookupResult {
        self.errnum = Some(errnum);
        self.state = State::Finished;
        LookupResult::Error
    }

    fn namespace_still_valid<R>(&self, roots: &RootMgr<R>) -> Result<(), KvsError> {
        // an explicit root ref pins the snapshot; no namespace to re-check
        if self.root_ref_set_by_user {
            return Ok(());
        }
        let root = roots.lookup_safe(&self.ns).ok_or(KvsError::NotSup)?;
        root.check_user(self.cred)
    }

    //─────────────────────────────
    //  Walk
    //─────────────────────────────

    fn walk<R>(&mut self, cache: &mut Cache, roots: &RootMgr<R>) -> Result<WalkStatus, KvsError> {
        loop {
            let level = self.levels.last().expect("walk level present");
            let Some(pathcomp) = level.pathcomps.front().cloned() else {
                self.wdirent = Some(level.dirent.clone());
                return Ok(WalkStatus::Finished);
            };

            // resolve the current dirent to a directory
            let dir = match &level.dirent {
                TreeObj::DirRef(refs) => {
                    if refs.len() != 1 {
                        error!(path = %self.path, "dirref with invalid blobref count");
                        return Err(KvsError::NotRecoverable);
                    }
                    let blobref = refs[0].clone();
                    let at_root = level.dirent == TreeObj::dirref(level.root_ref.clone());
                    let depth = level.depth;
                    let Some(entry) = cache.lookup(&blobref, self.epoch).filter(|e| e.is_valid())
                    else {
                        self.missing_ref = Some(blobref);
                        return Ok(WalkStatus::MissingRef);
                    };
                    match entry.treeobj() {
                        Some(obj) if obj.is_dir() => obj.clone(),
                        Some(_) | None => {
                            // only a user-supplied root ref may legally name
                            // junk; anything deeper is tree corruption
                            error!(path = %self.path, %blobref, "dirref names a non-directory");
                            if depth == 0 && at_root {
                                return Err(KvsError::Invalid);
                            }
                            return Err(KvsError::NotRecoverable);
                        }
                    }
                }
                TreeObj::Val(_) | TreeObj::ValRef(_) => {
                    // walking into a leaf: null result, caller decides
                    self.wdirent = None;
                    return Ok(WalkStatus::Finished);
                }
                other => {
                    error!(
                        path = %self.path,
                        dirent_type = other.type_name(),
                        "unexpected dirent type in walk"
                    );
                    return Err(KvsError::NotRecoverable);
                }
            };

            let Some(found) = dir.entry(&pathcomp).map_err(|_| KvsError::NotRecoverable)? else {
                self.wdirent = None;
                return Ok(WalkStatus::Finished);
            };
            let found = found.clone();

            if found.is_symlink() {
                match self.walk_symlink(roots, &found)? {
                    SymlinkStep::MissingNamespace => return Ok(WalkStatus::MissingNamespace),
                    SymlinkStep::Recursed => continue,
                    SymlinkStep::Resolved => {}
                }
            } else {
                self.levels.last_mut().expect("walk level present").dirent = found;
            }

            // unwind finished symlink levels into their parents
            let level = self.levels.last().expect("walk level present");
            if level.at_last_comp() && level.depth > 0 {
                let resolved = level.dirent.clone();
                loop {
                    self.levels.pop();
                    let parent = self.levels.last_mut().expect("depth > 0 implies a parent");
                    parent.dirent = resolved.clone();
                    if !(parent.depth > 0 && parent.at_last_comp()) {
                        break;
                    }
                }
            }
            self.levels
                .last_mut()
                .expect("walk level present")
                .pathcomps
                .pop_front();
        }
    }

    fn walk_symlink<R>(
        &mut self,
        roots: &RootMgr<R>,
        dirent: &TreeObj,
    ) -> Result<SymlinkStep, KvsError> {
        let TreeObj::Symlink { namespace, target } = dirent else {
            return Err(KvsError::NotRecoverable);
        };
        let (at_last, depth) = {
            let level = self.levels.last().expect("walk level present");
            (level.at_last_comp(), level.depth)
        };

        // at the final component, READLINK and TREEOBJ take the link itself
        if at_last && self.flags & (LOOKUP_READLINK | LOOKUP_TREEOBJ) != 0 {
            self.levels.last_mut().expect("walk level present").dirent = dirent.clone();
            return Ok(SymlinkStep::Resolved);
        }

        if depth == SYMLINK_CYCLE_LIMIT {
            return Err(KvsError::Loop);
        }

        // cross-namespace links resolve their root first
        let link_root: Option<Blobref> = match namespace {
            Some(ns) => {
                let Some(root) = roots.lookup(ns) else {
                    self.missing_namespace = Some(ns.clone());
                    return Ok(SymlinkStep::MissingNamespace);
                };
                root.check_user(self.cred)?;
                Some(root.rootref.clone())
            }
            None => None,
        };

        let (linkpath, _) = normalize_key(target);
        let level = self.levels.last_mut().expect("walk level present");
        level.dirent = dirent.clone();

        if linkpath == "." {
            // link to a root: swap in its dirref, no recursion needed
            level.dirent = match link_root {
                Some(root_ref) => TreeObj::dirref(root_ref),
                None => TreeObj::dirref(level.root_ref.clone()),
            };
            return Ok(SymlinkStep::Resolved);
        }

        let next_root = link_root.unwrap_or_else(|| level.root_ref.clone());
        let next_depth = level.depth + 1;
        self.levels.push(WalkLevel::new(&next_root, &linkpath, next_depth));
        Ok(SymlinkStep::Recursed)
    }

    //─────────────────────────────
    //  Value materialization
    //─────────────────────────────

    /// Turn the walked dirent into the result value, honoring flags.
    /// Ok(false) means a valref stalled on missing raw blobs.
    fn materialize(&mut self, cache: &mut Cache) -> Result<bool, KvsError> {
        let wdirent = self.wdirent.clone().expect("walk produced a dirent");

        if self.flags & LOOKUP_TREEOBJ != 0 {
            self.val = Some(wdirent);
            return Ok(true);
        }

        match &wdirent {
            TreeObj::DirRef(refs) => {
                if self.flags & LOOKUP_READLINK != 0 {
                    return Err(KvsError::Invalid);
                }
                if self.flags & LOOKUP_READDIR == 0 {
                    return Err(KvsError::IsDir);
                }
                if refs.len() != 1 {
                    error!(path = %self.path, "dirref with invalid blobref count");
                    return Err(KvsError::NotRecoverable);
                }
                let blobref = refs[0].clone();
                let Some(entry) = cache.lookup(&blobref, self.epoch).filter(|e| e.is_valid())
                else {
                    self.missing_ref = Some(blobref);
                    return Ok(false);
                };
                match entry.treeobj() {
                    Some(obj) if obj.is_dir() => {
                        self.val = Some(obj.clone());
                        Ok(true)
                    }
                    Some(_) | None => {
                        error!(path = %self.path, %blobref, "dirref names a non-directory");
                        Err(KvsError::NotRecoverable)
                    }
                }
            }
            TreeObj::ValRef(refs) => {
                if self.flags & LOOKUP_READLINK != 0 {
                    return Err(KvsError::Invalid);
                }
                if self.flags & LOOKUP_READDIR != 0 {
                    return Err(KvsError::NotDir);
                }
                if refs.is_empty() {
                    error!(path = %self.path, "valref with no blobrefs");
                    return Err(KvsError::NotRecoverable);
                }
                // all raw blobs must be resident before concatenation
                let mut total = 0usize;
                for blobref in refs {
                    let Some(entry) = cache.lookup(blobref, self.epoch).filter(|e| e.is_valid())
                    else {
                        self.valref_missing = Some(refs.clone());
                        return Ok(false);
                    };
                    total = total
                        .checked_add(entry.raw_len())
                        .ok_or(KvsError::Overflow)?;
                }
                let mut data = Vec::with_capacity(total);
                for blobref in refs {
                    let entry = cache
                        .lookup(blobref, self.epoch)
                        .expect("checked resident above");
                    data.extend_from_slice(entry.raw().expect("checked valid above"));
                }
                self.val = Some(TreeObj::Val(data));
                Ok(true)
            }
            TreeObj::Dir(_) => {
                if self.flags & LOOKUP_READLINK != 0 {
                    return Err(KvsError::Invalid);
                }
                if self.flags & LOOKUP_READDIR == 0 {
                    return Err(KvsError::IsDir);
                }
                self.val = Some(wdirent);
                Ok(true)
            }
            TreeObj::Val(_) => {
                if self.flags & LOOKUP_READLINK != 0 {
                    return Err(KvsError::Invalid);
                }
                if self.flags & LOOKUP_READDIR != 0 {
                    return Err(KvsError::NotDir);
                }
                self.val = Some(wdirent);
                Ok(true)
            }
            TreeObj::Symlink { .. } => {
                // the walk follows links unless READLINK asked for one
                if self.flags & LOOKUP_READLINK == 0 {
                    return Err(KvsError::Proto);
                }
                if self.flags & LOOKUP_READDIR != 0 {
                    return Err(KvsError::NotDir);
                }
                self.val = Some(wdirent);
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests;
