//! The per-session object store: an append-only heap of path bytes plus a
//! map from 32-bit object handles to database entries.
//!
//! Objects are created unregistered by `create_or_find_*` and only become
//! visible to the host once `register`ed with a handle. Deleting an object
//! drops it from both indexes; its heap bytes are left behind (the heap is
//! an arena, reclaimed wholesale on session close).

use std::collections::HashMap;

use crate::protocol::ROOT_PARENT;

/// Index of an object in the database arena. Not stable across `reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjKey(usize);

#[derive(Debug)]
struct ObjectEntry {
    name_off: usize,
    name_len: usize,
    parent: u32,
    storage_id: u32,
    handle: Option<u32>,
}

#[derive(Debug, Default)]
pub struct ObjectDatabase {
    heap: Vec<u8>,
    objects: Vec<ObjectEntry>,
    by_handle: HashMap<u32, ObjKey>,
    by_path: HashMap<Box<str>, ObjKey>,
    next_handle: u32,
}

/// Join a parent path and a child name with the implicit leading '/'.
/// Children of the root elide the doubled separator.
fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() || parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

impl ObjectDatabase {
    pub fn new() -> Self {
        ObjectDatabase {
            next_handle: 1,
            ..Default::default()
        }
    }

    /// Drop every object and reclaim the heap. The database is
    /// indistinguishable from a freshly constructed one afterwards.
    pub fn reset(&mut self) {
        self.heap.clear();
        self.heap.shrink_to_fit();
        self.objects.clear();
        self.by_handle.clear();
        self.by_path.clear();
        self.next_handle = 1;
    }

    /// Create the unregistered root object for a storage. `name` may be
    /// empty for a backend mounted at the root.
    pub fn create_root(&mut self, name: &str, storage_id: u32) -> ObjKey {
        self.create_or_find(&join("", name), ROOT_PARENT, storage_id)
    }

    /// Create (or find) the child `name` of `parent`.
    pub fn create_or_find_child(&mut self, parent: ObjKey, name: &str) -> ObjKey {
        let path = join(self.name_of(parent), name);
        let parent_handle = self.entry(parent).handle.unwrap_or(ROOT_PARENT);
        let storage_id = self.entry(parent).storage_id;
        self.create_or_find(&path, parent_handle, storage_id)
    }

    /// Create (or find) a sibling of `of` named `name` — the rename target.
    /// The parent path is the prefix of `of`'s path up to its last '/'.
    pub fn create_or_find_sibling(&mut self, of: ObjKey, name: &str) -> ObjKey {
        let full = self.name_of(of);
        let split = full.rfind('/').unwrap_or(0);
        let path = join(&full[..split], name);
        let parent = self.entry(of).parent;
        let storage_id = self.entry(of).storage_id;
        self.create_or_find(&path, parent, storage_id)
    }

    fn create_or_find(&mut self, path: &str, parent: u32, storage_id: u32) -> ObjKey {
        if let Some(&key) = self.by_path.get(path) {
            return key;
        }
        let name_off = self.heap.len();
        self.heap.extend_from_slice(path.as_bytes());
        self.heap.push(0);
        let key = ObjKey(self.objects.len());
        self.objects.push(ObjectEntry {
            name_off,
            name_len: path.len(),
            parent,
            storage_id,
            handle: None,
        });
        self.by_path.insert(path.into(), key);
        key
    }

    /// Register `key` under a freshly minted handle.
    pub fn register(&mut self, key: ObjKey) -> u32 {
        let handle = self.alloc_handle();
        self.register_as(key, handle);
        handle
    }

    /// Register `key` under an explicit handle (storage roots use their
    /// storage id; a rename keeps the old object's handle).
    pub fn register_as(&mut self, key: ObjKey, handle: u32) {
        self.objects[key.0].handle = Some(handle);
        self.by_handle.insert(handle, key);
    }

    /// Drop `key` from both indexes.
    pub fn delete(&mut self, key: ObjKey) {
        if let Some(handle) = self.objects[key.0].handle.take() {
            self.by_handle.remove(&handle);
        }
        let path: Box<str> = self.name_of(key).into();
        self.by_path.remove(&path);
    }

    pub fn get(&self, handle: u32) -> Option<ObjKey> {
        self.by_handle.get(&handle).copied()
    }

    /// The object's full path, with the implicit leading '/'.
    pub fn name_of(&self, key: ObjKey) -> &str {
        let e = self.entry(key);
        std::str::from_utf8(&self.heap[e.name_off..e.name_off + e.name_len])
            .expect("heap paths are valid utf-8")
    }

    /// The last path component.
    pub fn file_name(&self, key: ObjKey) -> &str {
        let name = self.name_of(key);
        match name.rfind('/') {
            Some(pos) => &name[pos + 1..],
            None => name,
        }
    }

    pub fn parent_of(&self, key: ObjKey) -> u32 {
        self.entry(key).parent
    }

    pub fn storage_of(&self, key: ObjKey) -> u32 {
        self.entry(key).storage_id
    }

    pub fn handle_of(&self, key: ObjKey) -> Option<u32> {
        self.entry(key).handle
    }

    pub fn is_registered(&self, key: ObjKey) -> bool {
        self.entry(key).handle.is_some()
    }

    fn entry(&self, key: ObjKey) -> &ObjectEntry {
        &self.objects[key.0]
    }

    fn alloc_handle(&mut self) -> u32 {
        loop {
            let handle = self.next_handle;
            self.next_handle = self.next_handle.wrapping_add(1);
            if handle != 0 && handle != ROOT_PARENT && !self.by_handle.contains_key(&handle) {
                return handle;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_concatenate_with_single_separators() {
        let mut db = ObjectDatabase::new();
        let root = db.create_root("card", 0x0001_0001);
        db.register_as(root, 0x0001_0001);
        assert_eq!(db.name_of(root), "/card");

        let child = db.create_or_find_child(root, "a.bin");
        assert_eq!(db.name_of(child), "/card/a.bin");
        assert_eq!(db.file_name(child), "a.bin");
        assert_eq!(db.parent_of(child), 0x0001_0001);
    }

    #[test]
    fn root_children_elide_double_slash() {
        let mut db = ObjectDatabase::new();
        let root = db.create_root("", 1);
        db.register_as(root, 1);
        assert_eq!(db.name_of(root), "/");
        let child = db.create_or_find_child(root, "f");
        assert_eq!(db.name_of(child), "/f");
    }

    #[test]
    fn create_or_find_deduplicates() {
        let mut db = ObjectDatabase::new();
        let root = db.create_root("card", 7);
        db.register_as(root, 7);
        let a = db.create_or_find_child(root, "x");
        let b = db.create_or_find_child(root, "x");
        assert_eq!(a, b);
    }

    #[test]
    fn handle_minting_skips_taken_handles() {
        let mut db = ObjectDatabase::new();
        let root = db.create_root("card", 2);
        db.register_as(root, 2);
        let a = db.create_or_find_child(root, "a");
        let b = db.create_or_find_child(root, "b");
        assert_eq!(db.register(a), 1);
        // 2 is taken by the storage root.
        assert_eq!(db.register(b), 3);
    }

    #[test]
    fn sibling_creation_for_rename() {
        let mut db = ObjectDatabase::new();
        let root = db.create_root("card", 1);
        db.register_as(root, 1);
        let old = db.create_or_find_child(root, "a.bin");
        let handle = db.register(old);

        let new = db.create_or_find_sibling(old, "b.bin");
        assert_eq!(db.name_of(new), "/card/b.bin");
        assert!(!db.is_registered(new));

        db.delete(old);
        db.register_as(new, handle);
        assert_eq!(db.get(handle), Some(new));
        assert_eq!(db.name_of(new), "/card/b.bin");
    }

    #[test]
    fn reset_restores_initial_state() {
        let mut db = ObjectDatabase::new();
        let root = db.create_root("card", 1);
        db.register_as(root, 1);
        let child = db.create_or_find_child(root, "a");
        db.register(child);

        db.reset();
        assert!(db.heap.is_empty());
        assert!(db.objects.is_empty());
        assert!(db.by_handle.is_empty());
        assert!(db.by_path.is_empty());
        assert_eq!(db.next_handle, 1);
        assert_eq!(db.get(1), None);
    }

    #[test]
    fn deleted_path_can_be_recreated() {
        let mut db = ObjectDatabase::new();
        let root = db.create_root("card", 1);
        db.register_as(root, 1);
        let a = db.create_or_find_child(root, "a");
        db.register(a);
        db.delete(a);
        let again = db.create_or_find_child(root, "a");
        assert_ne!(a, again);
        assert!(!db.is_registered(again));
    }
}
