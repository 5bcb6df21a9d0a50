//! Modules: one globals/exports table per imported file.
//!
//! Grounded in `original_source/src/module.h` + `module.c`. The original
//! threads modules through a `Module* next` intrusive list hanging off the
//! VM; here they live in a flat, index-addressable [`ModuleTable`] so a
//! [`crate::object::ModuleId`] (stored on every `Closure`) is a plain array
//! index rather than a pointer.

use crate::heap::ObjRef;
use crate::object::ModuleId;
use crate::value::Value;
use ahash::AHashMap;
use std::path::PathBuf;

/// One loaded module's state: its own global variables plus the subset of
/// them explicitly re-exported for importers.
#[derive(Debug)]
pub struct Module {
    pub name: Box<str>,
    /// Canonicalized directory the module's source lives in; relative
    /// imports inside it resolve against this, matching
    /// `original_source`'s `vm->baseDirectory` / `Module.directory` use.
    pub directory: PathBuf,
    pub globals: AHashMap<ObjRef, Value>,
    /// Populated by `export` statements; looked up by name when another
    /// module imports this one.
    pub exports: AHashMap<ObjRef, Value>,
}

impl Module {
    pub fn new(name: impl Into<Box<str>>, directory: PathBuf) -> Self {
        Self { name: name.into(), directory, globals: AHashMap::new(), exports: AHashMap::new() }
    }
}

/// Every module loaded by a running VM, addressable by [`ModuleId`]. Import
/// resolution (path -> id) is a `feline-vm` concern (it needs filesystem
/// access and the compiler); this table only owns storage.
#[derive(Debug, Default)]
pub struct ModuleTable {
    modules: Vec<Module>,
    /// Canonical path -> id, so re-importing the same module is a cache hit
    /// (spec.md §4.4 "imports are lazy and cached").
    by_path: AHashMap<PathBuf, ModuleId>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ModuleId) -> &Module {
        &self.modules[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: ModuleId) -> &mut Module {
        &mut self.modules[id.0 as usize]
    }

    pub fn find_by_path(&self, path: &PathBuf) -> Option<ModuleId> {
        self.by_path.get(path).copied()
    }

    /// Register a newly-compiled module under `canonical_path`, returning
    /// its fresh id. Callers must have already checked
    /// [`ModuleTable::find_by_path`] to honor the import cache.
    pub fn insert(&mut self, canonical_path: PathBuf, module: Module) -> ModuleId {
        let id = ModuleId(self.modules.len() as u32);
        self.modules.push(module);
        self.by_path.insert(canonical_path, id);
        id
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Module> {
        self.modules.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Module> {
        self.modules.iter_mut()
    }
}
