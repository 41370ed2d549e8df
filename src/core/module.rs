// src/core/module.rs

//! The module registry: a static, ordered table of plain records with
//! optional hook functions. Configuration ownership is spread across
//! modules; the reload transaction walks this table for `create_conf`,
//! `parse`, and `init_conf`, and once more at commit for `init_module`.

use crate::core::cycle::Cycle;
use std::any::Any;
use std::sync::Arc;

/// Index of the built-in core module; it is always registered first.
pub const CORE_MODULE_INDEX: usize = 0;

/// An opaque per-module configuration block. Blocks live in the owning
/// cycle's pool; hooks reach theirs through `Cycle::conf`/`conf_mut` with
/// the module index they are handed.
pub type ConfBlock = Box<dyn Any + Send + Sync>;

pub type CreateConfFn = fn(&mut Cycle) -> anyhow::Result<ConfBlock>;
pub type ParseConfFn = fn(&mut Cycle, &toml::Table, usize) -> anyhow::Result<()>;
pub type InitConfFn = fn(&mut Cycle, usize) -> anyhow::Result<()>;
pub type InitModuleFn = fn(&Arc<Cycle>) -> anyhow::Result<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    /// Participates in the configuration walk (`create_conf`, `parse`,
    /// `init_conf`).
    Core,
    /// Only sees `init_module` at commit.
    Other,
}

/// One registered module.
#[derive(Clone)]
pub struct Module {
    pub name: &'static str,
    pub kind: ModuleKind,
    pub create_conf: Option<CreateConfFn>,
    pub parse: Option<ParseConfFn>,
    pub init_conf: Option<InitConfFn>,
    pub init_module: Option<InitModuleFn>,
}

impl Module {
    pub fn new(name: &'static str, kind: ModuleKind) -> Self {
        Self {
            name,
            kind,
            create_conf: None,
            parse: None,
            init_conf: None,
            init_module: None,
        }
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// The ordered module table. Registration order is hook order; a module's
/// position is its index into `cycle.conf_ctx`.
#[derive(Debug)]
pub struct ModuleRegistry {
    modules: Vec<Module>,
}

impl ModuleRegistry {
    /// A registry with the built-in core module at index 0.
    pub fn new() -> Self {
        Self {
            modules: vec![crate::config::core_module()],
        }
    }

    /// Appends a module and returns its index.
    pub fn register(&mut self, module: Module) -> usize {
        self.modules.push(module);
        self.modules.len() - 1
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Module> {
        self.modules.iter()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
