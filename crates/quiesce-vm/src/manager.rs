use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use quiesce_debugger::{CodeInstance, FunctionSpaceIndex, VirtualAddress};

use crate::module::Module;

/// Module loaded at a unique instance ID.
///
/// Code addresses of an instance combine its ID with code offsets of its
/// module.
#[derive(Debug)]
pub struct Instance {
    id: u32,
    module: Arc<Module>,
}

impl Instance {
    /// Returns the ID of this instance.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns the module of this instance.
    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    /// Returns the address of the given code offset.
    pub fn address(&self, offset: u32) -> VirtualAddress {
        VirtualAddress::from_parts(self.id, offset)
    }
}

impl CodeInstance for Instance {
    fn instance_id(&self) -> u32 {
        self.id
    }

    fn entry_address(&self, function: FunctionSpaceIndex) -> Option<VirtualAddress> {
        self.module
            .entry_offset(function)
            .map(|offset| self.address(offset))
    }
}

/// Loader of module instances.
pub struct ModuleManager {
    next_id: AtomicU32,

    /// Live instances, by ID.
    instances: RwLock<HashMap<u32, Weak<Instance>>>,
}

impl Default for ModuleManager {
    fn default() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            instances: RwLock::default(),
        }
    }
}

impl ModuleManager {
    /// Creates a manager with no instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the ID the next instance will get.
    pub fn next_instance_id(&self) -> u32 {
        self.next_id.load(Ordering::Acquire)
    }

    /// Instantiates a module at a fresh ID.
    pub fn instantiate(&self, module: Arc<Module>) -> Arc<Instance> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let instance = Arc::new(Instance { id, module });

        let mut instances = self.instances.write();
        instances.retain(|_, instance| instance.strong_count() > 0);
        instances.insert(id, Arc::downgrade(&instance));

        tracing::debug!(id, code_size = instance.module.code_size(), "module instantiated");

        instance
    }

    /// Returns the live instance with the given ID.
    pub fn instance(&self, id: u32) -> Option<Arc<Instance>> {
        self.instances.read().get(&id).and_then(Weak::upgrade)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use quiesce_debugger::{CodeInstance, FunctionSpaceIndex, VirtualAddress};

    use super::ModuleManager;
    use crate::workload;

    #[test]
    fn instances_get_distinct_ids() {
        let manager = ModuleManager::new();
        let module = Arc::new(workload::module().unwrap());

        let first_id = manager.next_instance_id();
        let first = manager.instantiate(module.clone());
        let second = manager.instantiate(module);

        assert_eq!(first.id(), first_id);
        assert_eq!(second.id(), first_id + 1);
        assert_eq!(manager.next_instance_id(), first_id + 2);

        assert_eq!(
            second.entry_address(workload::SPIN),
            Some(VirtualAddress::from_parts(second.id(), 4))
        );
        assert_eq!(second.entry_address(FunctionSpaceIndex(9)), None);

        let id = first.id();
        assert!(manager.instance(id).is_some());
        drop(first);
        assert!(manager.instance(id).is_none());
    }
}
