use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::config::dto::ControllerConf;
use crate::tag::Tag;

/// Immutable description of a backend controller, shared by every session
/// routed to it.
#[derive(Debug, Clone)]
pub struct ControllerDescriptor {
    pub name: String,
    pub uuid: Uuid,
    pub tag: Tag,
    /// Preferred dial target, tried before the machine addresses.
    pub public_address: Option<String>,
    pub api_addresses: Vec<String>,
    pub ca_cert_pem: Option<String>,
    pub tls_server_name: Option<String>,
}

impl ControllerDescriptor {
    pub fn from_conf(conf: &ControllerConf) -> Self {
        Self {
            name: conf.name.clone(),
            uuid: conf.uuid,
            tag: Tag::controller(conf.uuid),
            public_address: conf.public_address.clone(),
            api_addresses: conf.api_addresses.clone(),
            ca_cert_pem: conf.ca_cert_pem.clone(),
            tls_server_name: conf.tls_server_name.clone(),
        }
    }

    /// Dial candidates in preference order.
    pub fn candidate_addresses(&self) -> Vec<String> {
        let mut candidates = Vec::with_capacity(self.api_addresses.len() + 1);

        if let Some(public_address) = &self.public_address {
            candidates.push(public_address.clone());
        }

        for address in &self.api_addresses {
            if Some(address) != self.public_address.as_ref() {
                candidates.push(address.clone());
            }
        }

        candidates
    }
}

#[derive(Clone, Default)]
pub struct ControllerRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    controllers: HashMap<Tag, Arc<ControllerDescriptor>>,
    /// Registration order; the first controller is the default route.
    order: Vec<Tag>,
}

impl ControllerRegistry {
    pub fn from_conf(controllers: &[ControllerConf]) -> Self {
        let registry = Self::default();
        for conf in controllers {
            registry.insert(ControllerDescriptor::from_conf(conf));
        }
        registry
    }

    pub fn insert(&self, descriptor: ControllerDescriptor) {
        let mut inner = self.inner.write();
        let tag = descriptor.tag.clone();

        if !inner.controllers.contains_key(&tag) {
            inner.order.push(tag.clone());
        }
        inner.controllers.insert(tag, Arc::new(descriptor));
    }

    pub fn get(&self, tag: &Tag) -> Option<Arc<ControllerDescriptor>> {
        self.inner.read().controllers.get(tag).cloned()
    }

    /// The controller `/api` routes to when no model is named.
    pub fn default_controller(&self) -> Option<Arc<ControllerDescriptor>> {
        let inner = self.inner.read();
        let tag = inner.order.first()?;
        inner.controllers.get(tag).cloned()
    }

    pub fn all(&self) -> Vec<Arc<ControllerDescriptor>> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|tag| inner.controllers.get(tag).cloned())
            .collect()
    }
}

/// Which controller hosts which model, folded out of the watcher's change
/// stream and consulted when routing `/model/<uuid>/*` connections.
#[derive(Clone, Default)]
pub struct ModelDirectory {
    inner: Arc<RwLock<HashMap<Uuid, Tag>>>,
}

impl ModelDirectory {
    pub fn record(&self, model: Uuid, controller: Tag) {
        self.inner.write().insert(model, controller);
    }

    pub fn forget(&self, model: Uuid) {
        self.inner.write().remove(&model);
    }

    pub fn controller_for(&self, model: Uuid) -> Option<Tag> {
        self.inner.read().get(&model).cloned()
    }
}
