use crate::nw::state::WatchState;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("watch '{0}' is already registered")]
    Duplicate(String),
}

/// Every registered watch, in registration order, plus a name index.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    order: Vec<Arc<WatchState>>,
    by_name: HashMap<String, Arc<WatchState>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn insert(&self, ws: Arc<WatchState>) -> Result<(), RegistryError> {
        let mut inner = self.write();
        if inner.by_name.contains_key(ws.name()) {
            return Err(RegistryError::Duplicate(ws.name().to_string()));
        }
        inner.by_name.insert(ws.name().to_string(), Arc::clone(&ws));
        inner.order.push(ws);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<WatchState>> {
        let mut inner = self.write();
        let ws = inner.by_name.remove(name)?;
        inner.order.retain(|w| w.name() != name);
        Some(ws)
    }

    pub fn get(&self, name: &str) -> Option<Arc<WatchState>> {
        self.read().by_name.get(name).cloned()
    }

    /// Snapshot in registration order.
    pub fn all(&self) -> Vec<Arc<WatchState>> {
        self.read().order.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.read().order.iter().map(|w| w.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Linear scan; pid 0 never matches.
    pub fn find_by_pid(&self, pid: u32) -> Option<Arc<WatchState>> {
        if pid == 0 {
            return None;
        }
        self.read().order.iter().find(|w| w.pid() == pid).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nw::testing::{supervision, FakeControl};
    use crate::nw::watch::Watch;

    fn watch(name: &str) -> Arc<Watch> {
        Arc::new(Watch::new(name, vec!["/bin/true".to_string()]))
    }

    #[tokio::test]
    async fn keeps_registration_order_and_rejects_duplicates() {
        let (sup, _exits) = supervision(Arc::new(FakeControl::new()));
        let reg = Registry::new();
        for name in ["b", "a", "c"] {
            reg.insert(WatchState::spawn(watch(name), &sup)).unwrap();
        }
        assert_eq!(reg.names(), vec!["b", "a", "c"]);
        let err = reg.insert(WatchState::spawn(watch("a"), &sup)).unwrap_err();
        assert_eq!(err.to_string(), "watch 'a' is already registered");
        assert_eq!(reg.len(), 3);

        assert!(reg.remove("a").is_some());
        assert!(reg.get("a").is_none());
        assert_eq!(reg.names(), vec!["b", "c"]);
        assert!(reg.remove("a").is_none());
    }

    #[tokio::test]
    async fn pid_zero_matches_nothing() {
        let (sup, _exits) = supervision(Arc::new(FakeControl::new()));
        let reg = Registry::new();
        reg.insert(WatchState::spawn(watch("idle"), &sup)).unwrap();
        assert!(reg.find_by_pid(0).is_none());
        assert!(reg.find_by_pid(4242).is_none());
    }
}
