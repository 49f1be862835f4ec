//! Shared fixtures for the integration tests: an in-memory route store that
//! behaves like a remote declarative-resource client.

#![allow(dead_code)]

use async_trait::async_trait;
use pollgate::resource::{ConditionStatus, HasConditions, ResourceClient, StatusCondition};
use pollgate::FetchError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub struct FakeRoute {
    pub name: String,
    pub traffic_percent: u32,
    pub conditions: Vec<StatusCondition>,
}

impl FakeRoute {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            traffic_percent: 0,
            conditions: vec![StatusCondition::new("Ready", ConditionStatus::Unknown)],
        }
    }

    pub fn ready(mut self) -> Self {
        self.conditions = vec![StatusCondition::new("Ready", ConditionStatus::True)];
        self
    }
}

impl HasConditions for FakeRoute {
    fn conditions(&self) -> &[StatusCondition] {
        &self.conditions
    }
}

#[derive(Default)]
struct FakeState {
    routes: HashMap<String, FakeRoute>,
    // Objects that only become visible after the given number of gets.
    pending: HashMap<String, (u32, FakeRoute)>,
}

#[derive(Default)]
pub struct FakeRouteClient {
    state: Mutex<FakeState>,
    gets: AtomicU32,
    deletes: AtomicU32,
}

impl FakeRouteClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// `route` is reported NotFound for the next `misses` gets.
    pub fn appear_after(&self, misses: u32, route: FakeRoute) {
        self.state
            .lock()
            .unwrap()
            .pending
            .insert(route.name.clone(), (misses, route));
    }

    pub fn update<F: FnOnce(&mut FakeRoute)>(&self, name: &str, change: F) {
        if let Some(route) = self.state.lock().unwrap().routes.get_mut(name) {
            change(route);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().unwrap().routes.contains_key(name)
    }

    pub fn gets(&self) -> u32 {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> u32 {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceClient for FakeRouteClient {
    type Object = FakeRoute;
    type Spec = FakeRoute;

    fn kind(&self) -> &str {
        "Route"
    }

    async fn get(&self, name: &str) -> Result<FakeRoute, FetchError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();

        if let Some((misses, _)) = state.pending.get_mut(name) {
            if *misses > 0 {
                *misses -= 1;
                return Err(FetchError::not_found("Route", name));
            }
            if let Some((_, route)) = state.pending.remove(name) {
                state.routes.insert(name.to_string(), route);
            }
        }

        state
            .routes
            .get(name)
            .cloned()
            .ok_or_else(|| FetchError::not_found("Route", name))
    }

    async fn create(&self, spec: FakeRoute) -> Result<FakeRoute, FetchError> {
        let mut state = self.state.lock().unwrap();
        if state.routes.contains_key(&spec.name) {
            return Err(FetchError::other(format!("route {} already exists", spec.name)));
        }
        state.routes.insert(spec.name.clone(), spec.clone());
        Ok(spec)
    }

    async fn delete(&self, names: &[String]) -> Result<(), FetchError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        for name in names {
            state.routes.remove(name);
            state.pending.remove(name);
        }
        Ok(())
    }
}
