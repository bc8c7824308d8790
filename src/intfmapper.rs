//! Interface-name mapping.
//!
//! Routers export interfaces as SNMP indices; names make the labels
//! readable. The SNMP poller that maintains the mapping lives outside this
//! crate; the database only depends on this trait.

use std::collections::HashMap;

pub trait IntfMapper: Send + Sync {
    /// Name of interface `id` on `agent`, if the mapping knows it.
    fn interface_name(&self, agent: &str, id: u32) -> Option<String>;

    /// Index of interface `name` on `agent`.
    fn interface_id(&self, agent: &str, name: &str) -> Option<u32>;
}

/// Mapper with no data; every lookup misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMapper;

impl IntfMapper for NullMapper {
    fn interface_name(&self, _agent: &str, _id: u32) -> Option<String> {
        None
    }

    fn interface_id(&self, _agent: &str, _name: &str) -> Option<u32> {
        None
    }
}

/// Fixed mapping, used by tests and static deployments.
#[derive(Debug, Default)]
pub struct StaticMapper {
    by_agent: HashMap<String, HashMap<u32, String>>,
}

impl StaticMapper {
    pub fn new() -> Self {
        StaticMapper::default()
    }

    pub fn add(&mut self, agent: &str, id: u32, name: &str) {
        self.by_agent
            .entry(agent.to_string())
            .or_default()
            .insert(id, name.to_string());
    }
}

impl IntfMapper for StaticMapper {
    fn interface_name(&self, agent: &str, id: u32) -> Option<String> {
        self.by_agent.get(agent)?.get(&id).cloned()
    }

    fn interface_id(&self, agent: &str, name: &str) -> Option<u32> {
        self.by_agent
            .get(agent)?
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(id, _)| *id)
    }
}
