//! The immutable set of service descriptors and their dependency order.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use crate::config::{ServiceConfig, SupervisorConfig};
use crate::errors::{Result, SupervisorError};

/// Validated, immutable view of the configuration. Descriptors never change
/// after `load`; lookups and orderings are precomputed.
#[derive(Debug)]
pub struct ServiceRegistry {
    descriptors: HashMap<String, Arc<ServiceConfig>>,
    /// Dependency-topological order, lexicographic tie-break.
    start_order: Vec<String>,
    /// Reverse of `start_order`.
    stop_order: Vec<String>,
    /// `stop_order` grouped by dependency depth, deepest dependents first.
    /// Services in one group share no dependency edge and may stop together.
    stop_levels: Vec<Vec<String>>,
    /// identifier -> identifiers that depend on it.
    dependents: HashMap<String, Vec<String>>,
    watch_rules: BTreeMap<String, Vec<String>>,
}

impl ServiceRegistry {
    /// Build the registry from a parsed configuration. Any schema or
    /// semantic error aborts the load; there is no partial result.
    pub fn load(config: SupervisorConfig) -> Result<Self> {
        let mut descriptors: HashMap<String, Arc<ServiceConfig>> = HashMap::new();
        for svc in &config.services {
            svc.validate().map_err(SupervisorError::ConfigInvalid)?;
            if descriptors
                .insert(svc.identifier.clone(), Arc::new(svc.clone()))
                .is_some()
            {
                return Err(SupervisorError::ConfigInvalid(format!(
                    "duplicate service identifier '{}'",
                    svc.identifier
                )));
            }
        }

        for svc in &config.services {
            for dep in &svc.dependencies {
                if !descriptors.contains_key(dep) {
                    return Err(SupervisorError::UnknownDependency {
                        service: svc.identifier.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
            for rule in &svc.reload_on {
                if !config.watch_rules.contains_key(rule) {
                    return Err(SupervisorError::ConfigInvalid(format!(
                        "service '{}' reloads on undeclared rule-set '{}'",
                        svc.identifier, rule
                    )));
                }
            }
        }

        let start_order = topological_order(&descriptors)?;
        let mut stop_order = start_order.clone();
        stop_order.reverse();
        let stop_levels = dependency_levels(&descriptors, &start_order);

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for id in descriptors.keys() {
            dependents.insert(id.clone(), Vec::new());
        }
        for svc in &config.services {
            for dep in &svc.dependencies {
                if let Some(list) = dependents.get_mut(dep) {
                    list.push(svc.identifier.clone());
                }
            }
        }
        for list in dependents.values_mut() {
            list.sort();
        }

        Ok(Self {
            descriptors,
            start_order,
            stop_order,
            stop_levels,
            dependents,
            watch_rules: config.watch_rules,
        })
    }

    pub fn get(&self, identifier: &str) -> Result<&Arc<ServiceConfig>> {
        self.descriptors
            .get(identifier)
            .ok_or_else(|| SupervisorError::ServiceNotFound(identifier.to_string()))
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.start_order.iter().map(|s| s.as_str())
    }

    pub fn start_order(&self) -> &[String] {
        &self.start_order
    }

    pub fn stop_order(&self) -> &[String] {
        &self.stop_order
    }

    /// Stop order grouped into dependency levels. Each group can be stopped
    /// concurrently; groups must be stopped in sequence.
    pub fn stop_levels(&self) -> &[Vec<String>] {
        &self.stop_levels
    }

    /// Services that directly depend on `identifier`, sorted by name.
    pub fn dependents_of(&self, identifier: &str) -> &[String] {
        self.dependents
            .get(identifier)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn watch_rules(&self) -> &BTreeMap<String, Vec<String>> {
        &self.watch_rules
    }

    /// Services whose `reload_on` includes `rule_set`, in start order.
    pub fn reload_targets(&self, rule_set: &str) -> Vec<String> {
        self.start_order
            .iter()
            .filter(|id| {
                self.descriptors[*id]
                    .reload_on
                    .iter()
                    .any(|r| r == rule_set)
            })
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Kahn's algorithm with a lexicographic min-heap so that equal-rank
/// services always come out in the same order.
fn topological_order(descriptors: &HashMap<String, Arc<ServiceConfig>>) -> Result<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for id in descriptors.keys() {
        in_degree.insert(id, 0);
        dependents.insert(id, Vec::new());
    }

    for (id, desc) in descriptors {
        for dep in &desc.dependencies {
            *in_degree.get_mut(id.as_str()).ok_or_else(|| {
                SupervisorError::Internal(format!("unknown service '{}' in graph", id))
            })? += 1;
            dependents
                .get_mut(dep.as_str())
                .ok_or_else(|| SupervisorError::UnknownDependency {
                    service: id.clone(),
                    dependency: dep.clone(),
                })?
                .push(id);
        }
    }

    let mut ready: BinaryHeap<Reverse<&str>> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| Reverse(*id))
        .collect();

    let mut order = Vec::with_capacity(descriptors.len());
    while let Some(Reverse(id)) = ready.pop() {
        order.push(id.to_string());
        for dependent in &dependents[id] {
            let deg = in_degree.get_mut(dependent).ok_or_else(|| {
                SupervisorError::Internal(format!("unknown dependent '{}'", dependent))
            })?;
            *deg -= 1;
            if *deg == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }

    if order.len() != descriptors.len() {
        let ordered: HashSet<&String> = order.iter().collect();
        let mut cyclic: Vec<&str> = descriptors
            .keys()
            .filter(|k| !ordered.contains(k))
            .map(|k| k.as_str())
            .collect();
        cyclic.sort_unstable();
        return Err(SupervisorError::DependencyCycle(cyclic.join(", ")));
    }

    Ok(order)
}

/// Group services by dependency depth (roots at depth zero) and return the
/// groups deepest-first. `start_order` guarantees every dependency's depth
/// is known before its dependents are visited.
fn dependency_levels(
    descriptors: &HashMap<String, Arc<ServiceConfig>>,
    start_order: &[String],
) -> Vec<Vec<String>> {
    let mut depth: HashMap<&str, usize> = HashMap::new();
    let mut levels: Vec<Vec<String>> = Vec::new();
    for id in start_order {
        let d = descriptors[id]
            .dependencies
            .iter()
            .filter_map(|dep| depth.get(dep.as_str()))
            .max()
            .map(|m| m + 1)
            .unwrap_or(0);
        depth.insert(id, d);
        if levels.len() <= d {
            levels.resize_with(d + 1, Vec::new);
        }
        levels[d].push(id.clone());
    }
    levels.reverse();
    levels
}
