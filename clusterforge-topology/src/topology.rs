//! Cluster topology: the validated, immutable form of a blueprint bound to a cluster

use std::collections::{BTreeMap, BTreeSet};

use clusterforge_models::{Blueprint, ClusterTemplate, HostGroupTemplate, PropertyMap, ServiceComponent};
use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, Violation};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostGroup {
    name: String,
    components: BTreeSet<ServiceComponent>,
    host_count: Option<u32>,
    hosts: Vec<String>,
    /// Group-level overrides, ancestors first
    config_layers: Vec<PropertyMap>,
}

impl HostGroup {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn components(&self) -> impl Iterator<Item = &ServiceComponent> {
        self.components.iter()
    }

    /// Number of hosts expected for this group, `None` when open-ended
    pub fn host_count(&self) -> Option<u32> {
        self.host_count
    }

    /// Hosts the cluster template assigned to this group by name
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterTopology {
    cluster_id: String,
    blueprint: String,
    revision: u32,
    cluster_config: PropertyMap,
    host_groups: Vec<HostGroup>,
}

impl ClusterTopology {
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn blueprint(&self) -> &str {
        &self.blueprint
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn host_groups(&self) -> &[HostGroup] {
        &self.host_groups
    }

    pub fn host_group(&self, name: &str) -> Option<&HostGroup> {
        self.host_groups.iter().find(|group| group.name == name)
    }

    pub fn resolve_config(&self, host_group: &str) -> Option<PropertyMap> {
        resolve_config(self, host_group)
    }
}

/// Merge cluster defaults with a group's overrides, later layers winning key for key.
pub fn resolve_config(topology: &ClusterTopology, host_group: &str) -> Option<PropertyMap> {
    let group = topology.host_group(host_group)?;
    let mut merged = topology.cluster_config.clone();
    for layer in &group.config_layers {
        merged.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    Some(merged)
}

/// Validate a blueprint against a cluster template and produce revision 1 of its topology.
pub fn build_topology(
    blueprint: &Blueprint,
    template: &ClusterTemplate,
) -> Result<ClusterTopology, ValidationError> {
    let violations = validate(blueprint, template);
    if !violations.is_empty() {
        return Err(ValidationError { violations });
    }
    Ok(assemble(blueprint, template, 1))
}

/// Produce the next revision of an existing topology, e.g. for a scaling round.
pub fn rebuild_topology(
    previous: &ClusterTopology,
    blueprint: &Blueprint,
    template: &ClusterTemplate,
) -> Result<ClusterTopology, ValidationError> {
    let mut violations = validate(blueprint, template);
    if template.cluster_id != previous.cluster_id {
        violations.push(Violation::ClusterMismatch {
            expected: previous.cluster_id.clone(),
            actual: template.cluster_id.clone(),
        });
    }
    if !violations.is_empty() {
        return Err(ValidationError { violations });
    }
    Ok(assemble(blueprint, template, previous.revision + 1))
}

fn validate(blueprint: &Blueprint, template: &ClusterTemplate) -> Vec<Violation> {
    let mut violations = Vec::new();

    if template.cluster_id.trim().is_empty() {
        violations.push(Violation::EmptyClusterId);
    }
    if template.blueprint != blueprint.name {
        violations.push(Violation::BlueprintMismatch {
            template: template.blueprint.clone(),
            blueprint: blueprint.name.clone(),
        });
    }

    let mut services: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut duplicate_services = BTreeSet::new();
    for service in &blueprint.services {
        if services.contains_key(service.name.as_str()) {
            duplicate_services.insert(service.name.clone());
            continue;
        }
        services.insert(
            &service.name,
            service.components.iter().map(String::as_str).collect(),
        );
    }
    violations.extend(duplicate_services.into_iter().map(Violation::DuplicateService));

    let mut group_names = BTreeSet::new();
    let mut duplicate_groups = BTreeSet::new();
    for group in &blueprint.host_groups {
        if !group_names.insert(group.name.as_str()) {
            duplicate_groups.insert(group.name.clone());
        }
    }
    violations.extend(duplicate_groups.into_iter().map(Violation::DuplicateHostGroup));

    for group in &blueprint.host_groups {
        let mut reported = BTreeSet::new();
        for sc in &group.components {
            match services.get(sc.service.as_str()) {
                None => {
                    if reported.insert(sc.service.as_str()) {
                        violations.push(Violation::UnknownService {
                            group: group.name.clone(),
                            service: sc.service.clone(),
                        });
                    }
                }
                Some(components) if !components.contains(sc.component.as_str()) => {
                    violations.push(Violation::UnknownComponent {
                        group: group.name.clone(),
                        service: sc.service.clone(),
                        component: sc.component.clone(),
                    });
                }
                Some(_) => {}
            }
        }

        if let Some(parent) = &group.inherits {
            if !group_names.contains(parent.as_str()) {
                violations.push(Violation::UnknownParent {
                    group: group.name.clone(),
                    parent: parent.clone(),
                });
            }
        }
    }

    violations.extend(inheritance_cycles(blueprint).into_iter().map(Violation::ConfigCycle));

    let mut template_groups = BTreeSet::new();
    for group in &template.host_groups {
        if !group_names.contains(group.name.as_str()) {
            violations.push(Violation::UnknownTemplateGroup(group.name.clone()));
        }
        if !template_groups.insert(group.name.as_str()) {
            violations.push(Violation::DuplicateTemplateGroup(group.name.clone()));
        }
    }

    violations
}

/// Every distinct cycle in the `inherits` graph, rotated to start at its
/// smallest member and closed with that member again.
fn inheritance_cycles(blueprint: &Blueprint) -> BTreeSet<Vec<String>> {
    let mut parents: BTreeMap<&str, &str> = BTreeMap::new();
    for group in &blueprint.host_groups {
        if let Some(parent) = &group.inherits {
            parents.entry(group.name.as_str()).or_insert(parent.as_str());
        }
    }

    let mut cycles = BTreeSet::new();
    for &start in parents.keys() {
        let mut path: Vec<&str> = vec![start];
        let mut current = start;
        while let Some(&parent) = parents.get(current) {
            if let Some(pos) = path.iter().position(|name| *name == parent) {
                let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
                let min = cycle
                    .iter()
                    .enumerate()
                    .min_by(|a, b| a.1.cmp(b.1))
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                cycle.rotate_left(min);
                cycle.push(cycle[0].clone());
                cycles.insert(cycle);
                break;
            }
            path.push(parent);
            current = parent;
        }
    }
    cycles
}

fn assemble(blueprint: &Blueprint, template: &ClusterTemplate, revision: u32) -> ClusterTopology {
    let templates: BTreeMap<&str, &HostGroupTemplate> = template
        .host_groups
        .iter()
        .map(|group| (group.name.as_str(), group))
        .collect();

    // Own layer of each group: blueprint overrides, then template overrides.
    let own_layers: BTreeMap<&str, PropertyMap> = blueprint
        .host_groups
        .iter()
        .map(|group| {
            let mut layer = group.configuration.clone();
            if let Some(tmpl) = templates.get(group.name.as_str()) {
                layer.extend(tmpl.configuration.clone());
            }
            (group.name.as_str(), layer)
        })
        .collect();
    let parents: BTreeMap<&str, Option<&str>> = blueprint
        .host_groups
        .iter()
        .map(|group| (group.name.as_str(), group.inherits.as_deref()))
        .collect();

    let mut cluster_config = blueprint.configuration.clone();
    cluster_config.extend(template.configuration.clone());

    let host_groups = blueprint
        .host_groups
        .iter()
        .map(|group| {
            let mut chain = vec![group.name.as_str()];
            let mut current = group.name.as_str();
            while let Some(&Some(parent)) = parents.get(current) {
                chain.push(parent);
                current = parent;
            }
            let config_layers = chain
                .iter()
                .rev()
                .filter_map(|name| own_layers.get(name).cloned())
                .collect();

            let tmpl = templates.get(group.name.as_str());
            let hosts = tmpl.map(|t| t.hosts.clone()).unwrap_or_default();
            let host_count = tmpl
                .and_then(|t| t.host_count)
                .or_else(|| (!hosts.is_empty()).then(|| hosts.len() as u32));

            HostGroup {
                name: group.name.clone(),
                components: group.components.iter().cloned().collect(),
                host_count,
                hosts,
                config_layers,
            }
        })
        .collect();

    ClusterTopology {
        cluster_id: template.cluster_id.clone(),
        blueprint: blueprint.name.clone(),
        revision,
        cluster_config,
        host_groups,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use clusterforge_models::{HostGroupDefinition, ServiceDefinition};

    pub(crate) fn props(pairs: &[(&str, &str)]) -> PropertyMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    pub(crate) fn group(name: &str, components: &[(&str, &str)]) -> HostGroupDefinition {
        HostGroupDefinition {
            name: name.to_string(),
            components: components.iter().map(|(s, c)| ServiceComponent::new(*s, *c)).collect(),
            inherits: None,
            configuration: PropertyMap::new(),
        }
    }

    pub(crate) fn hdfs_blueprint() -> Blueprint {
        Blueprint {
            name: "hdfs-bp".to_string(),
            services: vec![
                ServiceDefinition {
                    name: "HDFS".to_string(),
                    components: vec!["NAMENODE".to_string(), "DATANODE".to_string()],
                },
                ServiceDefinition {
                    name: "ZOOKEEPER".to_string(),
                    components: vec!["ZOOKEEPER_SERVER".to_string()],
                },
            ],
            host_groups: vec![
                group("master", &[("HDFS", "NAMENODE"), ("ZOOKEEPER", "ZOOKEEPER_SERVER")]),
                group("worker", &[("HDFS", "DATANODE")]),
            ],
            configuration: props(&[("hdfs-site/dfs.replication", "3")]),
        }
    }

    pub(crate) fn template(cluster_id: &str, groups: &[(&str, Option<u32>)]) -> ClusterTemplate {
        ClusterTemplate {
            cluster_id: cluster_id.to_string(),
            blueprint: "hdfs-bp".to_string(),
            configuration: PropertyMap::new(),
            host_groups: groups
                .iter()
                .map(|(name, count)| HostGroupTemplate {
                    name: name.to_string(),
                    host_count: *count,
                    hosts: Vec::new(),
                    configuration: PropertyMap::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_build_valid_topology() {
        let topology = build_topology(&hdfs_blueprint(), &template("c1", &[("master", Some(1))])).unwrap();
        assert_eq!(topology.cluster_id(), "c1");
        assert_eq!(topology.revision(), 1);
        assert_eq!(topology.host_groups().len(), 2);
        assert_eq!(topology.host_group("master").unwrap().host_count(), Some(1));
        assert_eq!(topology.host_group("worker").unwrap().host_count(), None);
        assert_eq!(topology.host_group("master").unwrap().components().count(), 2);
    }

    #[test]
    fn test_explicit_hosts_imply_host_count() {
        let mut tmpl = template("c1", &[("worker", None)]);
        tmpl.host_groups[0].hosts = vec!["w1".to_string(), "w2".to_string()];
        let topology = build_topology(&hdfs_blueprint(), &tmpl).unwrap();
        let worker = topology.host_group("worker").unwrap();
        assert_eq!(worker.host_count(), Some(2));
        assert_eq!(worker.hosts(), ["w1".to_string(), "w2".to_string()]);
    }

    #[test]
    fn test_reports_all_violations_at_once() {
        let mut blueprint = hdfs_blueprint();
        blueprint.host_groups.push(group("master", &[("YARN", "RESOURCEMANAGER")]));
        blueprint.host_groups.push(group("edge", &[("HDFS", "JOURNALNODE")]));

        let mut tmpl = template("", &[("gateway", None)]);
        tmpl.blueprint = "other".to_string();

        let err = build_topology(&blueprint, &tmpl).unwrap_err();
        let v = &err.violations;
        assert!(v.contains(&Violation::EmptyClusterId));
        assert!(v.contains(&Violation::BlueprintMismatch {
            template: "other".to_string(),
            blueprint: "hdfs-bp".to_string()
        }));
        assert!(v.contains(&Violation::DuplicateHostGroup("master".to_string())));
        assert!(v.contains(&Violation::UnknownService {
            group: "master".to_string(),
            service: "YARN".to_string()
        }));
        assert!(v.contains(&Violation::UnknownComponent {
            group: "edge".to_string(),
            service: "HDFS".to_string(),
            component: "JOURNALNODE".to_string()
        }));
        assert!(v.contains(&Violation::UnknownTemplateGroup("gateway".to_string())));
        assert_eq!(v.len(), 6);
    }

    #[test]
    fn test_rejects_inheritance_cycle() {
        let mut blueprint = hdfs_blueprint();
        blueprint.host_groups[0].inherits = Some("worker".to_string());
        blueprint.host_groups[1].inherits = Some("master".to_string());

        let err = build_topology(&blueprint, &template("c1", &[])).unwrap_err();
        assert_eq!(
            err.violations,
            vec![Violation::ConfigCycle(vec![
                "master".to_string(),
                "worker".to_string(),
                "master".to_string()
            ])]
        );
    }

    #[test]
    fn test_rejects_self_inheritance_and_unknown_parent() {
        let mut blueprint = hdfs_blueprint();
        blueprint.host_groups[0].inherits = Some("master".to_string());
        blueprint.host_groups[1].inherits = Some("ghost".to_string());

        let err = build_topology(&blueprint, &template("c1", &[])).unwrap_err();
        assert!(err
            .violations
            .contains(&Violation::ConfigCycle(vec!["master".to_string(), "master".to_string()])));
        assert!(err.violations.contains(&Violation::UnknownParent {
            group: "worker".to_string(),
            parent: "ghost".to_string()
        }));
    }

    #[test]
    fn test_resolve_config_layers() {
        let mut blueprint = hdfs_blueprint();
        blueprint.configuration = props(&[("core/a", "bp"), ("core/b", "bp"), ("core/c", "bp")]);
        blueprint.host_groups[0].configuration = props(&[("core/b", "master"), ("core/d", "master")]);
        blueprint.host_groups[1].inherits = Some("master".to_string());
        blueprint.host_groups[1].configuration = props(&[("core/d", "worker")]);

        let mut tmpl = template("c1", &[("worker", None)]);
        tmpl.configuration = props(&[("core/a", "cluster")]);
        tmpl.host_groups[0].configuration = props(&[("core/c", "worker-tmpl")]);

        let topology = build_topology(&blueprint, &tmpl).unwrap();

        let master = topology.resolve_config("master").unwrap();
        assert_eq!(
            master,
            props(&[
                ("core/a", "cluster"),
                ("core/b", "master"),
                ("core/c", "bp"),
                ("core/d", "master"),
            ])
        );

        let worker = resolve_config(&topology, "worker").unwrap();
        assert_eq!(worker["core/a"], "cluster");
        assert_eq!(worker["core/b"], "master");
        assert_eq!(worker["core/c"], "worker-tmpl");
        assert_eq!(worker["core/d"], "worker");

        assert!(resolve_config(&topology, "gateway").is_none());
    }

    #[test]
    fn test_rebuild_bumps_revision() {
        let blueprint = hdfs_blueprint();
        let first = build_topology(&blueprint, &template("c1", &[("worker", Some(2))])).unwrap();
        let second = rebuild_topology(&first, &blueprint, &template("c1", &[("worker", Some(5))])).unwrap();
        assert_eq!(second.revision(), 2);
        assert_eq!(second.host_group("worker").unwrap().host_count(), Some(5));

        let err = rebuild_topology(&first, &blueprint, &template("c2", &[])).unwrap_err();
        assert_eq!(
            err.violations,
            vec![Violation::ClusterMismatch {
                expected: "c1".to_string(),
                actual: "c2".to_string()
            }]
        );
    }
}
