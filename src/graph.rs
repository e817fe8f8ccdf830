//! Dependency graph over every resource of every unit. Cross-unit edges come
//! from imports: a parameter fed by another unit's output depends on the
//! resources that output references.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::stack::StackUnit;
use crate::template::references;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ResourceAddress {
    pub unit: String,
    pub logical_id: String,
}

impl ResourceAddress {
    pub fn new<U: AsRef<str>, L: AsRef<str>>(unit: U, logical_id: L) -> Self {
        Self {
            unit: unit.as_ref().into(),
            logical_id: logical_id.as_ref().into(),
        }
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.unit, self.logical_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    /// node => resource type
    nodes: BTreeMap<ResourceAddress, String>,
    /// node => nodes it directly depends on
    edges: BTreeMap<ResourceAddress, BTreeSet<ResourceAddress>>,
    /// unit => units it imports from
    unit_edges: BTreeMap<String, BTreeSet<String>>,
}

impl ResourceGraph {
    pub fn from_units(units: &[StackUnit]) -> Result<Self> {
        let by_name: BTreeMap<&str, &StackUnit> =
            units.iter().map(|u| (u.name.as_str(), u)).collect();
        let mut graph = ResourceGraph::default();

        for unit in units {
            graph.unit_edges.entry(unit.name.clone()).or_default();
            for (logical_id, resource) in unit.template.resources.iter() {
                graph
                    .nodes
                    .insert(ResourceAddress::new(&unit.name, logical_id), resource.ty.clone());
            }
        }

        for unit in units {
            // parameter => resources in the exporting unit it stands for
            let mut imported: BTreeMap<&str, BTreeSet<ResourceAddress>> = BTreeMap::new();
            for import in unit.imports.iter() {
                let exporter = by_name.get(import.from_unit.as_str()).ok_or_else(|| {
                    Error::template(
                        &unit.name,
                        format!("Import of '{}' from unknown unit '{}'", import.parameter, import.from_unit),
                    )
                })?;
                let output = exporter.template.outputs.get(&import.output).ok_or_else(|| {
                    Error::template(
                        &unit.name,
                        format!("Unit '{}' has no output '{}'", import.from_unit, import.output),
                    )
                })?;
                if !unit.template.parameters.contains_key(&import.parameter) {
                    return Err(Error::template(
                        &unit.name,
                        format!("Import targets undeclared parameter '{}'", import.parameter),
                    ));
                }
                let targets = references(&output.value)
                    .into_iter()
                    .filter(|id| exporter.template.resources.contains_key(id))
                    .map(|id| ResourceAddress::new(&exporter.name, id))
                    .collect();
                imported.insert(import.parameter.as_str(), targets);
                graph
                    .unit_edges
                    .entry(unit.name.clone())
                    .or_default()
                    .insert(exporter.name.clone());
            }

            for logical_id in unit.template.resources.keys() {
                let addr = ResourceAddress::new(&unit.name, logical_id);
                let mut deps = BTreeSet::new();
                for dep in unit.template.dependencies_of(logical_id) {
                    if unit.template.resources.contains_key(&dep) {
                        deps.insert(ResourceAddress::new(&unit.name, &dep));
                    } else if let Some(targets) = imported.get(dep.as_str()) {
                        deps.extend(targets.iter().cloned());
                    }
                }
                graph.edges.insert(addr, deps);
            }
        }
        Ok(graph)
    }

    /// transitive dependencies of `addr`
    pub fn dependencies(&self, addr: &ResourceAddress) -> BTreeSet<ResourceAddress> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&ResourceAddress> = vec![addr];
        while let Some(next) = stack.pop() {
            if let Some(deps) = self.edges.get(next) {
                for dep in deps {
                    if seen.insert(dep.clone()) {
                        stack.push(dep);
                    }
                }
            }
        }
        seen
    }

    pub fn depends_on(&self, addr: &ResourceAddress, other: &ResourceAddress) -> bool {
        self.dependencies(addr).contains(other)
    }

    /// Kahn's algorithm. ties are broken by address so the order is stable.
    pub fn topological_order(&self) -> Result<Vec<ResourceAddress>> {
        let edges: BTreeMap<&ResourceAddress, BTreeSet<&ResourceAddress>> = self
            .nodes
            .keys()
            .map(|a| {
                let deps = self
                    .edges
                    .get(a)
                    .map(|d| d.iter().collect())
                    .unwrap_or_default();
                (a, deps)
            })
            .collect();
        topological(&edges)
            .map(|order| order.into_iter().cloned().collect())
            .map_err(|cycle| {
                let names: Vec<String> = cycle.iter().map(|a| a.to_string()).collect();
                Error::template("", format!("Dependency cycle between {}", names.join(", ")))
            })
    }

    /// order in which units have to be deployed so every import is
    /// available before the importing unit is submitted.
    pub fn unit_order(&self) -> Result<Vec<String>> {
        let edges: BTreeMap<&String, BTreeSet<&String>> = self
            .unit_edges
            .iter()
            .map(|(u, deps)| (u, deps.iter().collect()))
            .collect();
        topological(&edges)
            .map(|order| order.into_iter().cloned().collect())
            .map_err(|cycle| {
                let names: Vec<String> = cycle.iter().map(|u| u.to_string()).collect();
                Error::template("", format!("Import cycle between units {}", names.join(", ")))
            })
    }
}

/// returns the nodes left over on a cycle as the error.
fn topological<'a, T: Ord>(
    edges: &BTreeMap<&'a T, BTreeSet<&'a T>>,
) -> std::result::Result<Vec<&'a T>, Vec<&'a T>> {
    let mut remaining: BTreeMap<&'a T, BTreeSet<&'a T>> = edges
        .iter()
        .map(|(n, deps)| (*n, deps.iter().filter(|d| edges.contains_key(*d)).copied().collect()))
        .collect();
    let mut out = Vec::with_capacity(remaining.len());
    loop {
        let ready: Vec<&'a T> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(n, _)| *n)
            .collect();
        if ready.is_empty() {
            break;
        }
        for node in ready {
            remaining.remove(node);
            for deps in remaining.values_mut() {
                deps.remove(node);
            }
            out.push(node);
        }
    }
    if remaining.is_empty() {
        Ok(out)
    } else {
        Err(remaining.into_keys().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::Import;
    use crate::template::{get_att, get_ref, Resource, Template, TemplateParameter};
    use serde_json::json;

    fn units() -> Vec<StackUnit> {
        let mut exporter = Template::default();
        exporter
            .add_resource("Cert", Resource::new("AWS::CertificateManager::Certificate", json!({})))
            .unwrap();
        exporter.add_output("CertArn", "arn", get_ref("Cert"));

        let mut importer = Template::default();
        importer
            .add_parameter(
                "CertArn",
                TemplateParameter { ty: "String".into(), description: None, allowed_pattern: None },
            )
            .unwrap();
        importer.add_resource("Bucket", Resource::new("AWS::S3::Bucket", json!({}))).unwrap();
        importer
            .add_resource(
                "Dist",
                Resource::new(
                    "AWS::CloudFront::Distribution",
                    json!({ "Cert": get_ref("CertArn"), "Origin": get_att("Bucket", "RegionalDomainName") }),
                ),
            )
            .unwrap();
        importer
            .add_resource("Record", Resource::new("AWS::Route53::RecordSet", json!({})).depends_on("Dist"))
            .unwrap();

        vec![
            StackUnit {
                name: "web".into(),
                region: "us-west-1".into(),
                template: importer,
                imports: vec![Import {
                    parameter: "CertArn".into(),
                    from_unit: "certs".into(),
                    output: "CertArn".into(),
                }],
            },
            StackUnit {
                name: "certs".into(),
                region: "us-east-1".into(),
                template: exporter,
                imports: vec![],
            },
        ]
    }

    #[test]
    fn imports_become_cross_unit_edges() {
        let graph = ResourceGraph::from_units(&units()).unwrap();
        let dist = ResourceAddress::new("web", "Dist");
        let cert = ResourceAddress::new("certs", "Cert");
        let record = ResourceAddress::new("web", "Record");
        assert!(graph.depends_on(&dist, &cert));
        assert!(graph.depends_on(&record, &cert));
        assert!(!graph.depends_on(&cert, &dist));
        assert!(!graph.depends_on(&ResourceAddress::new("web", "Bucket"), &cert));
    }

    #[test]
    fn order_respects_dependencies() {
        let graph = ResourceGraph::from_units(&units()).unwrap();
        let order = graph.topological_order().unwrap();
        let pos = |u: &str, l: &str| order.iter().position(|a| a == &ResourceAddress::new(u, l)).unwrap();
        assert!(pos("certs", "Cert") < pos("web", "Dist"));
        assert!(pos("web", "Bucket") < pos("web", "Dist"));
        assert!(pos("web", "Dist") < pos("web", "Record"));
        assert_eq!(graph.unit_order().unwrap(), vec!["certs".to_string(), "web".to_string()]);
    }

    #[test]
    fn cycles_are_rejected() {
        let mut t = Template::default();
        t.add_resource("A", Resource::new("X::Y::Z", json!({ "B": get_ref("B") }))).unwrap();
        t.add_resource("B", Resource::new("X::Y::Z", json!({})).depends_on("A")).unwrap();
        let unit = StackUnit { name: "u".into(), region: "us-east-1".into(), template: t, imports: vec![] };
        let graph = ResourceGraph::from_units(&[unit]).unwrap();
        let err = graph.topological_order().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn import_of_missing_output_is_rejected() {
        let mut u = units();
        u[0].imports[0].output = "Nope".into();
        assert!(ResourceGraph::from_units(&u).is_err());
    }
}
