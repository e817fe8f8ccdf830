//! CloudFormation template model. Resources carry their properties as
//! raw json so each resource module can declare exactly what it needs.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};

pub const TEMPLATE_FORMAT_VERSION: &str = "2010-09-09";

/// pseudo parameters that can be `Ref`'d without being declared.
pub const PSEUDO_PARAMETERS: &[&str] = &[
    "AWS::AccountId",
    "AWS::NotificationARNs",
    "AWS::NoValue",
    "AWS::Partition",
    "AWS::Region",
    "AWS::StackId",
    "AWS::StackName",
    "AWS::URLSuffix",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "Type")]
    pub ty: String,
    #[serde(rename = "Properties")]
    pub properties: Value,
    #[serde(rename = "DependsOn", default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(rename = "DeletionPolicy", default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<String>,
    #[serde(rename = "UpdateReplacePolicy", default, skip_serializing_if = "Option::is_none")]
    pub update_replace_policy: Option<String>,
}

impl Resource {
    pub fn new<S: AsRef<str>>(ty: S, properties: Value) -> Self {
        Self {
            ty: ty.as_ref().into(),
            properties,
            depends_on: vec![],
            deletion_policy: None,
            update_replace_policy: None,
        }
    }

    /// removed together with the stack instead of being retained.
    pub fn destroy_with_stack(mut self) -> Self {
        self.deletion_policy = Some("Delete".into());
        self.update_replace_policy = Some("Delete".into());
        self
    }

    pub fn depends_on<S: AsRef<str>>(mut self, logical_id: S) -> Self {
        self.depends_on.push(logical_id.as_ref().into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateParameter {
    #[serde(rename = "Type")]
    pub ty: String,
    #[serde(rename = "Description", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "AllowedPattern", default, skip_serializing_if = "Option::is_none")]
    pub allowed_pattern: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceOutput {
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Value")]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub version: String,
    #[serde(rename = "Description", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "Parameters", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, TemplateParameter>,
    #[serde(rename = "Resources")]
    pub resources: BTreeMap<String, Resource>,
    #[serde(rename = "Outputs", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, ResourceOutput>,
}

impl Default for Template {
    fn default() -> Self {
        Self {
            version: TEMPLATE_FORMAT_VERSION.to_string(),
            description: None,
            parameters: Default::default(),
            resources: Default::default(),
            outputs: Default::default(),
        }
    }
}

impl Template {
    pub fn add_resource<S: AsRef<str>>(&mut self, logical_id: S, resource: Resource) -> Result<()> {
        let logical_id = logical_id.as_ref();
        verify_resource_name(logical_id).map_err(|e| Error::template(logical_id, e))?;
        if self.resources.contains_key(logical_id) || self.parameters.contains_key(logical_id) {
            return Err(Error::template(
                logical_id,
                format!("Duplicate logical id {logical_id}"),
            ));
        }
        self.resources.insert(logical_id.to_string(), resource);
        Ok(())
    }

    pub fn add_parameter<S: AsRef<str>>(&mut self, name: S, parameter: TemplateParameter) -> Result<()> {
        let name = name.as_ref();
        verify_resource_name(name).map_err(|e| Error::template(name, e))?;
        if self.resources.contains_key(name) {
            return Err(Error::template(name, format!("Parameter {name} collides with a resource")));
        }
        self.parameters.insert(name.to_string(), parameter);
        Ok(())
    }

    pub fn add_output<S: AsRef<str>, D: AsRef<str>>(&mut self, name: S, description: D, value: Value) {
        self.outputs.insert(
            name.as_ref().to_string(),
            ResourceOutput {
                description: description.as_ref().to_string(),
                value,
            },
        );
    }

    /// every `Ref`, `Fn::GetAtt`, `Fn::Sub` and `DependsOn` target must be
    /// declared in this template.
    pub fn validate(&self, stack_name: &str) -> Result<()> {
        let known = |id: &str| {
            self.resources.contains_key(id)
                || self.parameters.contains_key(id)
                || PSEUDO_PARAMETERS.contains(&id)
        };
        for (logical_id, resource) in self.resources.iter() {
            for target in references(&resource.properties) {
                if !known(&target) {
                    return Err(Error::template(
                        stack_name,
                        format!("Resource '{logical_id}' references undeclared '{target}'"),
                    ));
                }
            }
            for target in resource.depends_on.iter() {
                if !self.resources.contains_key(target) {
                    return Err(Error::template(
                        stack_name,
                        format!("Resource '{logical_id}' depends on undeclared '{target}'"),
                    ));
                }
            }
        }
        for (name, output) in self.outputs.iter() {
            for target in references(&output.value) {
                if !known(&target) {
                    return Err(Error::template(
                        stack_name,
                        format!("Output '{name}' references undeclared '{target}'"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// logical ids (resources or parameters) the given resource depends on,
    /// explicitly or through intrinsic functions.
    pub fn dependencies_of(&self, logical_id: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        if let Some(resource) = self.resources.get(logical_id) {
            out.extend(references(&resource.properties));
            out.extend(resource.depends_on.iter().cloned());
        }
        out.retain(|id| !PSEUDO_PARAMETERS.contains(&id.as_str()));
        out
    }

    /// pretty so the template reads nicely in the CloudFormation console.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::template("", format!("Failed to serialize template\n{e}")))
    }
}

pub fn get_ref(logical_id: &str) -> Value {
    json!({ "Ref": logical_id })
}

pub fn get_att(logical_id: &str, attribute: &str) -> Value {
    json!({ "Fn::GetAtt": [logical_id, attribute] })
}

pub fn sub(template: &str) -> Value {
    json!({ "Fn::Sub": template })
}

/// names referenced via `${Name}` or `${Name.Attr}` in an `Fn::Sub` string.
/// `${!Literal}` escapes are skipped.
pub fn sub_variables(s: &str) -> Vec<String> {
    let mut out = vec![];
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let end = match after.find('}') {
            Some(e) => e,
            None => break,
        };
        let var = &after[..end];
        if !var.starts_with('!') && !var.is_empty() {
            let name = var.split('.').next().unwrap_or(var);
            out.push(name.to_string());
        }
        rest = &after[end + 1..];
    }
    out
}

/// collects the logical ids referenced by intrinsic functions inside `value`.
pub fn references(value: &Value) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_references(value, &mut out);
    out
}

fn collect_references(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(target)) = map.get("Ref") {
                    out.insert(target.clone());
                    return;
                }
                if let Some(att) = map.get("Fn::GetAtt") {
                    match att {
                        Value::Array(parts) => {
                            if let Some(Value::String(target)) = parts.first() {
                                out.insert(target.clone());
                            }
                        }
                        Value::String(s) => {
                            if let Some(target) = s.split('.').next() {
                                out.insert(target.to_string());
                            }
                        }
                        _ => {}
                    }
                    return;
                }
                if let Some(sub_val) = map.get("Fn::Sub") {
                    match sub_val {
                        Value::String(s) => out.extend(sub_variables(s)),
                        Value::Array(parts) => {
                            let locals: BTreeSet<String> = match parts.get(1) {
                                Some(Value::Object(vars)) => {
                                    for v in vars.values() {
                                        collect_references(v, out);
                                    }
                                    vars.keys().cloned().collect()
                                }
                                _ => BTreeSet::new(),
                            };
                            if let Some(Value::String(s)) = parts.first() {
                                out.extend(sub_variables(s).into_iter().filter(|v| !locals.contains(v)));
                            }
                        }
                        _ => {}
                    }
                    return;
                }
            }
            for v in map.values() {
                collect_references(v, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_references(v, out);
            }
        }
        _ => {}
    }
}

/// logical ids: alphanumeric, 1 to 255 characters.
pub fn verify_resource_name(resource_name: &str) -> std::result::Result<(), String> {
    if resource_name.len() > 255 {
        return Err(format!("Invalid resource name {:?}\nmust be less than 255 characters", resource_name));
    }
    if resource_name.is_empty() {
        return Err(format!("Invalid resource name {:?}\nMust contain at least 1 character", resource_name));
    }
    if !resource_name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(format!("Invalid resource name {:?}\nMust contain only alphanumeric characters [A-Za-z0-9]", resource_name));
    }
    Ok(())
}

/// A stack name can contain only alphanumeric characters (case sensitive) and hyphens.
/// It must start with an alphabetical character and can't be longer than 128 characters.
pub fn validate_stack_name(stack_name: &str) -> std::result::Result<String, String> {
    let restriction = "Must only consist of alphanumeric characters and hyphens, Must start with an alphabetical character, and cannot be longer than 128 characters.";
    let invalid = || format!("Invalid stack name {:?}\n{}", stack_name, restriction);
    match stack_name.chars().next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return Err(invalid()),
    }
    if !stack_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(invalid());
    }
    if stack_name.len() > 128 {
        return Err(invalid());
    }
    Ok(stack_name.to_string())
}
