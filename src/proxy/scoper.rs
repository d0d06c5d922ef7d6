//! Project scoping of object names and labels

use crate::engine::Filters;
use std::collections::BTreeMap;

/// Label carrying the project an object belongs to
pub const PROJECT_LABEL: &str = "com.docker.project.id";

/// Alternative label used by pipeline runners
pub const PIPELINE_LABEL: &str = "com.docker.pipeline.scope";

/// Maps client-visible names to engine names and back
pub trait Scoper: Send + Sync {
    /// Engine name of a client name; empty stays empty
    fn scope_name(&self, name: &str) -> String;

    /// Client name of an engine name; names outside the project pass unchanged
    fn descope_name(&self, name: &str) -> String;

    /// Mark a label set as belonging to the project
    fn add_labels(&self, labels: &mut BTreeMap<String, String>);

    fn is_in_scope(&self, labels: &BTreeMap<String, String>) -> bool;

    /// Restrict a list filter to the project and scope its `name` values
    fn update_filter(&self, filters: &mut Filters);
}

/// Scoper keyed on a project name and a label key
#[derive(Debug, Clone)]
pub struct LabelScoper {
    project: String,
    label_key: String,
    prefix: String,
}

impl LabelScoper {
    pub fn new(project: impl Into<String>, label_key: impl Into<String>) -> Self {
        let project = project.into();
        Self {
            prefix: format!("{}_", project),
            project,
            label_key: label_key.into(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn label_key(&self) -> &str {
        &self.label_key
    }
}

impl Scoper for LabelScoper {
    fn scope_name(&self, name: &str) -> String {
        if name.is_empty() {
            return String::new();
        }
        format!("{}{}", self.prefix, name)
    }

    fn descope_name(&self, name: &str) -> String {
        name.strip_prefix(&self.prefix).unwrap_or(name).to_string()
    }

    fn add_labels(&self, labels: &mut BTreeMap<String, String>) {
        labels.insert(self.label_key.clone(), self.project.clone());
    }

    fn is_in_scope(&self, labels: &BTreeMap<String, String>) -> bool {
        labels.get(&self.label_key) == Some(&self.project)
    }

    fn update_filter(&self, filters: &mut Filters) {
        filters.add("label", format!("{}={}", self.label_key, self.project));
        let names: Vec<String> = filters
            .get("name")
            .into_iter()
            .map(|name| self.scope_name(name))
            .collect();
        filters.set("name", names);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_round_trip() {
        let scoper = LabelScoper::new("myproject", PROJECT_LABEL);
        for name in ["foo", "a_b", "myproject", "x-1"] {
            assert_eq!(scoper.descope_name(&scoper.scope_name(name)), name);
        }
        assert_eq!(scoper.scope_name(""), "");
        assert_eq!(scoper.scope_name("foo"), "myproject_foo");
        assert_eq!(scoper.descope_name("other_foo"), "other_foo");
    }

    #[test]
    fn test_labels() {
        let scoper = LabelScoper::new("p", PIPELINE_LABEL);
        let mut labels = BTreeMap::new();
        assert!(!scoper.is_in_scope(&labels));
        scoper.add_labels(&mut labels);
        assert_eq!(labels[PIPELINE_LABEL], "p");
        assert!(scoper.is_in_scope(&labels));
        labels.insert(PIPELINE_LABEL.to_string(), "q".to_string());
        assert!(!scoper.is_in_scope(&labels));
    }

    #[test]
    fn test_update_filter() {
        let scoper = LabelScoper::new("myproject", PROJECT_LABEL);
        let mut filters = Filters::from_json(r#"{"name":["foo"]}"#).unwrap();
        scoper.update_filter(&mut filters);
        assert_eq!(
            filters.to_json(),
            r#"{"label":["com.docker.project.id=myproject"],"name":["myproject_foo"]}"#
        );

        let mut empty = Filters::new();
        scoper.update_filter(&mut empty);
        assert!(!empty.contains("name"));
        assert_eq!(empty.get("label"), vec!["com.docker.project.id=myproject"]);
    }
}
