//! Tool catalog merged across services.
//!
//! Each tool is advertised as `<service>_<name>`; the route table maps that
//! external name back to the originating service and canonical tool name.

use std::collections::HashMap;

use crate::core::llm::ToolSpec;
use crate::core::mcp::ToolDescriptor;
use crate::core::service::ServiceTag;

/// Function names accepted by chat-completions style APIs.
const MAX_EXTERNAL_NAME_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRoute {
    pub service: ServiceTag,
    pub canonical_name: String,
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub external_name: String,
    pub descriptor: ToolDescriptor,
    pub route: ToolRoute,
}

#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    entries: Vec<CatalogEntry>,
    routes: HashMap<String, usize>,
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

fn clamp(name: &str, suffix: &str) -> String {
    let room = MAX_EXTERNAL_NAME_LEN.saturating_sub(suffix.len());
    // Sanitized names are ASCII, so byte slicing is safe.
    let base = &name[..name.len().min(room)];
    format!("{}{}", base, suffix)
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one service's tools. Names that still collide after prefixing
    /// get a numeric suffix.
    pub fn add_service(&mut self, service: &ServiceTag, tools: Vec<ToolDescriptor>) {
        for descriptor in tools {
            let base = sanitize(&format!("{}_{}", service, descriptor.name));
            let mut external_name = clamp(&base, "");
            let mut n = 2;
            while self.routes.contains_key(&external_name) {
                external_name = clamp(&base, &format!("_{}", n));
                n += 1;
            }

            self.routes.insert(external_name.clone(), self.entries.len());
            self.entries.push(CatalogEntry {
                external_name,
                route: ToolRoute {
                    service: service.clone(),
                    canonical_name: descriptor.name.clone(),
                },
                descriptor,
            });
        }
    }

    pub fn resolve(&self, external_name: &str) -> Option<&ToolRoute> {
        self.routes.get(external_name).map(|&i| &self.entries[i].route)
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.entries
            .iter()
            .map(|e| ToolSpec {
                name: e.external_name.clone(),
                description: match &e.descriptor.description {
                    Some(d) if !d.is_empty() => format!("[{}] {}", e.route.service, d),
                    _ => format!("[{}] {}", e.route.service, e.route.canonical_name),
                },
                parameters: e.descriptor.input_schema.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: Some(format!("{} description", name)),
            input_schema: json!({ "type": "object" }),
        }
    }

    fn tag(s: &str) -> ServiceTag {
        ServiceTag::new(s).unwrap()
    }

    #[test]
    fn identical_names_stay_distinct_across_services() {
        let mut catalog = ToolCatalog::new();
        catalog.add_service(&tag("svcA"), vec![tool("list_items")]);
        catalog.add_service(&tag("svcB"), vec![tool("list_items")]);

        let names: Vec<_> = catalog.specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["svcA_list_items", "svcB_list_items"]);

        let route = catalog.resolve("svcB_list_items").unwrap();
        assert_eq!(route.service, tag("svcB"));
        assert_eq!(route.canonical_name, "list_items");
    }

    #[test]
    fn prefix_collisions_get_suffixes() {
        // "a_b" + "c" and "a" + "b_c" both render as "a_b_c".
        let mut catalog = ToolCatalog::new();
        catalog.add_service(&tag("a_b"), vec![tool("c")]);
        catalog.add_service(&tag("a"), vec![tool("b_c")]);

        assert_eq!(catalog.resolve("a_b_c").unwrap().service, tag("a_b"));
        let second = catalog.resolve("a_b_c_2").unwrap();
        assert_eq!(second.service, tag("a"));
        assert_eq!(second.canonical_name, "b_c");
    }

    #[test]
    fn odd_characters_are_sanitized_but_routed_verbatim() {
        let mut catalog = ToolCatalog::new();
        catalog.add_service(&tag("files"), vec![tool("search.files v2")]);
        let spec = &catalog.specs()[0];
        assert_eq!(spec.name, "files_search_files_v2");
        assert_eq!(catalog.resolve(&spec.name).unwrap().canonical_name, "search.files v2");
    }

    #[test]
    fn long_names_are_clamped() {
        let mut catalog = ToolCatalog::new();
        let long = "x".repeat(100);
        catalog.add_service(&tag("svc"), vec![tool(&long), tool(&long)]);
        let specs = catalog.specs();
        assert!(specs.iter().all(|s| s.name.len() <= MAX_EXTERNAL_NAME_LEN));
        assert_ne!(specs[0].name, specs[1].name);
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn unknown_names_do_not_resolve() {
        let mut catalog = ToolCatalog::new();
        catalog.add_service(&tag("svc"), vec![tool("x")]);
        assert!(catalog.resolve("x").is_none());
        assert!(catalog.resolve("other_x").is_none());
    }

    #[test]
    fn descriptions_name_the_service() {
        let mut catalog = ToolCatalog::new();
        catalog.add_service(
            &tag("notes"),
            vec![ToolDescriptor {
                name: "find".into(),
                description: None,
                input_schema: json!({}),
            }],
        );
        assert_eq!(catalog.specs()[0].description, "[notes] find");
    }
}
