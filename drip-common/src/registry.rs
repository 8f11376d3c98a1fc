//! Static table mapping tool names to downstream endpoints and their
//! parameter schemas. Built once, never mutated, no I/O.

use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;

use crate::job::JobParams;

/// HTTP method used against the downstream API. The default registry is
/// POST throughout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolMethod {
    Get,
    Post,
}

impl From<ToolMethod> for http::Method {
    fn from(val: ToolMethod) -> Self {
        match val {
            ToolMethod::Get => http::Method::GET,
            ToolMethod::Post => http::Method::POST,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolEntry {
    pub name: &'static str,
    pub endpoint_path: &'static str,
    pub method: ToolMethod,
    pub required_params: &'static [&'static str],
    pub optional_params: &'static [&'static str],
    pub category: &'static str,
}

/// Result of checking a params object against a tool's required set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub ok: bool,
    /// Required parameter names that are absent, null, or empty string.
    pub missing: Vec<&'static str>,
}

pub struct ToolRegistry {
    entries: HashMap<&'static str, ToolEntry>,
}

impl ToolRegistry {
    fn from_entries(entries: Vec<ToolEntry>) -> Self {
        let entries = entries.into_iter().map(|e| (e.name, e)).collect();
        Self { entries }
    }

    pub fn lookup(&self, tool: &str) -> Option<&ToolEntry> {
        self.entries.get(tool)
    }

    /// Check that every required parameter is present and non-empty.
    /// Unknown tools are reported as not ok with no missing names; callers
    /// are expected to `lookup` first for a better error.
    pub fn validate(&self, tool: &str, params: &JobParams) -> ValidationOutcome {
        let Some(entry) = self.lookup(tool) else {
            return ValidationOutcome {
                ok: false,
                missing: Vec::new(),
            };
        };

        let missing: Vec<&'static str> = entry
            .required_params
            .iter()
            .filter(|name| {
                match params.get(**name) {
                    None => true,
                    Some(value) => {
                        value.is_null() || value.as_str().is_some_and(|s| s.is_empty())
                    }
                }
            })
            .copied()
            .collect();

        ValidationOutcome {
            ok: missing.is_empty(),
            missing,
        }
    }

    /// All known tool names, sorted for stable API output.
    pub fn tools(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.entries.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn by_category(&self) -> BTreeMap<&'static str, Vec<&'static str>> {
        let mut grouped: BTreeMap<&'static str, Vec<&'static str>> = BTreeMap::new();
        for entry in self.entries.values() {
            grouped.entry(entry.category).or_default().push(entry.name);
        }
        for names in grouped.values_mut() {
            names.sort_unstable();
        }
        grouped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Derive a display category from the tool name. LinkedIn tools split into
/// companies, posts (posts, comments, reactions), and profiles; the other
/// platforms group by prefix.
fn categorize(name: &str) -> &'static str {
    if name.contains("linkedin") {
        if name.contains("company") || name.contains("companies") {
            return "linkedin-companies";
        }
        if name.contains("post") || name.contains("comment") || name.contains("reaction") {
            return "linkedin-posts";
        }
        return "linkedin-profiles";
    }
    if name.contains("instagram") {
        return "instagram";
    }
    if name.contains("twitter") {
        return "twitter";
    }
    if name.contains("reddit") {
        return "reddit";
    }
    if name.contains("sec") {
        return "sec";
    }
    "other"
}

macro_rules! tool {
    ($name:literal, $path:literal, required: [$($req:literal),*], optional: [$($opt:literal),*]) => {
        ToolEntry {
            name: $name,
            endpoint_path: $path,
            method: ToolMethod::Post,
            required_params: &[$($req),*],
            optional_params: &[$($opt),*],
            category: categorize($name),
        }
    };
}

static DEFAULT_REGISTRY: Lazy<ToolRegistry> = Lazy::new(|| {
    ToolRegistry::from_entries(vec![
        tool!("get_linkedin_profile", "/api/linkedin/profile", required: ["user"], optional: []),
        tool!("get_linkedin_profile_posts", "/api/linkedin/profile/posts", required: ["user"], optional: ["page"]),
        tool!("get_linkedin_profile_reactions", "/api/linkedin/profile/reactions", required: ["user"], optional: ["page"]),
        tool!("get_linkedin_company", "/api/linkedin/company", required: ["company"], optional: []),
        tool!("get_linkedin_company_posts", "/api/linkedin/company/posts", required: ["company"], optional: ["page"]),
        tool!("get_linkedin_company_employees", "/api/linkedin/company/employees", required: ["companyId"], optional: ["page"]),
        tool!("search_linkedin_companies", "/api/linkedin/companies/search", required: ["keyword"], optional: ["page", "location"]),
        tool!("get_linkedin_post", "/api/linkedin/post", required: ["post"], optional: []),
        tool!("get_linkedin_post_comments", "/api/linkedin/post/comments", required: ["post"], optional: ["page"]),
        tool!("get_linkedin_post_reactions", "/api/linkedin/post/reactions", required: ["post"], optional: ["page"]),
        tool!("get_instagram_profile", "/api/instagram/profile", required: ["user"], optional: []),
        tool!("get_instagram_posts", "/api/instagram/posts", required: ["user"], optional: ["count"]),
        tool!("get_twitter_profile", "/api/twitter/profile", required: ["user"], optional: []),
        tool!("get_twitter_posts", "/api/twitter/posts", required: ["user"], optional: ["count"]),
        tool!("get_reddit_posts", "/api/reddit/posts", required: ["subreddit"], optional: ["sort", "count"]),
        tool!("search_sec_filings", "/api/sec/filings/search", required: ["query"], optional: ["formType", "dateFrom", "dateTo"]),
    ])
});

/// The process-wide registry. Construction is cheap and the table is
/// immutable, so a shared static keeps call sites simple.
pub fn default_registry() -> &'static ToolRegistry {
    &DEFAULT_REGISTRY
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn params(pairs: &[(&str, serde_json::Value)]) -> JobParams {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn test_lookup_known_tool() {
        let registry = default_registry();
        let entry = registry.lookup("get_linkedin_profile").unwrap();
        assert_eq!(entry.endpoint_path, "/api/linkedin/profile");
        assert_eq!(entry.method, ToolMethod::Post);
        assert_eq!(entry.required_params, &["user"]);
    }

    #[test]
    fn test_lookup_unknown_tool() {
        assert!(default_registry().lookup("nope").is_none());
    }

    #[test]
    fn test_validate_ok() {
        let outcome = default_registry().validate(
            "get_linkedin_profile",
            &params(&[("user", json!("https://linkedin.com/in/x"))]),
        );
        assert!(outcome.ok);
        assert!(outcome.missing.is_empty());
    }

    #[test]
    fn test_validate_flags_absent_null_and_empty() {
        let registry = default_registry();

        let outcome = registry.validate("get_linkedin_profile", &JobParams::new());
        assert!(!outcome.ok);
        assert_eq!(outcome.missing, vec!["user"]);

        let outcome = registry.validate(
            "get_linkedin_profile",
            &params(&[("user", serde_json::Value::Null)]),
        );
        assert_eq!(outcome.missing, vec!["user"]);

        let outcome =
            registry.validate("get_linkedin_profile", &params(&[("user", json!(""))]));
        assert_eq!(outcome.missing, vec!["user"]);
    }

    #[test]
    fn test_validate_ignores_optional_params() {
        let outcome = default_registry().validate(
            "search_sec_filings",
            &params(&[("query", json!("10-K"))]),
        );
        assert!(outcome.ok);
    }

    #[test]
    fn test_categories() {
        assert_eq!(categorize("get_linkedin_company_posts"), "linkedin-companies");
        assert_eq!(categorize("get_linkedin_post_comments"), "linkedin-posts");
        assert_eq!(categorize("get_linkedin_profile_reactions"), "linkedin-posts");
        assert_eq!(categorize("get_linkedin_profile"), "linkedin-profiles");
        assert_eq!(categorize("get_instagram_posts"), "instagram");
        assert_eq!(categorize("get_twitter_profile"), "twitter");
        assert_eq!(categorize("get_reddit_posts"), "reddit");
        assert_eq!(categorize("search_sec_filings"), "sec");
        assert_eq!(categorize("mystery_tool"), "other");
    }

    #[test]
    fn test_by_category_covers_every_tool() {
        let registry = default_registry();
        let grouped = registry.by_category();
        let total: usize = grouped.values().map(Vec::len).sum();
        assert_eq!(total, registry.len());
        assert!(grouped.contains_key("linkedin-profiles"));
        assert!(grouped["sec"].contains(&"search_sec_filings"));
    }

    #[test]
    fn test_tools_sorted() {
        let names = default_registry().tools();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
    }
}
