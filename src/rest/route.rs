//! Route signatures: the bucket key for a REST call.

use std::fmt;

use http::Method;

/// Method plus a path template in which only major parameters keep their value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteSignature {
    method: Method,
    template: String,
}

impl RouteSignature {
    /// Derive the signature for a concrete request path.
    ///
    /// Ids following `channels`, `guilds` and `webhooks` are major parameters
    /// and stay in the template, as does a webhook token. Every other numeric
    /// id becomes `:id`, interaction tokens become `:token`, and the emoji
    /// segment of a reaction route collapses to `:emoji`.
    pub fn new(method: Method, path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let mut template = String::with_capacity(path.len());
        for (index, &segment) in segments.iter().enumerate() {
            let previous = index.checked_sub(1).map(|i| segments[i]);
            let before_previous = index.checked_sub(2).map(|i| segments[i]);

            let rendered = match (before_previous, previous) {
                (_, Some("channels" | "guilds" | "webhooks")) if is_snowflake(segment) => segment,
                (Some("webhooks"), Some(id)) if is_snowflake(id) => segment,
                (Some("interactions"), Some(id)) if is_snowflake(id) => ":token",
                (_, Some("reactions")) => ":emoji",
                _ if is_snowflake(segment) => ":id",
                _ => segment,
            };
            template.push('/');
            template.push_str(rendered);
        }
        if template.is_empty() {
            template.push('/');
        }

        Self { method, template }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn template(&self) -> &str {
        &self.template
    }
}

impl fmt::Display for RouteSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.template)
    }
}

fn is_snowflake(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}
