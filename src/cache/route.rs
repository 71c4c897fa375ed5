//! Per-route cache registration.
//!
//! Read routes describe how to build a key and which tags to attach;
//! mutating routes describe which tags to purge once they succeed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use axum::http::{Method, StatusCode};
use serde_json::Value;
use tracing::warn;

use super::config::CacheConfig;
use super::keys::{KeyCodec, Params};
use super::rules::{AffectedIds, ChangedFields, Mutation, class};
use super::tags::Tag;

/// Upper bound on tags harvested from one response body.
const MAX_BODY_TAGS: usize = 256;

/// Authenticated principal, inserted as a request extension by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal(pub String);

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
struct ParamTag {
    class: String,
    param: String,
}

#[derive(Debug, Clone)]
struct BodyScan {
    class: String,
    field: String,
}

/// Cache registration for a read route.
#[derive(Debug, Clone)]
pub struct CacheRoute {
    resource_type: String,
    ttl: Option<Duration>,
    per_principal: bool,
    skip: bool,
    identifier_param: Option<String>,
    tags: Vec<Tag>,
    path_tags: Vec<ParamTag>,
    query_tags: Vec<ParamTag>,
    body_scans: Vec<BodyScan>,
}

/// What a request resolved to on a cacheable route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub key: String,
    pub ttl: Duration,
}

impl CacheRoute {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            ttl: None,
            per_principal: false,
            skip: false,
            identifier_param: None,
            tags: Vec::new(),
            path_tags: Vec::new(),
            query_tags: Vec::new(),
            body_scans: Vec::new(),
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Responses depend on who asks: the principal id goes into the key and
    /// requests without one are never cached.
    pub fn per_principal(mut self) -> Self {
        self.per_principal = true;
        self
    }

    pub fn skip(mut self) -> Self {
        self.skip = true;
        self
    }

    /// Use this path parameter as the key identifier instead of the full path.
    pub fn identifier(mut self, param: impl Into<String>) -> Self {
        self.identifier_param = Some(param.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<Tag>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Tag `{class}:{value of path param}`.
    pub fn tag_path_param(mut self, class: impl Into<String>, param: impl Into<String>) -> Self {
        self.path_tags.push(ParamTag {
            class: class.into(),
            param: param.into(),
        });
        self
    }

    /// Tag `{class}:{value of query param}` when the parameter is present.
    pub fn tag_query_param(mut self, class: impl Into<String>, param: impl Into<String>) -> Self {
        self.query_tags.push(ParamTag {
            class: class.into(),
            param: param.into(),
        });
        self
    }

    /// Tag `{class}:{value}` for every `field` found anywhere in the JSON body.
    pub fn scan_body(mut self, class: impl Into<String>, field: impl Into<String>) -> Self {
        self.body_scans.push(BodyScan {
            class: class.into(),
            field: field.into(),
        });
        self
    }

    pub fn scan_categories(self) -> Self {
        self.scan_body(class::CATEGORY, "category")
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn is_skipped(&self) -> bool {
        self.skip
    }

    pub fn is_per_principal(&self) -> bool {
        self.per_principal
    }

    /// Resolve the cache key and TTL for one request, or `None` when the
    /// request must not be cached.
    pub fn resolve(
        &self,
        keys: &KeyCodec,
        config: &CacheConfig,
        path: &str,
        path_params: &BTreeMap<String, String>,
        query: &Params,
        principal: Option<&Principal>,
    ) -> Option<ResolvedKey> {
        if self.skip {
            return None;
        }
        let base = match &self.identifier_param {
            Some(param) => path_params.get(param)?.clone(),
            None => path.trim_matches('/').to_string(),
        };
        let identifier = match (self.per_principal, principal) {
            (true, Some(principal)) => format!("{}:{base}", principal.id()),
            (true, None) => return None,
            (false, _) => base,
        };
        Some(ResolvedKey {
            key: keys.generate_key(&self.resource_type, &identifier, query),
            ttl: self
                .ttl
                .unwrap_or_else(|| config.ttl_for(Some(&self.resource_type))),
        })
    }

    /// Tags for a captured response: static, parameter-derived and body-derived.
    pub fn derive_tags(
        &self,
        path_params: &BTreeMap<String, String>,
        query: &Params,
        principal: Option<&Principal>,
        body: &Value,
    ) -> Vec<Tag> {
        let owner = if self.per_principal {
            principal.map(Principal::id)
        } else {
            None
        };
        let mut tags = BTreeSet::new();

        for tag in &self.tags {
            match owner {
                Some(owner) => {
                    tags.insert(Tag::new(format!("{owner}:{tag}")));
                    tags.insert(tag.clone());
                }
                None => {
                    tags.insert(tag.clone());
                }
            }
        }

        let param_values = self
            .path_tags
            .iter()
            .filter_map(|spec| path_params.get(&spec.param).map(|value| (spec, value)))
            .chain(
                self.query_tags
                    .iter()
                    .filter_map(|spec| query.get(&spec.param).map(|value| (spec, value))),
            );
        for (spec, value) in param_values {
            if value.is_empty() {
                continue;
            }
            tags.insert(Tag::class(&spec.class));
            tags.insert(Tag::instance(&spec.class, value));
            if let Some(owner) = owner {
                tags.insert(Tag::principal_class(owner, &spec.class));
                tags.insert(Tag::principal(owner, &spec.class, value));
            }
        }

        let mut found = 0;
        for scan in &self.body_scans {
            let mut values = BTreeSet::new();
            collect_field(body, &scan.field, &mut values);
            if !values.is_empty() {
                tags.insert(Tag::class(&scan.class));
            }
            for value in values {
                if found >= MAX_BODY_TAGS {
                    break;
                }
                tags.insert(Tag::instance(&scan.class, &value));
                found += 1;
            }
        }

        tags.into_iter().collect()
    }
}

fn collect_field(value: &Value, field: &str, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            for (name, child) in map {
                if name == field {
                    match child {
                        Value::String(text) if !text.is_empty() => {
                            out.insert(text.clone());
                        }
                        Value::Number(number) => {
                            out.insert(number.to_string());
                        }
                        _ => {}
                    }
                }
                collect_field(child, field, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_field(item, field, out);
            }
        }
        _ => {}
    }
}

/// The parts of a mutating request visible to tag functions.
#[derive(Debug, Clone)]
pub struct MutationRequest {
    pub method: Method,
    pub path: String,
    pub path_params: BTreeMap<String, String>,
    pub query: Params,
    /// JSON body, or `Null` when absent or not JSON.
    pub payload: Value,
    pub principal: Option<Principal>,
}

#[derive(Debug, Clone)]
pub struct MutationResponse {
    pub status: StatusCode,
    /// JSON body, or `Null` when not JSON.
    pub body: Value,
}

pub type TagFn = Arc<dyn Fn(&MutationRequest, &MutationResponse) -> Vec<Tag> + Send + Sync>;
pub type MutationDetector = Arc<dyn Fn(&MutationRequest) -> Option<Mutation> + Send + Sync>;

/// Invalidation registration for a mutating route.
#[derive(Clone, Default)]
pub struct InvalidationRoute {
    tags: Vec<Tag>,
    dynamic: Option<TagFn>,
    detector: Option<MutationDetector>,
    skip: bool,
}

impl fmt::Debug for InvalidationRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationRoute")
            .field("tags", &self.tags)
            .field("dynamic", &self.dynamic.is_some())
            .field("detector", &self.detector.is_some())
            .field("skip", &self.skip)
            .finish()
    }
}

/// Tags to purge for one successful mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationPlan {
    pub tags: Vec<Tag>,
    pub mutation: Option<Mutation>,
}

impl InvalidationRoute {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(mut self, tag: impl Into<Tag>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags_from<F>(mut self, f: F) -> Self
    where
        F: Fn(&MutationRequest, &MutationResponse) -> Vec<Tag> + Send + Sync + 'static,
    {
        self.dynamic = Some(Arc::new(f));
        self
    }

    /// Always apply the rules for `mutation`.
    pub fn operation(self, mutation: Mutation) -> Self {
        self.detect(move |_| Some(mutation))
    }

    /// Pick the mutation kind per request.
    pub fn detect<F>(mut self, f: F) -> Self
    where
        F: Fn(&MutationRequest) -> Option<Mutation> + Send + Sync + 'static,
    {
        self.detector = Some(Arc::new(f));
        self
    }

    pub fn skip(mut self) -> Self {
        self.skip = true;
        self
    }

    pub fn is_skipped(&self) -> bool {
        self.skip
    }

    /// Union of static tags, the dynamic tag function and the rule table.
    /// A panicking tag function contributes nothing.
    pub fn plan(&self, request: &MutationRequest, response: &MutationResponse) -> InvalidationPlan {
        let mut tags: BTreeSet<Tag> = self.tags.iter().cloned().collect();

        if let Some(dynamic) = &self.dynamic {
            match catch_unwind(AssertUnwindSafe(|| dynamic(request, response))) {
                Ok(extra) => tags.extend(extra),
                Err(_) => warn!(
                    target = "tagcache::cache::route",
                    path = %request.path,
                    "Dynamic tag function panicked; ignoring its tags"
                ),
            }
        }

        let mutation = self
            .detector
            .as_ref()
            .and_then(|detect| catch_unwind(AssertUnwindSafe(|| detect(request))).ok().flatten());
        if let Some(mutation) = mutation {
            let ids = AffectedIds::from_params(
                request
                    .path_params
                    .iter()
                    .map(|(name, value)| (name.as_str(), value.as_str())),
                request.principal.as_ref().map(Principal::id),
            );
            let fields = ChangedFields::from_json(&request.payload);
            tags.extend(mutation.tags(&ids, &fields));
        }

        InvalidationPlan {
            tags: tags.into_iter().collect(),
            mutation,
        }
    }
}
