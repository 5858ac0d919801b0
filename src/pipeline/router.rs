//! Router stage: evaluates routing rules against each envelope and attaches the matched
//! topic(s) to `metadata.routing_keys` for the publish stage to consume.

use crate::config::{RouterConfig, RoutingStrategy};
use crate::error::CoreError;
use crate::pipeline::{PipelineContext, PipelineData, Stage};
use async_trait::async_trait;
use lru::LruCache;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// A single routing condition. `Function` holds a plain closure rather than a serializable
/// expression, matching how the rest of the pipeline favors in-process composition over a DSL.
pub enum Condition {
    Exact { field: Field, value: String },
    Pattern { field: Field, regex: regex::Regex },
    Function(Box<dyn Fn(&PipelineData) -> bool + Send + Sync>),
    All(Vec<Condition>),
    Any(Vec<Condition>),
}

#[derive(Copy, Clone, Debug)]
pub enum Field {
    Exchange,
    Symbol,
    DataType,
}

impl Field {
    fn extract(self, data: &PipelineData) -> &str {
        match self {
            Field::Exchange => &data.metadata.exchange,
            Field::Symbol => &data.metadata.symbol,
            Field::DataType => &data.metadata.data_type,
        }
    }
}

impl Condition {
    fn evaluate(&self, data: &PipelineData) -> bool {
        match self {
            Condition::Exact { field, value } => field.extract(data) == value,
            Condition::Pattern { field, regex } => regex.is_match(field.extract(data)),
            Condition::Function(f) => f(data),
            Condition::All(conditions) => conditions.iter().all(|c| c.evaluate(data)),
            Condition::Any(conditions) => conditions.iter().any(|c| c.evaluate(data)),
        }
    }
}

/// A routing rule: if `condition` matches, the envelope is tagged with `topics`. Rules are
/// identified by `name` for `remove_rule`/`update_rule`.
pub struct Rule {
    pub name: String,
    pub condition: Condition,
    pub topics: Vec<String>,
    pub priority: i32,
}

struct CacheEntry {
    topics: Vec<String>,
    inserted_at: Instant,
}

#[derive(Default)]
struct RouterMetrics {
    total_routed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    fallback_used: AtomicU64,
    duplications: AtomicU64,
}

/// Point-in-time counters for a [`RouterStage`].
#[derive(Clone, Copy, Debug, Default)]
pub struct RouterMetricsSnapshot {
    pub total_routed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub fallback_used: u64,
    pub duplications: u64,
    pub rules_count: usize,
}

/// A priority-ordered rule list plus an optional fallback topic and LRU+TTL match cache.
pub struct RouterStage {
    config: RouterConfig,
    rules: Vec<Rule>,
    fallback_topic: Option<String>,
    cache: Mutex<LruCache<String, CacheEntry>>,
    metrics: RouterMetrics,
}

impl RouterStage {
    pub fn new(config: RouterConfig, fallback_topic: Option<String>) -> Self {
        let capacity = NonZeroUsize::new(config.cache_size.max(1)).unwrap();
        Self {
            config,
            rules: Vec::new(),
            fallback_topic,
            cache: Mutex::new(LruCache::new(capacity)),
            metrics: RouterMetrics::default(),
        }
    }

    /// Rules are kept sorted by descending priority so `FirstMatch`/`PriorityBased` evaluate in
    /// the right order regardless of insertion order. Any change to the rule set invalidates the
    /// match cache, since cached topics were computed against the old rule set.
    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
        self.rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        self.invalidate_cache();
    }

    /// Removes the rule named `name`. Returns whether a rule was actually removed.
    pub fn remove_rule(&mut self, name: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|rule| rule.name != name);
        let removed = self.rules.len() != before;
        if removed {
            self.invalidate_cache();
        }
        removed
    }

    /// Replaces the rule with the same name as `rule`. Returns whether a matching rule existed.
    pub fn update_rule(&mut self, rule: Rule) -> bool {
        match self.rules.iter_mut().find(|existing| existing.name == rule.name) {
            Some(existing) => {
                *existing = rule;
                self.rules.sort_by(|a, b| b.priority.cmp(&a.priority));
                self.invalidate_cache();
                true
            }
            None => false,
        }
    }

    fn invalidate_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    pub fn metrics(&self) -> RouterMetricsSnapshot {
        let hits = self.metrics.cache_hits.load(Ordering::Relaxed);
        let misses = self.metrics.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        RouterMetricsSnapshot {
            total_routed: self.metrics.total_routed.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            fallback_used: self.metrics.fallback_used.load(Ordering::Relaxed),
            duplications: self.metrics.duplications.load(Ordering::Relaxed),
            rules_count: self.rules.len(),
        }
    }

    fn cache_key(data: &PipelineData) -> String {
        format!("{}|{}|{}", data.metadata.exchange, data.metadata.symbol, data.metadata.data_type)
    }

    fn route(&self, data: &PipelineData) -> Vec<String> {
        if !self.config.enable_caching {
            return self.evaluate(data);
        }

        let key = Self::cache_key(data);
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get(&key) {
                if entry.inserted_at.elapsed() < self.config.cache_ttl {
                    self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return entry.topics.clone();
                }
            }
        }

        self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
        let topics = self.evaluate(data);
        self.cache.lock().unwrap().put(
            key,
            CacheEntry { topics: topics.clone(), inserted_at: Instant::now() },
        );
        topics
    }

    /// Every matching rule's topics, in descending-priority order (rules are kept sorted that
    /// way by `add_rule`/`update_rule`).
    fn collect_all_matches(&self, data: &PipelineData) -> Vec<String> {
        let mut topics = Vec::new();
        for rule in &self.rules {
            if rule.condition.evaluate(data) {
                topics.extend(rule.topics.iter().cloned());
            }
        }
        topics
    }

    fn evaluate(&self, data: &PipelineData) -> Vec<String> {
        match self.config.routing_strategy {
            RoutingStrategy::FirstMatch => self
                .rules
                .iter()
                .find(|rule| rule.condition.evaluate(data))
                .map(|rule| rule.topics.clone())
                .unwrap_or_default(),
            RoutingStrategy::PriorityBased => self.collect_all_matches(data),
            RoutingStrategy::AllMatches => self.collect_all_matches(data),
        }
    }
}

#[async_trait]
impl Stage for RouterStage {
    fn name(&self) -> &str {
        "router"
    }

    async fn process(
        &self,
        mut data: PipelineData,
        _ctx: &PipelineContext,
    ) -> Result<Option<PipelineData>, CoreError> {
        self.metrics.total_routed.fetch_add(1, Ordering::Relaxed);

        let mut topics = self.route(&data);
        if topics.is_empty() {
            if !self.config.enable_fallback {
                // Passed through unchanged: the next stage sees no routing keys.
                return Ok(Some(data));
            }
            match &self.fallback_topic {
                Some(fallback) => {
                    topics.push(fallback.clone());
                    self.metrics.fallback_used.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    return Err(CoreError::pipeline("no matching route and no fallback configured"));
                }
            }
        }

        // `routing_keys` always carries every matched destination; `enable_duplication` only
        // controls whether the fan-out is marked for downstream consumers via the
        // `duplicatedTargets` attribute, not whether destinations are dropped.
        if self.config.enable_duplication && topics.len() > 1 {
            self.metrics.duplications.fetch_add(1, Ordering::Relaxed);
            data.attributes.insert(
                "duplicatedTargets".to_string(),
                Value::Array(topics.iter().cloned().map(Value::String).collect()),
            );
        }

        data.metadata.routing_keys = Some(topics);
        Ok(Some(data))
    }
}
