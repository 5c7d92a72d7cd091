//! Tool pipeline - sequences research, assembly, and completion
//!
//! One invocation flows: look up the tool, collect and sanitize its
//! variables, optionally gather research, assemble the prompt, and call
//! the governed completion client. The pipeline holds no cross-call
//! state; everything a later step needs is passed explicitly by the
//! caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::assemble::{substitute, ContextAssembler, PromptRequest};
use crate::catalog::{Catalog, TemplateSource, ToolSpec};
use crate::completion::{CompletionBackend, CompletionClient, GeminiBackend};
use crate::config::Config;
use crate::error::Error;
use crate::quota::{QuotaGovernor, QuotaLimits};
use crate::research::{DuckDuckGoClient, SearchAggregator, SearchClient};
use crate::Result;

/// Tool definition advertised to the protocol layer.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Successful tool invocation output.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResponse {
    pub text: String,
    pub tokens_used: Option<u32>,
    pub latency_ms: u64,
    /// True when the research step came back empty.
    pub research_degraded: bool,
}

/// Sequences the nine tool operations over the shared services.
pub struct ToolPipeline {
    catalog: Catalog,
    aggregator: SearchAggregator,
    completion: CompletionClient,
    assembler: ContextAssembler,
    max_search_results: usize,
    sanitizer: Regex,
}

impl ToolPipeline {
    pub fn new(
        catalog: Catalog,
        aggregator: SearchAggregator,
        completion: CompletionClient,
        assembler: ContextAssembler,
        max_search_results: usize,
    ) -> Result<Self> {
        Ok(Self {
            catalog,
            aggregator,
            completion,
            assembler,
            max_search_results,
            // Same character set the prompts are built from: word chars,
            // whitespace, hyphen, comma, period.
            sanitizer: Regex::new(r"[^\w\s\-,.]")
                .map_err(|e| Error::Config(format!("bad sanitizer pattern: {e}")))?,
        })
    }

    /// Wire the production pipeline from configuration: DuckDuckGo
    /// search, the Gemini backend, and a fresh quota governor.
    pub fn from_config(config: &Config) -> Result<Self> {
        let governor = Arc::new(QuotaGovernor::new(
            QuotaLimits::new(config.rpm_limit, config.daily_limit),
            Duration::from_millis(config.max_quota_wait_ms),
        ));
        let search: Arc<dyn SearchClient> = Arc::new(DuckDuckGoClient::new()?);
        let backend: Arc<dyn CompletionBackend> =
            Arc::new(GeminiBackend::new(&config.gemini_api_key, &config.model)?);

        Self::new(
            Catalog::new()?,
            SearchAggregator::new(search, config.max_context_bytes),
            CompletionClient::new(backend, governor),
            ContextAssembler::new(config.max_input_bytes),
            config.max_search_results,
        )
    }

    /// Definitions for every registered tool, for the protocol layer.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.catalog
            .specs()
            .iter()
            .map(|spec| ToolDefinition {
                name: spec.name.to_string(),
                description: spec.description.to_string(),
                parameters: spec.parameters(),
            })
            .collect()
    }

    /// Invoke one tool with a JSON object of named arguments.
    pub async fn invoke(&self, name: &str, args: &Value, identity: &str) -> Result<ToolResponse> {
        let spec = self
            .catalog
            .get(name)
            .ok_or_else(|| Error::Tool(format!("Unknown tool: {name}")))?;

        let variables = self.collect_variables(spec, args)?;
        let template = resolve_template(spec, &variables)?;

        info!(tool = name, identity, "invoking tool");

        let mut degraded = false;
        let research = if spec.runs_research() {
            let topic = variables
                .get(spec.required[0])
                .cloned()
                .unwrap_or_default();
            let variants: Vec<String> = spec
                .query_variants
                .iter()
                .map(|variant| substitute(variant, &variables))
                .collect::<Result<_>>()?;
            let cap = self.result_cap(spec, &variables);

            let bundle = self.aggregator.research(&topic, &variants, cap).await;
            if bundle.is_empty() {
                warn!(tool = name, "research degraded: no usable sources");
                degraded = true;
            }
            Some(bundle)
        } else {
            None
        };

        let request = PromptRequest {
            tool: name.to_string(),
            template: template.to_string(),
            variables,
            research,
        };
        let payload = self.assembler.assemble(&request)?;
        let completion = self.completion.complete(&payload, identity).await?;

        Ok(ToolResponse {
            text: completion.text,
            tokens_used: completion.tokens_used,
            latency_ms: completion.latency_ms,
            research_degraded: degraded,
        })
    }

    fn collect_variables(&self, spec: &ToolSpec, args: &Value) -> Result<HashMap<String, String>> {
        let mut variables = HashMap::new();

        for &name in spec.required {
            let value = arg_string(args, name).ok_or_else(|| {
                Error::Template(format!(
                    "missing required variable '{name}' for tool '{}'",
                    spec.name
                ))
            })?;
            variables.insert(name.to_string(), self.clean(spec, name, &value));
        }

        for &(name, default) in spec.optional {
            let value = arg_string(args, name).unwrap_or_else(|| default.to_string());
            variables.insert(name.to_string(), self.clean(spec, name, &value));
        }

        Ok(variables)
    }

    fn clean(&self, spec: &ToolSpec, name: &str, value: &str) -> String {
        if spec.raw.contains(&name) {
            value.to_string()
        } else {
            self.sanitizer.replace_all(value, "").trim().to_string()
        }
    }

    fn result_cap(&self, spec: &ToolSpec, variables: &HashMap<String, String>) -> usize {
        spec.result_cap
            .and_then(|name| variables.get(name))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .map(|n| n.min(self.max_search_results))
            .unwrap_or(self.max_search_results)
    }
}

fn arg_string(args: &Value, name: &str) -> Option<String> {
    match args.get(name)? {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn resolve_template(spec: &ToolSpec, variables: &HashMap<String, String>) -> Result<&'static str> {
    match spec.template {
        TemplateSource::Fixed(template) => Ok(template),
        TemplateSource::Keyed { variable, choices } => {
            let value = variables.get(variable).map(String::as_str).unwrap_or("");
            choices
                .iter()
                .find(|(key, _)| *key == value)
                .map(|(_, template)| *template)
                .ok_or_else(|| {
                    let known: Vec<&str> = choices.iter().map(|(key, _)| *key).collect();
                    Error::Tool(format!(
                        "Unknown {variable} '{value}'. Use one of: {}",
                        known.join(", ")
                    ))
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::FakeBackend;
    use crate::research::{FakeSearchClient, SearchHit};
    use serde_json::json;

    fn hit(url: &str, title: &str, snippet: &str) -> SearchHit {
        SearchHit {
            url: url.to_string(),
            title: title.to_string(),
            snippet: snippet.to_string(),
        }
    }

    fn pipeline(
        search: FakeSearchClient,
        backend: Arc<FakeBackend>,
    ) -> ToolPipeline {
        let governor = Arc::new(QuotaGovernor::new(
            QuotaLimits::new(60, 1500),
            Duration::from_millis(10),
        ));
        ToolPipeline::new(
            Catalog::new().unwrap(),
            SearchAggregator::new(Arc::new(search), 16_384),
            CompletionClient::new(backend, governor),
            ContextAssembler::new(49_152),
            10,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_required_fails_before_any_network_call() {
        let search = Arc::new(FakeSearchClient::new());
        let backend = Arc::new(FakeBackend::new().ok("never"));
        let governor = Arc::new(QuotaGovernor::new(
            QuotaLimits::new(60, 1500),
            Duration::from_millis(10),
        ));
        let pipeline = ToolPipeline::new(
            Catalog::new().unwrap(),
            SearchAggregator::new(search.clone(), 16_384),
            CompletionClient::new(backend.clone(), governor),
            ContextAssembler::new(49_152),
            10,
        )
        .unwrap();

        let err = pipeline
            .invoke("research_uvz_topic", &json!({}), "s")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Template(_)));
        assert_eq!(backend.calls(), 0);
        assert_eq!(
            search
                .search_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_tool() {
        let pipeline = pipeline(FakeSearchClient::new(), Arc::new(FakeBackend::new()));
        let err = pipeline.invoke("no_such_tool", &json!({}), "s").await.unwrap_err();
        assert!(matches!(err, Error::Tool(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invocation_without_research() {
        let backend = Arc::new(FakeBackend::new().ok("three fitness niches"));
        let pipeline = pipeline(FakeSearchClient::new(), backend.clone());

        let response = pipeline
            .invoke("identify_industry_niches", &json!({"industry": "fitness"}), "s")
            .await
            .unwrap();

        assert_eq!(response.text, "three fitness niches");
        assert!(!response.research_degraded);

        // Prompt carries the argument and the default depth.
        let prompts = backend.prompts.lock().unwrap();
        assert!(prompts[0].contains("fitness"));
        assert!(prompts[0].contains("identify 3 highly specific niches"));
        assert!(!prompts[0].contains("RESEARCH SOURCES"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_research_feeds_the_prompt() {
        let search = FakeSearchClient::new()
            .hits(
                "sourdough baking guide tutorial best practices",
                vec![hit("https://bread.example/starter", "Starter Guide", "feed daily")],
            )
            .text("https://bread.example/starter", "keep the starter warm and fed");
        let backend = Arc::new(FakeBackend::new().ok("report"));
        let pipeline = pipeline(search, backend.clone());

        let response = pipeline
            .invoke("research_uvz_topic", &json!({"topic": "sourdough baking"}), "s")
            .await
            .unwrap();

        assert!(!response.research_degraded);
        let prompts = backend.prompts.lock().unwrap();
        assert!(prompts[0].contains("RESEARCH SOURCES"));
        assert!(prompts[0].contains("keep the starter warm and fed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_research_degrades_but_succeeds() {
        // No scripted hits: every variant fails.
        let backend = Arc::new(FakeBackend::new().ok("validation without signals"));
        let pipeline = pipeline(FakeSearchClient::new(), backend.clone());

        let response = pipeline
            .invoke(
                "validate_uvz_demand",
                &json!({"uvz_description": "meal prep for night shift nurses"}),
                "s",
            )
            .await
            .unwrap();

        assert!(response.research_degraded);
        assert_eq!(response.text, "validation without signals");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_copy_type_is_rejected() {
        let backend = Arc::new(FakeBackend::new().ok("never"));
        let pipeline = pipeline(FakeSearchClient::new(), backend.clone());

        let err = pipeline
            .invoke(
                "generate_marketing_copy",
                &json!({"product_title": "Bread Course", "uvz": "sourdough", "copy_type": "billboard"}),
                "s",
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Tool(_)));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_copy_type_selects_template() {
        let backend = Arc::new(FakeBackend::new().ok("emails"));
        let pipeline = pipeline(FakeSearchClient::new(), backend.clone());

        pipeline
            .invoke(
                "generate_marketing_copy",
                &json!({"product_title": "Bread Course", "uvz": "sourdough", "copy_type": "email_sequence"}),
                "s",
            )
            .await
            .unwrap();

        let prompts = backend.prompts.lock().unwrap();
        assert!(prompts[0].contains("5-email launch sequence"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inputs_are_sanitized_but_raw_variables_pass_through() {
        let backend = Arc::new(FakeBackend::new().ok("chapter"));
        let pipeline = pipeline(FakeSearchClient::new(), backend.clone());

        pipeline
            .invoke(
                "generate_chapter_content",
                &json!({
                    "chapter_title": "Intro <script>alert(1)</script>",
                    "outline": "# Section One\n* point {a}",
                }),
                "s",
            )
            .await
            .unwrap();

        let prompts = backend.prompts.lock().unwrap();
        assert!(!prompts[0].contains("<script>"));
        assert!(prompts[0].contains("Intro scriptalert1script"));
        // Prior-step output keeps its markdown verbatim.
        assert!(prompts[0].contains("# Section One\n* point {a}"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_numeric_arguments_are_accepted() {
        let backend = Arc::new(FakeBackend::new().ok("outline"));
        let pipeline = pipeline(FakeSearchClient::new(), backend.clone());

        pipeline
            .invoke(
                "generate_ebook_outline",
                &json!({"topic": "bread", "length": 80}),
                "s",
            )
            .await
            .unwrap();

        let prompts = backend.prompts.lock().unwrap();
        assert!(prompts[0].contains("approximately 80 pages"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_definitions_cover_all_tools() {
        let pipeline = pipeline(FakeSearchClient::new(), Arc::new(FakeBackend::new()));
        let definitions = pipeline.definitions();
        assert_eq!(definitions.len(), 9);
        assert!(definitions.iter().all(|d| !d.description.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_cap_respects_caller_and_config() {
        let pipeline = pipeline(FakeSearchClient::new(), Arc::new(FakeBackend::new()));
        let spec = pipeline.catalog.get("research_uvz_topic").unwrap();

        let mut vars = HashMap::new();
        vars.insert("sources".to_string(), "3".to_string());
        assert_eq!(pipeline.result_cap(spec, &vars), 3);

        vars.insert("sources".to_string(), "500".to_string());
        assert_eq!(pipeline.result_cap(spec, &vars), 10);

        vars.insert("sources".to_string(), "junk".to_string());
        assert_eq!(pipeline.result_cap(spec, &vars), 10);
    }
}
