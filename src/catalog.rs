//! Tool catalog - the nine operations and their prompt templates
//!
//! Each tool is data: a prompt template, the variables it requires,
//! defaults for the optional ones, and the search query variants feeding
//! its research step. Prompt wording lives in `templates/` and is embedded
//! at compile time. Catalog construction validates every template's
//! placeholders against the declared variables, so a wiring mistake fails
//! at startup instead of mid-call.

use serde_json::{json, Map, Value};

use crate::assemble::placeholders;
use crate::error::Error;
use crate::Result;

const IDENTIFY_INDUSTRY_NICHES: &str = include_str!("../templates/identify_industry_niches.txt");
const DRILL_UVZ: &str = include_str!("../templates/drill_uvz.txt");
const RESEARCH_UVZ_TOPIC: &str = include_str!("../templates/research_uvz_topic.txt");
const VALIDATE_UVZ_DEMAND: &str = include_str!("../templates/validate_uvz_demand.txt");
const GENERATE_EBOOK_OUTLINE: &str = include_str!("../templates/generate_ebook_outline.txt");
const EXPAND_CHAPTER: &str = include_str!("../templates/expand_chapter.txt");
const GENERATE_CHAPTER_CONTENT: &str = include_str!("../templates/generate_chapter_content.txt");
const COMPETITIVE_ANALYSIS: &str = include_str!("../templates/competitive_analysis.txt");
const MARKETING_LANDING_PAGE: &str = include_str!("../templates/marketing_landing_page.txt");
const MARKETING_EMAIL_SEQUENCE: &str = include_str!("../templates/marketing_email_sequence.txt");
const MARKETING_SOCIAL_POSTS: &str = include_str!("../templates/marketing_social_posts.txt");

/// How a tool picks its prompt template.
#[derive(Debug, Clone, Copy)]
pub enum TemplateSource {
    /// One fixed template.
    Fixed(&'static str),
    /// Chosen by the value of a variable, e.g. `copy_type`.
    Keyed {
        variable: &'static str,
        choices: &'static [(&'static str, &'static str)],
    },
}

/// Declarative description of one tool operation.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub template: TemplateSource,
    /// Variables the caller must supply.
    pub required: &'static [&'static str],
    /// Optional variables with their defaults.
    pub optional: &'static [(&'static str, &'static str)],
    /// Variables carried through verbatim (prior-step outputs keep their
    /// formatting).
    pub raw: &'static [&'static str],
    /// Search query variants with `{placeholders}`; empty means the tool
    /// runs without a research step.
    pub query_variants: &'static [&'static str],
    /// Variable that caps the research result count, when the tool
    /// exposes one to the caller.
    pub result_cap: Option<&'static str>,
}

impl ToolSpec {
    pub fn runs_research(&self) -> bool {
        !self.query_variants.is_empty()
    }

    fn declared(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.required.to_vec();
        names.extend(self.optional.iter().map(|(name, _)| *name));
        names
    }

    /// JSON schema for the tool's arguments, in the shape the protocol
    /// layer advertises.
    pub fn parameters(&self) -> Value {
        let mut properties = Map::new();
        for &name in self.required {
            properties.insert(name.to_string(), json!({"type": "string"}));
        }
        for &(name, default) in self.optional {
            properties.insert(name.to_string(), json!({"type": "string", "default": default}));
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": self.required,
        })
    }

    fn validate(&self) -> Result<()> {
        let declared = self.declared();
        let check = |template: &str| -> Result<()> {
            for name in placeholders(template) {
                if !declared.iter().any(|d| *d == name) {
                    return Err(Error::Config(format!(
                        "tool '{}' template uses undeclared placeholder '{{{name}}}'",
                        self.name
                    )));
                }
            }
            Ok(())
        };

        match self.template {
            TemplateSource::Fixed(template) => check(template)?,
            TemplateSource::Keyed { variable, choices } => {
                if !declared.contains(&variable) {
                    return Err(Error::Config(format!(
                        "tool '{}' selects templates by undeclared variable '{variable}'",
                        self.name
                    )));
                }
                for (_, template) in choices {
                    check(template)?;
                }
            }
        }

        // The pipeline takes the research topic from the first required
        // variable, so a research tool must declare one.
        if self.runs_research() && self.required.is_empty() {
            return Err(Error::Config(format!(
                "tool '{}' declares query variants but no required variable to search on",
                self.name
            )));
        }

        if let Some(cap) = self.result_cap {
            if !declared.contains(&cap) {
                return Err(Error::Config(format!(
                    "tool '{}' caps results by undeclared variable '{cap}'",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// The validated set of tool operations.
pub struct Catalog {
    specs: Vec<ToolSpec>,
}

impl Catalog {
    /// Build the default nine-tool catalog.
    pub fn new() -> Result<Self> {
        let specs = default_specs();
        for spec in &specs {
            spec.validate()?;
        }
        Ok(Self { specs })
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.specs.iter().find(|spec| spec.name == name)
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }
}

fn default_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "identify_industry_niches",
            description: "Analyze an industry and identify specific niches with UVZ opportunities.",
            template: TemplateSource::Fixed(IDENTIFY_INDUSTRY_NICHES),
            required: &["industry"],
            optional: &[("depth", "3")],
            raw: &[],
            query_variants: &[],
            result_cap: None,
        },
        ToolSpec {
            name: "drill_uvz",
            description: "Drill into a niche to pin down its Unique Value Zone.",
            template: TemplateSource::Fixed(DRILL_UVZ),
            required: &["niche"],
            optional: &[("focus_area", "general opportunities")],
            raw: &[],
            query_variants: &[],
            result_cap: None,
        },
        ToolSpec {
            name: "research_uvz_topic",
            description: "Research a UVZ topic with web search and AI analysis of the sources.",
            template: TemplateSource::Fixed(RESEARCH_UVZ_TOPIC),
            required: &["topic"],
            optional: &[("sources", "10")],
            raw: &[],
            query_variants: &["{topic} guide tutorial best practices"],
            result_cap: Some("sources"),
        },
        ToolSpec {
            name: "validate_uvz_demand",
            description: "Validate market demand for a UVZ from search trends and discussions.",
            template: TemplateSource::Fixed(VALIDATE_UVZ_DEMAND),
            required: &["uvz_description"],
            optional: &[],
            raw: &[],
            query_variants: &[
                "{uvz_description} problems",
                "{uvz_description} solutions needed",
                "how to {uvz_description}",
            ],
            result_cap: None,
        },
        ToolSpec {
            name: "generate_ebook_outline",
            description: "Generate a comprehensive ebook outline from UVZ research.",
            template: TemplateSource::Fixed(GENERATE_EBOOK_OUTLINE),
            required: &["topic"],
            optional: &[("audience", "general audience"), ("length", "50")],
            raw: &[],
            query_variants: &[],
            result_cap: None,
        },
        ToolSpec {
            name: "expand_chapter",
            description: "Expand an outline chapter into detailed sections with talking points.",
            template: TemplateSource::Fixed(EXPAND_CHAPTER),
            required: &["chapter_title"],
            optional: &[("key_points", "Cover the main aspects")],
            raw: &["key_points"],
            query_variants: &[],
            result_cap: None,
        },
        ToolSpec {
            name: "generate_chapter_content",
            description: "Write full chapter content from an expanded outline.",
            template: TemplateSource::Fixed(GENERATE_CHAPTER_CONTENT),
            required: &["chapter_title", "outline"],
            optional: &[("tone", "professional")],
            raw: &["outline"],
            query_variants: &[],
            result_cap: None,
        },
        ToolSpec {
            name: "competitive_analysis",
            description: "Analyze competitors in a UVZ space to find differentiation angles.",
            template: TemplateSource::Fixed(COMPETITIVE_ANALYSIS),
            required: &["uvz"],
            optional: &[("competitors", "5")],
            raw: &[],
            query_variants: &["{uvz} courses guides products solutions"],
            result_cap: Some("competitors"),
        },
        ToolSpec {
            name: "generate_marketing_copy",
            description: "Generate landing page, email sequence, or social post copy for a product.",
            template: TemplateSource::Keyed {
                variable: "copy_type",
                choices: &[
                    ("landing_page", MARKETING_LANDING_PAGE),
                    ("email_sequence", MARKETING_EMAIL_SEQUENCE),
                    ("social_posts", MARKETING_SOCIAL_POSTS),
                ],
            },
            required: &["product_title", "uvz"],
            optional: &[("copy_type", "landing_page")],
            raw: &[],
            query_variants: &[],
            result_cap: None,
        },
    ]
}
