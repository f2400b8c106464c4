use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use regex::{Captures, Regex};
use sha2::{Digest, Sha256};

use crate::error::ConfigurationError;
use crate::model::{CandidateGroup, Query};
use crate::normalize::{contains_diacritics, normalize};

const REQUIRED_VARIABLES: &[&str] = &["query", "candidate"];
const KNOWN_VARIABLES: &[&str] = &["query", "candidate", "source", "kind"];

const PREAMBLE: &str = "\
You are an expert in verifying Quranic verses and Hadith texts.

You are given two texts:
- query_text: may contain mistakes, partial phrases or slight variations; it is NOT guaranteed to be an exact excerpt.
- candidate_text: an exact, error-free excerpt of the source (type: {kind}).

";

const CRITERIA: &str = "\
Matching rules:
- For a Quranic verse (ayah), the query must appear literally inside the candidate, ignoring spacing.
- For a Hadith, small paraphrases or reordering are acceptable, but the core meaning and most key phrases must be present.

Example:
query_text: يسرنا القران للذكر
candidate_text: ولقد يسرنا القران للذكر فهل من مدكر
Answer: True

Example:
query_text: لقد ارسلنا من قبلك رسلا واتيناهم ايات
candidate_text: ولقد ارسلنا من قبلك في شيع الاولين
Answer: False

";

const WITH_DIACRITICS: &str =
    "Ignore all Arabic diacritics (tashkeel) in both texts when comparing them.\n";
const WITHOUT_DIACRITICS: &str = "Diacritics have already been removed from both texts.\n";

const SINGLE_SOURCE: &str = "The candidate is {source}.\n";
const MERGED_SOURCE: &str = "The candidate joins the consecutive verses {source} into one passage; the query may cover any contiguous part of it.\n";

const ANSWER: &str = "
Respond with exactly one word: True if the candidate matches the query, False otherwise.

query_text: {query}
candidate_text: {candidate}
Answer:";

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
struct TemplateKey {
    diacritics: bool,
    merged: bool,
}

#[derive(Debug, Clone)]
struct PromptTemplate {
    name: String,
    body: String,
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    strip_diacritics: bool,
    templates: HashMap<TemplateKey, PromptTemplate>,
    placeholder: Regex,
}

impl PromptBuilder {
    pub fn new(strip_diacritics: bool) -> Result<Self, ConfigurationError> {
        let mut templates = HashMap::new();
        for diacritics in [true, false] {
            for merged in [true, false] {
                let key = TemplateKey { diacritics, merged };
                templates.insert(key, builtin_template(key));
            }
        }
        Self::from_templates(strip_diacritics, templates)
    }

    /// Uses one caller-supplied template for every variant.
    pub fn with_override(
        strip_diacritics: bool,
        body: &str,
    ) -> Result<Self, ConfigurationError> {
        let mut templates = HashMap::new();
        for diacritics in [true, false] {
            for merged in [true, false] {
                templates.insert(
                    TemplateKey { diacritics, merged },
                    PromptTemplate {
                        name: "custom".to_string(),
                        body: body.to_string(),
                    },
                );
            }
        }
        Self::from_templates(strip_diacritics, templates)
    }

    /// Built-in templates, or the single template read from `template_path`.
    pub fn load(strip_diacritics: bool, template_path: Option<&Path>) -> anyhow::Result<Self> {
        match template_path {
            Some(path) => {
                let body = fs::read_to_string(path)
                    .with_context(|| format!("failed to read prompt template {}", path.display()))?;
                Self::with_override(strip_diacritics, &body)
                    .with_context(|| format!("invalid prompt template {}", path.display()))
            }
            None => Ok(Self::new(strip_diacritics)?),
        }
    }

    /// Digest of every template body; changes whenever the prompts would change.
    pub fn fingerprint(&self) -> String {
        let mut keys = self.templates.keys().copied().collect::<Vec<TemplateKey>>();
        keys.sort_by_key(|key| (key.diacritics, key.merged));

        let mut hasher = Sha256::new();
        for key in keys {
            if let Some(template) = self.templates.get(&key) {
                hasher.update([u8::from(key.diacritics), u8::from(key.merged)]);
                hasher.update(template.body.as_bytes());
                hasher.update([0_u8]);
            }
        }
        format!("{:x}", hasher.finalize())
    }

    fn from_templates(
        strip_diacritics: bool,
        templates: HashMap<TemplateKey, PromptTemplate>,
    ) -> Result<Self, ConfigurationError> {
        let placeholder = Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").map_err(|err| {
            ConfigurationError::InvalidSetting {
                name: "prompt_placeholder",
                reason: err.to_string(),
            }
        })?;

        let builder = Self {
            strip_diacritics,
            templates,
            placeholder,
        };
        for template in builder.templates.values() {
            builder.validate(template)?;
        }
        Ok(builder)
    }

    pub fn build(
        &self,
        query: &Query,
        group: &CandidateGroup,
    ) -> Result<String, ConfigurationError> {
        let candidate_text = normalize(&group.text, self.strip_diacritics);
        let key = TemplateKey {
            diacritics: contains_diacritics(&query.normalized_text)
                || contains_diacritics(&candidate_text),
            merged: group.is_merged(),
        };
        let template = self
            .templates
            .get(&key)
            .ok_or_else(|| ConfigurationError::InvalidSetting {
                name: "prompt_template",
                reason: format!("no template for {key:?}"),
            })?;

        let mut variables = HashMap::<&str, &str>::new();
        variables.insert("query", query.normalized_text.as_str());
        variables.insert("candidate", candidate_text.as_str());
        variables.insert("source", group.label.as_str());
        variables.insert("kind", query.kind.as_str());

        self.render(template, &variables)
    }

    fn validate(&self, template: &PromptTemplate) -> Result<(), ConfigurationError> {
        let mut found = Vec::<&str>::new();
        for captures in self.placeholder.captures_iter(&template.body) {
            let Some(variable) = captures.get(1).map(|value| value.as_str()) else {
                continue;
            };
            if !KNOWN_VARIABLES.contains(&variable) {
                return Err(ConfigurationError::UnknownTemplateVariable {
                    template: template.name.clone(),
                    variable: variable.to_string(),
                });
            }
            found.push(variable);
        }

        if let Some(missing) = REQUIRED_VARIABLES
            .iter()
            .find(|required| !found.contains(*required))
        {
            return Err(ConfigurationError::MissingTemplateVariable {
                template: template.name.clone(),
                variable: (*missing).to_string(),
            });
        }

        Ok(())
    }

    fn render(
        &self,
        template: &PromptTemplate,
        variables: &HashMap<&str, &str>,
    ) -> Result<String, ConfigurationError> {
        self.validate(template)?;

        // single pass, so braces inside substituted text are left alone
        let rendered = self
            .placeholder
            .replace_all(&template.body, |captures: &Captures| {
                let variable = captures.get(1).map(|value| value.as_str()).unwrap_or_default();
                variables.get(variable).copied().unwrap_or_default().to_string()
            });

        Ok(rendered.into_owned())
    }
}

fn builtin_template(key: TemplateKey) -> PromptTemplate {
    let diacritics = if key.diacritics {
        WITH_DIACRITICS
    } else {
        WITHOUT_DIACRITICS
    };
    let source = if key.merged {
        MERGED_SOURCE
    } else {
        SINGLE_SOURCE
    };

    PromptTemplate {
        name: format!(
            "{}-{}",
            if key.diacritics { "diacritics" } else { "plain" },
            if key.merged { "merged" } else { "single" }
        ),
        body: format!("{PREAMBLE}{CRITERIA}{diacritics}{source}{ANSWER}"),
    }
}
