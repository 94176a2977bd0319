//! The fixed pipeline a session walks through.
//!
//! A plan is an ordered list of phases; each phase names the prompts for
//! its THINK and INTEGRATE steps and how its EXECUTE searches are issued.
//! The default plan has three phases: research, concepts and content.

use std::collections::HashSet;

use cotflow_common::{Recency, ReasoningRequest, SessionConfig};
use serde::{Deserialize, Serialize};

/// How a reasoning step is performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// Call the reasoning collaborator inline, bounded by the step timeout.
    Sync,
    /// Enqueue one REASONING task and resume on its completion.
    #[default]
    Queued,
}

impl std::fmt::Display for ExecMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecMode::Sync => write!(f, "sync"),
            ExecMode::Queued => write!(f, "queued"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    #[serde(default)]
    pub mode: ExecMode,
    /// Prompt template. Placeholders: `{topic}`, `{style}`, `{platform}`,
    /// `{goal}`, `{previous}`, `{evidence}` and any string key of the
    /// session's extra config.
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Fields the JSON answer must contain.
    #[serde(default)]
    pub expected_fields: Vec<String>,
}

fn default_max_output_tokens() -> u32 {
    2000
}

fn default_temperature() -> f32 {
    0.7
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSpec {
    #[serde(default)]
    pub recency: Recency,
    /// System guidance passed with every search of the phase.
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    #[serde(default)]
    pub goal: String,
    pub think: StepSpec,
    pub integrate: StepSpec,
    #[serde(default)]
    pub search: SearchSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelinePlan {
    #[serde(default = "default_phases")]
    pub phases: Vec<PhaseSpec>,
}

impl Default for PipelinePlan {
    fn default() -> Self {
        Self {
            phases: default_phases(),
        }
    }
}

impl PipelinePlan {
    pub fn phase_count(&self) -> u32 {
        self.phases.len() as u32
    }

    /// Phase by 1-based number.
    pub fn phase(&self, number: u32) -> Option<&PhaseSpec> {
        if number == 0 {
            return None;
        }
        self.phases.get(number as usize - 1)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.phases.is_empty() {
            warnings.push("Pipeline has no phases".to_string());
        }
        let mut seen = HashSet::new();
        for (i, phase) in self.phases.iter().enumerate() {
            if !seen.insert(phase.name.as_str()) {
                warnings.push(format!("Duplicate phase name '{}'", phase.name));
            }
            for (label, step) in [("think", &phase.think), ("integrate", &phase.integrate)] {
                if step.prompt.trim().is_empty() {
                    warnings.push(format!("Phase {} ({}) has an empty {} prompt", i + 1, phase.name, label));
                }
                if !(0.0..=2.0).contains(&step.temperature) {
                    warnings.push(format!(
                        "Phase {} ({}) {} temperature {} is outside 0.0..=2.0",
                        i + 1,
                        phase.name,
                        label,
                        step.temperature
                    ));
                }
                if step.max_output_tokens == 0 {
                    warnings.push(format!(
                        "Phase {} ({}) {} max_output_tokens is 0",
                        i + 1,
                        phase.name,
                        label
                    ));
                }
            }
        }
        warnings
    }
}

/// Values available to a prompt template.
pub struct PromptVars<'a> {
    pub config: &'a SessionConfig,
    pub goal: &'a str,
    pub previous: String,
    pub evidence: String,
}

/// Replace known `{placeholders}`; unknown ones are left untouched.
pub fn render(template: &str, vars: &PromptVars<'_>) -> String {
    let mut out = template
        .replace("{topic}", &vars.config.topic)
        .replace("{style}", &vars.config.style)
        .replace("{platform}", &vars.config.platform)
        .replace("{goal}", vars.goal)
        .replace("{previous}", &vars.previous)
        .replace("{evidence}", &vars.evidence);
    for (key, value) in &vars.config.extra {
        if let Some(text) = value.as_str() {
            out = out.replace(&format!("{{{}}}", key), text);
        }
    }
    out
}

/// Build the reasoning request for one step. The answer format is always
/// appended so the output can be validated.
pub fn reasoning_request(spec: &StepSpec, vars: &PromptVars<'_>, required: &[&str]) -> ReasoningRequest {
    let mut fields: Vec<String> = required.iter().map(|s| s.to_string()).collect();
    for f in &spec.expected_fields {
        if !fields.contains(f) {
            fields.push(f.clone());
        }
    }
    let mut prompt = render(&spec.prompt, vars);
    prompt.push_str(&format!(
        "\n\nRespond with a single JSON object containing the fields: {}.",
        fields.join(", ")
    ));
    ReasoningRequest {
        prompt,
        system: spec.system.as_ref().map(|s| render(s, vars)),
        max_output_tokens: spec.max_output_tokens,
        temperature: spec.temperature,
        expected_fields: fields,
    }
}

fn think(prompt: &str, fields: &[&str]) -> StepSpec {
    StepSpec {
        mode: ExecMode::Sync,
        prompt: prompt.to_string(),
        system: Some(
            "You are a {style} content strategist for {platform}. Plan before you write.".to_string(),
        ),
        max_output_tokens: 2000,
        temperature: 0.7,
        expected_fields: fields.iter().map(|s| s.to_string()).collect(),
    }
}

fn integrate(prompt: &str, fields: &[&str]) -> StepSpec {
    StepSpec {
        mode: ExecMode::Queued,
        prompt: prompt.to_string(),
        system: Some("You are a {style} writer for {platform}.".to_string()),
        max_output_tokens: 4000,
        temperature: 0.5,
        expected_fields: fields.iter().map(|s| s.to_string()).collect(),
    }
}

fn default_phases() -> Vec<PhaseSpec> {
    vec![
        PhaseSpec {
            name: "research".to_string(),
            goal: "Find what is new and widely discussed about the topic".to_string(),
            think: think(
                "Topic: {topic}\nGoal: {goal}\nPlan the web searches that would surface recent news, \
                 trends and debates about the topic.",
                &["approach"],
            ),
            integrate: integrate(
                "Topic: {topic}\nSearch results:\n{evidence}\nSummarise the key insights and trends.",
                &["insights", "trends"],
            ),
            search: SearchSpec {
                recency: Recency::Week,
                context: None,
            },
        },
        PhaseSpec {
            name: "concepts".to_string(),
            goal: "Turn the research into distinct content angles".to_string(),
            think: think(
                "Topic: {topic}\nResearch so far:\n{previous}\nGoal: {goal}\n\
                 Plan searches that validate or sharpen candidate angles.",
                &["angles"],
            ),
            integrate: integrate(
                "Topic: {topic}\nResearch so far:\n{previous}\nValidation results:\n{evidence}\n\
                 Propose the strongest content concepts for {platform}.",
                &["concepts"],
            ),
            search: SearchSpec {
                recency: Recency::Month,
                context: None,
            },
        },
        PhaseSpec {
            name: "content".to_string(),
            goal: "Write publishable posts".to_string(),
            think: think(
                "Topic: {topic}\nConcepts:\n{previous}\nGoal: {goal}\n\
                 Outline the posts and list any facts that still need checking as searches.",
                &["outline"],
            ),
            integrate: integrate(
                "Topic: {topic}\nConcepts:\n{previous}\nFact checks:\n{evidence}\n\
                 Write the final posts in a {style} voice for {platform}.",
                &["posts"],
            ),
            search: SearchSpec::default(),
        },
    ]
}
