//! System messages and user prompts for fault analysis

use crate::config::{PromptConfig, PromptMode};

const SYSTEM_MESSAGE: &str = "You are an experienced process-control engineer assisting \
operators of a continuous chemical plant (Tennessee Eastman process). You are given the \
features that deviate most from normal operation, with their current values, normal means \
and z-scores. Be concise and specific. Reason from the physical connections between units \
(reactor, condenser, separator, stripper, compressor). Do not invent measurements that were \
not provided.";

const EXPLAIN_INSTRUCTIONS: &str = "Explain what these deviations indicate about the current \
state of the process. Describe which units are affected, how the deviations are likely linked, \
and what an operator should check first.";

const ROOT_CAUSE_INSTRUCTIONS: &str = "Identify the three most likely root causes of this \
fault, ranked by likelihood (Root Cause 1/2/3). For each, give one or two sentences of \
reasoning that refer to the listed features, then one recommended operator action.";

/// Builds the prompt pair handed to every backend.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    mode: PromptMode,
    system: String,
}

impl PromptBuilder {
    pub fn new(config: &PromptConfig) -> Self {
        Self {
            mode: config.mode,
            system: config
                .system_message
                .clone()
                .unwrap_or_else(|| SYSTEM_MESSAGE.to_string()),
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn mode(&self) -> PromptMode {
        self.mode
    }

    /// `comparison` is the fault-vs-normal block; `note` is optional operator context.
    pub fn user_prompt(&self, comparison: &str, note: Option<&str>) -> String {
        let instructions = match self.mode {
            PromptMode::Explain => EXPLAIN_INSTRUCTIONS,
            PromptMode::RootCause => ROOT_CAUSE_INSTRUCTIONS,
        };
        let mut prompt = format!("{}\n\n{}", comparison.trim_end(), instructions);
        if let Some(note) = note.map(str::trim).filter(|n| !n.is_empty()) {
            prompt.push_str("\n\nOperator note: ");
            prompt.push_str(note);
        }
        prompt
    }

    pub fn request(&self, comparison: &str, note: Option<&str>) -> super::AnalysisRequest {
        super::AnalysisRequest {
            system: self.system.clone(),
            prompt: self.user_prompt(comparison, note),
        }
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(&PromptConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comparison_leads_the_prompt() {
        let builder = PromptBuilder::default();
        let prompt = builder.user_prompt("Top 2 Contributing Features (Fault vs Normal):\n", None);
        assert!(prompt.starts_with("Top 2 Contributing Features"));
        assert!(prompt.contains("Explain what these deviations"));
    }

    #[test]
    fn test_root_cause_mode_and_note() {
        let builder = PromptBuilder::new(&PromptConfig {
            mode: PromptMode::RootCause,
            system_message: Some("custom".to_string()),
        });
        let prompt = builder.user_prompt("ranking", Some("  feed valve was serviced  "));
        assert!(prompt.contains("Root Cause 1/2/3"));
        assert!(prompt.ends_with("Operator note: feed valve was serviced"));
        assert_eq!(builder.system(), "custom");
    }
}
