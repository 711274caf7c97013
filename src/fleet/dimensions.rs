//! Improvement dimensions and the self-critique prompt built from them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    VisualPolish,
    FunctionalCorrectness,
    Usability,
    Responsiveness,
    RuntimeEfficiency,
    CodeQuality,
}

impl Dimension {
    pub const ALL: [Dimension; 6] = [
        Dimension::VisualPolish,
        Dimension::FunctionalCorrectness,
        Dimension::Usability,
        Dimension::Responsiveness,
        Dimension::RuntimeEfficiency,
        Dimension::CodeQuality,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Dimension::VisualPolish => "visual_polish",
            Dimension::FunctionalCorrectness => "functional_correctness",
            Dimension::Usability => "usability",
            Dimension::Responsiveness => "responsiveness",
            Dimension::RuntimeEfficiency => "runtime_efficiency",
            Dimension::CodeQuality => "code_quality",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Dimension::VisualPolish => "Visual polish",
            Dimension::FunctionalCorrectness => "Functional correctness",
            Dimension::Usability => "Usability",
            Dimension::Responsiveness => "Responsiveness",
            Dimension::RuntimeEfficiency => "Runtime efficiency",
            Dimension::CodeQuality => "Code quality",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Dimension::VisualPolish => "attractive layout, consistent styling, responsive design, smooth animation",
            Dimension::FunctionalCorrectness => "features complete, interactions do what they promise, results are correct",
            Dimension::Usability => "easy to operate, low learning curve, timely feedback",
            Dimension::Responsiveness => "buttons react immediately, visible state changes, loading indicators",
            Dimension::RuntimeEfficiency => "fast page load, efficient code paths, modest resource use",
            Dimension::CodeQuality => "clear structure, maintainable, proper error handling",
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

impl std::str::FromStr for Dimension {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dimension::ALL
            .into_iter()
            .find(|d| d.key() == s)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid dimension '{}'. Valid values: {}",
                    s,
                    Dimension::ALL.map(|d| d.key()).join(", ")
                )
            })
    }
}

/// Self-critique instruction for one iteration.
pub fn build_iteration_prompt(iteration: u64, enabled: &[Dimension], focus: Option<Dimension>) -> String {
    let mut out = format!("[Autonomous iteration, round {}]\n\n", iteration);
    out.push_str("[Task]\nReview the current application and pick the 1-3 most valuable improvements from these dimensions:\n\n");

    for (i, dim) in Dimension::ALL.iter().filter(|d| enabled.contains(d)).enumerate() {
        let marker = if focus == Some(*dim) { "[FOCUS] " } else { "" };
        out.push_str(&format!("{}. {}{}: {}\n", i + 1, marker, dim.title(), dim.description()));
    }

    if let Some(dim) = focus {
        out.push_str(&format!(
            "\n[Focus this round] {}\nGive problems related to {} priority.\n",
            dim.title(),
            dim.title().to_lowercase()
        ));
    }

    out.push_str(
        "\n[Workflow]\n\
         1. Run the current application and look for weak spots\n\
         2. Fix or improve the most important problems\n\
         3. Verify the improvement\n\
         4. Summarize this round briefly\n\
         \n[Output format]\n\
         - Found: [short description]\n\
         - Changed: [what was done]\n\
         - Effect: [result]",
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_round_trip_through_from_str() {
        for dim in Dimension::ALL {
            assert_eq!(dim.key().parse::<Dimension>().unwrap(), dim);
        }
        let err = "colour".parse::<Dimension>().unwrap_err().to_string();
        assert!(err.contains("visual_polish"));
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&Dimension::RuntimeEfficiency).unwrap();
        assert_eq!(json, "\"runtime_efficiency\"");
    }

    #[test]
    fn test_prompt_lists_enabled_and_marks_focus() {
        let prompt = build_iteration_prompt(
            4,
            &[Dimension::CodeQuality, Dimension::Usability],
            Some(Dimension::Usability),
        );
        assert!(prompt.starts_with("[Autonomous iteration, round 4]"));
        assert!(prompt.contains("1. [FOCUS] Usability"));
        assert!(prompt.contains("2. Code quality"));
        assert!(!prompt.contains("Visual polish"));
        assert!(prompt.contains("[Focus this round] Usability"));
    }

    #[test]
    fn test_prompt_without_focus() {
        let prompt = build_iteration_prompt(1, &Dimension::ALL, None);
        assert!(!prompt.contains("[FOCUS]"));
        assert!(prompt.contains("6. Code quality"));
    }
}
