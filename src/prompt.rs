use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};

pub const IMAGE_PLACEHOLDER: &str = "<image>";

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are watching a video of {duration} seconds, shown as evenly spaced frames. \
The video is organised as a binary tree of segments: layer 0 is the whole video, \
layer 1 splits it into 2 halves, layer 2 into 4 quarters, and in general layer L \
splits it into 2^L equal segments numbered from 0. Layers 0 to {max_layer} are useful \
for this video.

First think about where the answer to the question appears, inside <think> </think> tags. \
Then name the smallest segment that contains the answer and the number of frames per \
second you need to inspect it, as <grounding>layer, segment_id, sampling_rate</grounding>.

Example: <think>The speaker starts the demo in the second quarter.</think><grounding>2, 1, 2</grounding>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    system: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            system: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl PromptTemplate {
    pub fn new(system: impl Into<String>) -> Result<Self> {
        let system = system.into();
        if system.trim().is_empty() {
            bail!("prompt template is empty");
        }
        Ok(Self { system })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read prompt template {}", path.display()))?;
        Self::new(raw.trim_end())
    }

    /// System text, one image placeholder per frame, then the question. A template that
    /// contains `{question}` places the question itself.
    pub fn render(
        &self,
        question: &str,
        frame_count: usize,
        duration_secs: f64,
        max_layer: u32,
    ) -> String {
        let system = self
            .system
            .replace("{duration}", &format!("{duration_secs:.1}"))
            .replace("{max_layer}", &max_layer.to_string());
        let images = vec![IMAGE_PLACEHOLDER; frame_count].join("\n");
        let question = question.trim();

        if system.contains("{question}") {
            let system = system.replace("{question}", question);
            if images.is_empty() {
                return system;
            }
            return format!("{images}\n{system}");
        }

        if images.is_empty() {
            format!("{system}\n\n{question}")
        } else {
            format!("{system}\n\n{images}\n{question}")
        }
    }
}
