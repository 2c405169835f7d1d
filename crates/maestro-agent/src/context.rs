use async_trait::async_trait;
use maestro_core::{MaestroResult, Turn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// The conversation and tool history carried through a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    turns: Vec<Turn>,
    size_estimate: usize,
    /// Original turns folded into summaries so far.
    watermark: usize,
    compactions: u32,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_turns(turns: Vec<Turn>) -> Self {
        let size_estimate = turns.iter().map(Turn::estimated_size).sum();
        Self {
            turns,
            size_estimate,
            watermark: 0,
            compactions: 0,
        }
    }

    pub fn push(&mut self, turn: Turn) {
        self.size_estimate += turn.estimated_size();
        self.turns.push(turn);
    }

    pub fn extend(&mut self, turns: impl IntoIterator<Item = Turn>) {
        for turn in turns {
            self.push(turn);
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn size_estimate(&self) -> usize {
        self.size_estimate
    }

    pub fn watermark(&self) -> usize {
        self.watermark
    }

    pub fn compactions(&self) -> u32 {
        self.compactions
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Turns appended after the first `base` turns.
    pub fn delta_since(&self, base: usize) -> Vec<Turn> {
        self.turns.get(base..).map(<[Turn]>::to_vec).unwrap_or_default()
    }

    /// Whether any turn's content contains `text`.
    pub fn contains_text(&self, text: &str) -> bool {
        self.turns.iter().any(|t| t.content.contains(text))
    }
}

/// Truncates to at most `max` bytes without splitting a character.
pub fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Folds a run of turns into one summary text.
///
/// Implementations should stay within `max_bytes`; the compactor truncates
/// anything longer.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, turns: &[Turn], max_bytes: usize) -> MaestroResult<String>;
}

/// Summarizer that keeps the first line of every folded turn.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestSummarizer;

impl DigestSummarizer {
    pub fn digest(turns: &[Turn], max_bytes: usize) -> String {
        let mut out = format!("[Summarized {} turns] ", turns.len());
        let lines: Vec<String> = turns
            .iter()
            .map(|t| {
                let first = t.content.lines().next().unwrap_or_default();
                format!("{}: {}", role_name(t), first)
            })
            .collect();
        out.push_str(&lines.join("\n"));
        truncate_utf8(&out, max_bytes).to_string()
    }
}

fn role_name(turn: &Turn) -> &'static str {
    match turn.role {
        maestro_core::Role::User => "user",
        maestro_core::Role::Assistant => "assistant",
        maestro_core::Role::System => "system",
        maestro_core::Role::Tool => "tool",
    }
}

#[async_trait]
impl Summarizer for DigestSummarizer {
    async fn summarize(&self, turns: &[Turn], max_bytes: usize) -> MaestroResult<String> {
        Ok(Self::digest(turns, max_bytes))
    }
}

/// Compaction thresholds, in bytes of estimated context size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Compaction runs once the context grows past this size.
    #[serde(default = "default_threshold")]
    pub threshold: usize,
    /// Most recent turns kept verbatim.
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
    #[serde(default = "default_summary_max_bytes")]
    pub summary_max_bytes: usize,
}

fn default_threshold() -> usize {
    // 4096 tokens at roughly 4 bytes per token.
    16 * 1024
}

fn default_keep_recent() -> usize {
    6
}

fn default_summary_max_bytes() -> usize {
    2048
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            keep_recent: default_keep_recent(),
            summary_max_bytes: default_summary_max_bytes(),
        }
    }
}

/// What a compaction pass did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    pub before: usize,
    pub after: usize,
    pub folded_turns: usize,
    pub kept_recent: usize,
}

/// Keeps a [`RunContext`] within its size budget.
pub struct Compactor {
    config: CompactionConfig,
    summarizer: Arc<dyn Summarizer>,
}

impl Compactor {
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            config,
            summarizer: Arc::new(DigestSummarizer),
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Appends a turn, then compacts if the context grew past the threshold.
    pub async fn append(&self, ctx: &mut RunContext, turn: Turn) -> Option<CompactionReport> {
        ctx.push(turn);
        self.compact_if_needed(ctx).await
    }

    /// Compacts `ctx` if it is over the threshold. A context at or under the
    /// threshold is left untouched.
    pub async fn compact_if_needed(&self, ctx: &mut RunContext) -> Option<CompactionReport> {
        let budget = self.config.threshold;
        if ctx.size_estimate <= budget {
            return None;
        }
        let before = ctx.size_estimate;
        let total = ctx.turns.len();
        let mut keep = self.config.keep_recent.min(total);

        loop {
            let split = total - keep;
            // Nothing older than the kept window: keep fewer.
            if split == 0 && keep > 0 {
                keep -= 1;
                continue;
            }

            let (folded, recent) = ctx.turns.split_at(split);
            let summary = self.summary_for(folded).await;
            let recent_size: usize = recent.iter().map(Turn::estimated_size).sum();

            if summary.len() + recent_size <= budget || keep == 0 {
                let summary = if keep == 0 {
                    truncate_utf8(&summary, budget).to_string()
                } else {
                    summary
                };
                let folded_originals = folded.iter().filter(|t| !t.synthetic).count();
                let mut turns = Vec::with_capacity(keep + 1);
                turns.push(Turn::summary(summary));
                turns.extend_from_slice(recent);

                ctx.size_estimate = turns.iter().map(Turn::estimated_size).sum();
                ctx.turns = turns;
                ctx.watermark += folded_originals;
                ctx.compactions += 1;

                let report = CompactionReport {
                    before,
                    after: ctx.size_estimate,
                    folded_turns: split,
                    kept_recent: keep,
                };
                debug!(
                    before = report.before,
                    after = report.after,
                    folded = report.folded_turns,
                    "Context compacted"
                );
                return Some(report);
            }
            keep -= 1;
        }
    }

    async fn summary_for(&self, turns: &[Turn]) -> String {
        let max = self.config.summary_max_bytes;
        let text = match self.summarizer.summarize(turns, max).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Summarizer failed, falling back to digest");
                DigestSummarizer::digest(turns, max)
            }
        };
        truncate_utf8(&text, max).to_string()
    }
}
