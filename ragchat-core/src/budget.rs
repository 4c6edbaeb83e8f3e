//! Context budget enforcement.
//!
//! Fits a [`ConversationContext`] into a provider's token limits. When the
//! estimated size (or the message count) is over the limit, older turns are
//! folded into one synthetic `system` message and the newest turns are kept
//! verbatim. If that is still too large, the oldest kept turns are dropped
//! one by one. The summary and the newest turn are never dropped.

use crate::error::ConfigError;
use crate::tokens::{MESSAGE_OVERHEAD_TOKENS, TokenEstimator};
use crate::types::{
    ConversationContext, ConversationMessage, ProviderTokenLimits, Role, SYNTHETIC_KEY,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Metadata key carrying the number of turns a summary replaces.
pub const SUMMARIZED_COUNT_KEY: &str = "summarized_count";

/// Longest snippet kept from any one summarized turn, in characters.
const SNIPPET_CHARS: usize = 160;

/// Tuning for summarization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSettings {
    /// Newest messages kept verbatim when summarizing.
    pub preserve_recent_messages: usize,
    /// Upper bound on the synthetic summary, overhead included.
    pub summary_max_tokens: usize,
    /// Divisor for the heuristic estimator.
    pub chars_per_token: usize,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            preserve_recent_messages: 5,
            summary_max_tokens: 256,
            chars_per_token: 4,
        }
    }
}

/// What enforcement did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetReport {
    pub original_tokens: usize,
    pub final_tokens: usize,
    pub original_messages: usize,
    pub final_messages: usize,
    /// Turns folded into the synthetic summary.
    pub summarized_messages: usize,
    /// Preserved turns dropped after summarizing.
    pub dropped_messages: usize,
    pub within_budget: bool,
}

impl BudgetReport {
    pub fn changed(&self) -> bool {
        self.summarized_messages > 0 || self.dropped_messages > 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BudgetOutcome {
    pub context: ConversationContext,
    pub report: BudgetReport,
}

/// Applies token and message-count limits to conversation contexts.
pub struct ContextBudgetManager {
    estimator: Arc<dyn TokenEstimator>,
    settings: BudgetSettings,
}

impl ContextBudgetManager {
    pub fn new(estimator: Arc<dyn TokenEstimator>, settings: BudgetSettings) -> Self {
        Self {
            estimator,
            settings,
        }
    }

    pub fn estimator(&self) -> &Arc<dyn TokenEstimator> {
        &self.estimator
    }

    pub fn settings(&self) -> &BudgetSettings {
        &self.settings
    }

    /// Enforce `limits` on `context`. The input is never modified.
    pub fn enforce(
        &self,
        context: &ConversationContext,
        limits: &ProviderTokenLimits,
    ) -> Result<BudgetOutcome, ConfigError> {
        limits.validate()?;

        let max_tokens = limits.max_context_tokens;
        let message_cap = context
            .max_context_messages
            .min(limits.max_messages.unwrap_or(usize::MAX))
            .max(1);
        let original_tokens = self.estimator.estimate_context(context);
        let original_messages = context.messages.len();

        if original_tokens <= max_tokens && original_messages <= message_cap {
            return Ok(BudgetOutcome {
                context: context.clone(),
                report: BudgetReport {
                    original_tokens,
                    final_tokens: original_tokens,
                    original_messages,
                    final_messages: original_messages,
                    summarized_messages: 0,
                    dropped_messages: 0,
                    within_budget: true,
                },
            });
        }

        debug!(
            original_tokens,
            max_tokens, original_messages, message_cap, "Context over budget"
        );

        // Stable: ties keep their original sequence position.
        let mut ordered = context.messages.clone();
        ordered.sort_by_key(|m| m.timestamp);

        let keep = self
            .settings
            .preserve_recent_messages
            .max(1)
            .min(message_cap.saturating_sub(1).max(1))
            .min(ordered.len());
        let mut preserved = ordered.split_off(ordered.len() - keep);
        let summarized = ordered;

        let system_tokens = self.estimator.estimate(&context.system_prompt);
        let summary_budget = |preserved_tokens: usize| {
            max_tokens
                .saturating_sub(system_tokens)
                .saturating_sub(preserved_tokens)
                .min(self.settings.summary_max_tokens)
        };
        let mut preserved_tokens = self.estimator.estimate_messages(&preserved);
        let mut summary = if summarized.is_empty() {
            None
        } else {
            Some(self.summarize(&summarized, summary_budget(preserved_tokens)))
        };
        let summary_tokens = summary
            .as_ref()
            .map(|s| self.estimator.estimate_message(s))
            .unwrap_or(0);

        let mut dropped = 0;
        let over = |tokens: usize, count: usize| tokens > max_tokens || count > message_cap;
        while preserved.len() > 1
            && over(
                system_tokens + summary_tokens + preserved_tokens,
                preserved.len() + usize::from(summary.is_some()),
            )
        {
            let removed = preserved.remove(0);
            preserved_tokens -= self.estimator.estimate_message(&removed);
            dropped += 1;
        }
        // Refit the summary to the room the drops freed.
        if dropped > 0 && summary.is_some() {
            summary = Some(self.summarize(&summarized, summary_budget(preserved_tokens)));
        }

        let mut messages = Vec::with_capacity(preserved.len() + 1);
        messages.extend(summary);
        messages.extend(preserved);
        let result = context.with_messages(messages);
        let final_tokens = self.estimator.estimate_context(&result);
        let within_budget = !over(final_tokens, result.messages.len());

        let report = BudgetReport {
            original_tokens,
            final_tokens,
            original_messages,
            final_messages: result.messages.len(),
            summarized_messages: summarized.len(),
            dropped_messages: dropped,
            within_budget,
        };
        if within_budget {
            info!(
                original_tokens,
                final_tokens,
                summarized = report.summarized_messages,
                dropped,
                "Context summarized to fit budget"
            );
        } else {
            warn!(
                final_tokens,
                max_tokens, "Context still over budget after summarization; proceeding"
            );
        }
        Ok(BudgetOutcome {
            context: result,
            report,
        })
    }

    /// Build the stand-in message for `turns`, fitted to `budget` tokens
    /// where possible. Keeps the newest snippets when not all fit; the
    /// header line is always present.
    fn summarize(&self, turns: &[ConversationMessage], budget: usize) -> ConversationMessage {
        let header = format!("[Summary of {} earlier messages]", turns.len());
        let lines: Vec<String> = turns
            .iter()
            .map(|m| format!("- {}: {}", m.role.label(), snippet(&m.content, SNIPPET_CHARS)))
            .collect();

        let render = |kept: usize| -> String {
            let mut text = header.clone();
            let omitted = lines.len() - kept;
            if omitted > 0 && kept > 0 {
                text.push_str(&format!("\n- ({omitted} older turns omitted)"));
            }
            for line in &lines[omitted..] {
                text.push('\n');
                text.push_str(line);
            }
            text
        };

        let mut content = header.clone();
        for kept in (1..=lines.len()).rev() {
            let candidate = render(kept);
            if MESSAGE_OVERHEAD_TOKENS + self.estimator.estimate(&candidate) <= budget {
                content = candidate;
                break;
            }
        }

        let timestamp = turns
            .last()
            .map(|m| m.timestamp)
            .unwrap_or_else(chrono::Utc::now);
        ConversationMessage::new(Role::System, content)
            .with_timestamp(timestamp)
            .with_metadata(SYNTHETIC_KEY, serde_json::Value::Bool(true))
            .with_metadata(SUMMARIZED_COUNT_KEY, serde_json::json!(turns.len()))
    }
}

/// Collapse whitespace and cut to `max_chars`, marking the cut with `...`.
fn snippet(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::HeuristicEstimator;
    use chrono::{Duration, Utc};

    fn manager(preserve: usize) -> ContextBudgetManager {
        ContextBudgetManager::new(
            Arc::new(HeuristicEstimator::new(4)),
            BudgetSettings {
                preserve_recent_messages: preserve,
                ..BudgetSettings::default()
            },
        )
    }

    fn limits(max_context_tokens: usize) -> ProviderTokenLimits {
        ProviderTokenLimits {
            max_context_tokens,
            max_response_tokens: 0,
            reserved_tokens: 0,
            max_messages: None,
        }
    }

    /// `count` alternating turns, each estimated at exactly 10 tokens.
    fn conversation(count: usize) -> ConversationContext {
        let start = Utc::now() - Duration::seconds(count as i64);
        let mut ctx = ConversationContext::new("");
        for i in 0..count {
            let content = format!("message number {i:09}");
            let msg = if i % 2 == 0 {
                ConversationMessage::user(content)
            } else {
                ConversationMessage::assistant(content)
            };
            ctx.messages
                .push(msg.with_timestamp(start + Duration::seconds(i as i64)));
        }
        ctx
    }

    #[test]
    fn test_fixture_messages_are_ten_tokens() {
        let ctx = conversation(3);
        let est = HeuristicEstimator::new(4);
        for msg in &ctx.messages {
            assert_eq!(est.estimate_message(msg), 10);
        }
    }

    #[test]
    fn test_within_budget_is_identity() {
        let ctx = conversation(8);
        let outcome = manager(5).enforce(&ctx, &limits(80)).unwrap();
        assert_eq!(outcome.context, ctx);
        assert!(!outcome.report.changed());
        assert!(outcome.report.within_budget);
    }

    #[test]
    fn test_inconsistent_limits_are_config_errors() {
        let bad = ProviderTokenLimits {
            max_context_tokens: 100,
            max_response_tokens: 90,
            reserved_tokens: 20,
            max_messages: None,
        };
        let err = manager(5).enforce(&conversation(2), &bad).unwrap_err();
        assert!(matches!(err, ConfigError::InconsistentLimits { .. }));
    }

    #[test]
    fn test_fifty_messages_into_one_hundred_tokens() {
        let ctx = conversation(50);
        let outcome = manager(5).enforce(&ctx, &limits(100)).unwrap();
        let messages = &outcome.context.messages;

        assert!(messages[0].is_synthetic());
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages.iter().filter(|m| m.is_synthetic()).count(), 1);
        assert!(messages.len() - 1 <= 5);
        assert_eq!(
            messages.last().unwrap().content,
            ctx.messages.last().unwrap().content
        );
        assert!(outcome.report.final_tokens <= 100);
        assert!(HeuristicEstimator::new(4).estimate_context(&outcome.context) <= 100);
        assert_eq!(outcome.report.summarized_messages, 45);
        assert_eq!(
            messages[0].metadata[SUMMARIZED_COUNT_KEY],
            serde_json::json!(45)
        );
        // Input untouched.
        assert_eq!(ctx.messages.len(), 50);
    }

    #[test]
    fn test_preserved_keep_relative_order() {
        let ctx = conversation(20);
        let outcome = manager(3).enforce(&ctx, &limits(90)).unwrap();
        let kept: Vec<_> = outcome.context.messages[1..]
            .iter()
            .map(|m| m.content.clone())
            .collect();
        let expected: Vec<_> = ctx.messages[17..]
            .iter()
            .map(|m| m.content.clone())
            .collect();
        assert_eq!(kept, expected);
    }

    #[test]
    fn test_summary_keeps_newest_snippets() {
        let ctx = conversation(30);
        let outcome = manager(2).enforce(&ctx, &limits(60)).unwrap();
        let summary = &outcome.context.messages[0].content;
        assert!(summary.starts_with("[Summary of 28 earlier messages]"));
        assert!(summary.contains("older turns omitted"));
        assert!(summary.contains("message number 000000027"));
        assert!(!summary.contains("message number 000000000"));
    }

    #[test]
    fn test_message_cap_triggers_summarization() {
        let mut ctx = conversation(10);
        ctx.max_context_messages = 4;
        let outcome = manager(5).enforce(&ctx, &limits(10_000)).unwrap();
        assert_eq!(outcome.context.messages.len(), 4);
        assert!(outcome.context.messages[0].is_synthetic());
        assert_eq!(outcome.report.summarized_messages, 7);

        let mut ctx = conversation(10);
        ctx.max_context_messages = 100;
        let mut capped = limits(10_000);
        capped.max_messages = Some(3);
        let outcome = manager(5).enforce(&ctx, &capped).unwrap();
        assert_eq!(outcome.context.messages.len(), 3);
    }

    #[test]
    fn test_drops_oldest_preserved_but_never_newest() {
        let mut ctx = ConversationContext::new("");
        let start = Utc::now();
        for i in 0..4 {
            ctx.messages.push(
                ConversationMessage::user(format!("{i}{}", "x".repeat(400)))
                    .with_timestamp(start + Duration::seconds(i)),
            );
        }
        let outcome = manager(3).enforce(&ctx, &limits(150)).unwrap();
        let messages = &outcome.context.messages;
        assert!(messages[0].is_synthetic());
        assert_eq!(messages.len(), 2);
        assert!(messages[1].content.starts_with('3'));
        assert_eq!(outcome.report.dropped_messages, 2);
        assert!(outcome.report.within_budget);
    }

    #[test]
    fn test_summary_grows_into_room_freed_by_drops() {
        let mut ctx = ConversationContext::new("");
        let start = Utc::now();
        let contents = [
            "old question alpha".to_string(),
            "old answer beta".to_string(),
            "x".repeat(400),
            "y".repeat(400),
            "z".repeat(400),
        ];
        for (i, content) in contents.into_iter().enumerate() {
            let msg = if i % 2 == 0 {
                ConversationMessage::user(content)
            } else {
                ConversationMessage::assistant(content)
            };
            ctx.messages
                .push(msg.with_timestamp(start + Duration::seconds(i as i64)));
        }

        let outcome = manager(3).enforce(&ctx, &limits(150)).unwrap();
        let messages = &outcome.context.messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(outcome.report.dropped_messages, 2);
        assert!(messages[1].content.starts_with('z'));

        let summary = &messages[0].content;
        assert!(summary.starts_with("[Summary of 2 earlier messages]"));
        assert!(summary.contains("User: old question alpha"));
        assert!(summary.contains("Assistant: old answer beta"));
        assert!(outcome.report.within_budget);
        assert!(outcome.report.final_tokens <= 150);
    }

    #[test]
    fn test_single_oversized_message_is_kept() {
        let mut ctx = ConversationContext::new("system");
        ctx.messages.push(ConversationMessage::user("y".repeat(2000)));
        let outcome = manager(5).enforce(&ctx, &limits(50)).unwrap();
        assert_eq!(outcome.context.messages.len(), 1);
        assert_eq!(outcome.context.messages[0].content.len(), 2000);
        assert!(!outcome.report.within_budget);
    }

    #[test]
    fn test_equal_timestamps_keep_sequence_order() {
        let now = Utc::now();
        let mut ctx = ConversationContext::new("");
        for label in ["a", "b", "c", "d", "e", "f"] {
            ctx.messages
                .push(ConversationMessage::user(label.repeat(40)).with_timestamp(now));
        }
        let outcome = manager(2).enforce(&ctx, &limits(60)).unwrap();
        let kept: Vec<_> = outcome.context.messages[1..]
            .iter()
            .map(|m| &m.content[..1])
            .collect();
        assert_eq!(kept, vec!["e", "f"]);
    }

    #[test]
    fn test_snippet_truncates_on_char_boundary() {
        assert_eq!(snippet("  a   b\n c ", 10), "a b c");
        let long = "é".repeat(50);
        let cut = snippet(&long, 10);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), 10);
    }
}
