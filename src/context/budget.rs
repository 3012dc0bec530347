// src/context/budget.rs
// Per-section token budgeting for assembled context

use crate::config::SibylConfig;
use crate::tokens;
use crate::types::{ContextBudget, ContextSections, Message};

/// Per-section token caps.
#[derive(Debug, Clone, Copy)]
pub struct SectionCaps {
    pub history: u32,
    pub summary: u32,
    pub salience: u32,
    pub web: u32,
}

impl SectionCaps {
    pub fn from_config(config: &SibylConfig) -> Self {
        Self {
            history: config.context_history_token_cap,
            summary: config.context_summary_token_cap,
            salience: config.context_salience_token_cap,
            web: config.web_context_max_tokens,
        }
    }
}

/// Budget every section independently: drop oldest items first, then hard
/// truncate a single oversized item. The caller's sections are never
/// mutated; kept items preserve their order. Budgeting is idempotent.
pub fn budget_sections(
    sections: &ContextSections,
    caps: &SectionCaps,
) -> (ContextSections, ContextBudget) {
    let history = trim_oldest(
        sections.history.clone(),
        caps.history,
        |m: &Message| tokens::estimate_unchecked(&m.content),
        |m, max_bytes| {
            m.content = truncate_to_char_boundary(&m.content, max_bytes).to_string();
        },
    );
    let summary = trim_oldest(
        sections.summary.clone(),
        caps.summary,
        |s: &String| tokens::estimate_unchecked(s),
        |s, max_bytes| {
            *s = truncate_to_char_boundary(s, max_bytes).to_string();
        },
    );
    let salience = trim_oldest(
        sections.salience.clone(),
        caps.salience,
        |s: &String| tokens::estimate_unchecked(s),
        |s, max_bytes| {
            *s = truncate_to_char_boundary(s, max_bytes).to_string();
        },
    );
    let (web, _) = truncate_text(&sections.web, caps.web);

    let budgeted = ContextSections {
        history,
        summary,
        salience,
        web,
    };

    let history_tokens: u32 = budgeted
        .history
        .iter()
        .map(|m| tokens::estimate_unchecked(&m.content))
        .sum();
    let summary_tokens: u32 = budgeted
        .summary
        .iter()
        .map(|s| tokens::estimate_unchecked(s))
        .sum();
    let salience_tokens: u32 = budgeted
        .salience
        .iter()
        .map(|s| tokens::estimate_unchecked(s))
        .sum();
    let web_tokens = tokens::estimate_unchecked(&budgeted.web);

    let usage = ContextBudget {
        history_tokens,
        summary_tokens,
        salience_tokens,
        web_tokens,
        total_tokens: history_tokens + summary_tokens + salience_tokens + web_tokens,
    };

    (budgeted, usage)
}

/// Tail-truncate `text` to at most `cap` tokens. Returns the kept text and
/// whether anything was removed.
pub fn truncate_text(text: &str, cap: u32) -> (String, bool) {
    if tokens::estimate_unchecked(text) <= cap {
        return (text.to_string(), false);
    }
    let kept = truncate_to_char_boundary(text, tokens::byte_budget(cap));
    (kept.to_string(), true)
}

/// Remove oldest items until the section fits its cap. A single item that
/// alone exceeds the cap is hard-truncated to fit.
fn trim_oldest<T>(
    mut items: Vec<T>,
    cap: u32,
    item_tokens: impl Fn(&T) -> u32,
    truncate_item: impl Fn(&mut T, usize),
) -> Vec<T> {
    let mut total: u32 = items.iter().map(&item_tokens).sum();

    while total > cap && items.len() > 1 {
        let removed = items.remove(0);
        total = total.saturating_sub(item_tokens(&removed));
    }

    if total > cap {
        if let Some(item) = items.first_mut() {
            truncate_item(item, tokens::byte_budget(cap));
        }
    }

    items
}

/// Cut at the largest char boundary not exceeding `max_bytes`.
fn truncate_to_char_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(history: u32, summary: u32, salience: u32, web: u32) -> SectionCaps {
        SectionCaps {
            history,
            summary,
            salience,
            web,
        }
    }

    #[test]
    fn test_under_cap_untouched() {
        let sections = ContextSections {
            history: vec![Message::user("short"), Message::assistant("reply")],
            summary: vec!["one bullet".into()],
            salience: vec![],
            web: "web text".into(),
        };
        let (budgeted, usage) = budget_sections(&sections, &caps(100, 100, 100, 100));
        assert_eq!(budgeted.history.len(), 2);
        assert_eq!(budgeted.summary, sections.summary);
        assert!(usage.history_tokens <= 100);
    }

    #[test]
    fn test_drops_oldest_history_first() {
        let sections = ContextSections {
            history: vec![
                Message::user(&"a".repeat(400)),
                Message::user(&"b".repeat(400)),
                Message::user("keep me"),
            ],
            ..Default::default()
        };
        // 100-token cap fits one 400-char message; the oldest goes first.
        let (budgeted, _) = budget_sections(&sections, &caps(102, 100, 100, 100));
        assert_eq!(budgeted.history.len(), 2);
        assert!(budgeted.history[0].content.starts_with('b'));
        assert_eq!(budgeted.history[1].content, "keep me");
    }

    #[test]
    fn test_single_oversized_item_is_truncated() {
        let sections = ContextSections {
            history: vec![Message::user(&"x".repeat(4000))],
            ..Default::default()
        };
        let (budgeted, usage) = budget_sections(&sections, &caps(50, 100, 100, 100));
        assert_eq!(budgeted.history.len(), 1);
        assert!(usage.history_tokens <= 50);
    }

    #[test]
    fn test_web_tail_truncated() {
        let sections = ContextSections {
            web: "w".repeat(8000),
            ..Default::default()
        };
        let (budgeted, usage) = budget_sections(&sections, &caps(100, 100, 100, 200));
        assert!(usage.web_tokens <= 200);
        assert_eq!(budgeted.web.len(), 800);
    }

    #[test]
    fn test_budgeting_is_idempotent() {
        let sections = ContextSections {
            history: vec![
                Message::user(&"a".repeat(500)),
                Message::user(&"b".repeat(500)),
            ],
            summary: vec!["s".repeat(900), "t".repeat(100)],
            salience: vec!["note".into()],
            web: "w".repeat(3000),
        };
        let c = caps(150, 120, 100, 300);
        let (once, usage_once) = budget_sections(&sections, &c);
        let (twice, usage_twice) = budget_sections(&once, &c);
        assert_eq!(once.history, twice.history);
        assert_eq!(once.summary, twice.summary);
        assert_eq!(once.web, twice.web);
        assert_eq!(usage_once.total_tokens, usage_twice.total_tokens);
    }

    #[test]
    fn test_all_sections_within_caps() {
        let sections = ContextSections {
            history: (0..20).map(|i| Message::user(format!("turn {i} {}", "x".repeat(200)))).collect(),
            summary: (0..10).map(|i| format!("bullet {i} {}", "y".repeat(120))).collect(),
            salience: (0..10).map(|i| format!("fact {i} {}", "z".repeat(80))).collect(),
            web: "w".repeat(10_000),
        };
        let c = caps(200, 90, 60, 400);
        let (_, usage) = budget_sections(&sections, &c);
        assert!(usage.history_tokens <= c.history);
        assert!(usage.summary_tokens <= c.summary);
        assert!(usage.salience_tokens <= c.salience);
        assert!(usage.web_tokens <= c.web);
    }

    #[test]
    fn test_truncate_text_flags_trimming() {
        let (kept, trimmed) = truncate_text("short", 100);
        assert_eq!(kept, "short");
        assert!(!trimmed);

        let (kept, trimmed) = truncate_text(&"x".repeat(1000), 50);
        assert!(trimmed);
        assert_eq!(kept.len(), 200);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "héllo wörld ".repeat(100);
        let (kept, _) = truncate_text(&text, 10);
        // Must not panic and must be valid UTF-8 by construction.
        assert!(kept.len() <= 40);
    }
}
