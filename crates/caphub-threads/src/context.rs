//! Context-window assembly.
//!
//! Builds the prompt context for an agent from thread history under a token
//! budget. Token counts are estimated (chars / 4); the estimator is a free
//! function so a tokenizer-backed one can replace it.

use caphub_contract::thread::{
    ContextStrategy, ContextWindow, Message, Thread,
};

/// Budget and strategy for one assembly.
#[derive(Debug, Clone, Copy)]
pub struct ContextBudget {
    pub max_tokens: u64,
    pub strategy: ContextStrategy,
}

impl ContextBudget {
    pub fn new(max_tokens: u64, strategy: ContextStrategy) -> Self {
        Self {
            max_tokens,
            strategy,
        }
    }

    pub fn recent(max_tokens: u64) -> Self {
        Self::new(max_tokens, ContextStrategy::Recent)
    }
}

/// Token estimate for free text.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64 / 4).max(1)
}

/// Assemble a context window from full thread history.
///
/// `min_tail` messages are always retained verbatim, even when they blow
/// the budget.
pub fn assemble(
    thread: &Thread,
    messages: &[Message],
    budget: ContextBudget,
    min_tail: usize,
) -> ContextWindow {
    match budget.strategy {
        ContextStrategy::Recent => assemble_recent(thread, messages, budget, min_tail),
        ContextStrategy::Summary => assemble_summary(thread, messages, budget, min_tail, false),
        ContextStrategy::Hybrid => assemble_summary(thread, messages, budget, min_tail, true),
    }
}

fn window(thread: &Thread, budget: ContextBudget) -> ContextWindow {
    ContextWindow {
        thread_id: thread.thread_id.clone(),
        strategy: budget.strategy,
        summary: None,
        pinned: Vec::new(),
        messages: Vec::new(),
        estimated_tokens: 0,
        cursor: None,
    }
}

/// Newest messages until the budget is exhausted.
fn assemble_recent(
    thread: &Thread,
    messages: &[Message],
    budget: ContextBudget,
    min_tail: usize,
) -> ContextWindow {
    let mut out = window(thread, budget);
    let mut tokens = 0u64;
    let mut tail: Vec<Message> = Vec::new();

    for (taken, message) in messages.iter().rev().enumerate() {
        let cost = message.estimated_tokens();
        if taken >= min_tail && tokens + cost > budget.max_tokens {
            break;
        }
        tokens += cost;
        tail.push(message.clone());
    }
    tail.reverse();

    out.cursor = tail.last().map(|m| m.seq);
    out.estimated_tokens = tokens;
    out.messages = tail;
    out
}

/// Summary in place of elided history, plus a verbatim tail. The hybrid
/// variant additionally retains pinned decision-point messages.
fn assemble_summary(
    thread: &Thread,
    messages: &[Message],
    budget: ContextBudget,
    min_tail: usize,
    include_pinned: bool,
) -> ContextWindow {
    let mut out = window(thread, budget);
    let mut tokens = 0u64;

    let summary_boundary = match thread.summary.as_ref() {
        Some(summary) => {
            tokens += estimate_tokens(&summary.content);
            out.summary = Some(summary.content.clone());
            summary.covers_through_seq + 1
        }
        // No stored summary: degrade to the recent strategy over everything.
        None => 0,
    };

    if include_pinned {
        // Pinned messages from the summarized region stay verbatim.
        for message in messages.iter().filter(|m| m.seq < summary_boundary) {
            let pinned = message.metadata.as_ref().is_some_and(|meta| meta.pinned);
            if pinned {
                tokens += message.estimated_tokens();
                out.pinned.push(message.clone());
            }
        }
    }

    let recent: Vec<&Message> = messages
        .iter()
        .filter(|m| m.seq >= summary_boundary)
        .collect();
    let mut tail: Vec<Message> = Vec::new();
    for (taken, message) in recent.iter().rev().enumerate() {
        let cost = message.estimated_tokens();
        if taken >= min_tail && tokens + cost > budget.max_tokens {
            break;
        }
        tokens += cost;
        tail.push((*message).clone());
    }
    tail.reverse();

    out.cursor = tail
        .last()
        .map(|m| m.seq)
        .or(thread.summary.as_ref().map(|s| s.covers_through_seq));
    out.estimated_tokens = tokens;
    out.messages = tail;
    out
}
