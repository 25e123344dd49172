use serde_json::Value;

use super::types::{
    MemoryType, RecalledMemoryItem, UserProfile, VALENCE_NEGATIVE_THRESHOLD,
    VALENCE_POSITIVE_THRESHOLD,
};

// Per-bucket caps. Relevance ordering within a bucket is the gateway's and is
// preserved as-is.
const MAX_FACTS: usize = 5;
const MAX_EPISODIC: usize = 5;
const MAX_INSIGHTS: usize = 3;
const MAX_OTHER: usize = 3;
const MAX_GRAPH_FACTS: usize = 5;

const BASE_INSTRUCTION: &str = "You are a warm, attentive companion who knows this user well. \
Use what you remember about them the way a close friend would.";

const HEADING_PROFILE: &str = "## What you know about them";
const HEADING_FACTS: &str = "## Facts you remember";
const HEADING_EPISODIC: &str = "## Moments you have shared";
const HEADING_INSIGHTS: &str = "## Your deeper understanding";
const HEADING_GRAPH: &str = "## Connections you have noticed";
const HEADING_OTHER: &str = "## Other context";
const HEADING_GUIDELINES: &str = "## How to respond";

const SUPPORTIVE_HINT: &str =
    "Note: they have seemed low recently. Be gentle, supportive, and encouraging.";
const POSITIVE_HINT: &str =
    "Note: they have been in good spirits recently. Share in their joy.";

const CLOSING_GUIDELINES: &str = "\
1. Talk like a real friend and bring up what you remember naturally.
2. If they seem down, offer warmth and encouragement.
3. If they share good news, be genuinely happy for them.
4. Never recite memories mechanically; weave them into the conversation.
5. Make them feel understood and supported.
6. Keep replies concise and natural, never long-winded.
7. An occasional emoji is fine, but do not overdo it.";

/// Human-readable labels for the known profile fields. Unknown keys pass
/// through verbatim.
const PROFILE_LABELS: &[(&str, &str)] = &[
    ("identity", "Identity"),
    ("occupation", "Occupation"),
    ("interests", "Interests"),
    ("values", "Values"),
    ("relationships", "Relationships"),
    ("personality", "Personality"),
];

/// Assembles the system prompt for one turn from recalled memories, graph
/// facts, and the user profile.
///
/// Pure and deterministic: identical inputs yield byte-identical output.
/// Section order and headings are fixed; empty sections render an explicit
/// placeholder so the prompt structure never silently changes shape.
#[derive(Debug, Clone, Default)]
pub struct PromptComposer;

impl PromptComposer {
    pub fn new() -> Self {
        Self
    }

    pub fn compose(
        &self,
        memories: &[RecalledMemoryItem],
        graph_facts: &[String],
        profile: &UserProfile,
    ) -> String {
        let mut facts = Vec::new();
        let mut episodic = Vec::new();
        let mut insights = Vec::new();
        let mut other = Vec::new();

        for memory in memories {
            match memory.memory_type {
                MemoryType::Fact if facts.len() < MAX_FACTS => facts.push(memory),
                MemoryType::Episodic if episodic.len() < MAX_EPISODIC => episodic.push(memory),
                MemoryType::Insight if insights.len() < MAX_INSIGHTS => insights.push(memory),
                MemoryType::Other if other.len() < MAX_OTHER => other.push(memory),
                _ => {}
            }
        }

        let mut sections = vec![
            BASE_INSTRUCTION.to_string(),
            render_profile_section(profile),
            render_memory_section(HEADING_FACTS, &facts, "no relevant facts recalled"),
            render_memory_section(HEADING_EPISODIC, &episodic, "no shared moments recalled"),
            render_memory_section(HEADING_INSIGHTS, &insights, "no deeper insights yet"),
            render_graph_section(graph_facts),
            render_memory_section(HEADING_OTHER, &other, "none"),
        ];

        if let Some(hint) = emotional_hint(memories) {
            sections.push(hint.to_string());
        }

        sections.push(format!("{}\n{}", HEADING_GUIDELINES, CLOSING_GUIDELINES));

        sections.join("\n\n")
    }
}

fn render_profile_section(profile: &UserProfile) -> String {
    let mut lines = Vec::new();

    if let Some(identity) = &profile.identity {
        lines.push(format!("- Identity: {}", identity));
    }
    if let Some(occupation) = &profile.occupation {
        lines.push(format!("- Occupation: {}", occupation));
    }
    for (key, values) in [
        ("interests", &profile.interests),
        ("values", &profile.values),
        ("relationships", &profile.relationships),
        ("personality", &profile.personality),
    ] {
        if !values.is_empty() {
            lines.push(format!("- {}: {}", profile_label(key), values.join(", ")));
        }
    }
    // serde_json::Map iterates in key order, so pass-through keys are stable.
    for (key, value) in &profile.extra {
        lines.push(format!("- {}: {}", profile_label(key), render_value(value)));
    }

    if lines.is_empty() {
        lines.push("- nothing recorded yet".to_string());
    }

    format!("{}\n{}", HEADING_PROFILE, lines.join("\n"))
}

fn profile_label(key: &str) -> &str {
    PROFILE_LABELS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, label)| *label)
        .unwrap_or(key)
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(render_value)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

fn render_memory_section(
    heading: &str,
    memories: &[&RecalledMemoryItem],
    empty_placeholder: &str,
) -> String {
    if memories.is_empty() {
        return format!("{}\n- {}", heading, empty_placeholder);
    }

    let lines: Vec<String> = memories
        .iter()
        .map(|m| {
            format!(
                "- {} (relevance: {:.2}){}",
                m.content,
                m.score,
                tone_marker(m)
            )
        })
        .collect();

    format!("{}\n{}", heading, lines.join("\n"))
}

fn render_graph_section(graph_facts: &[String]) -> String {
    if graph_facts.is_empty() {
        return format!("{}\n- none", HEADING_GRAPH);
    }

    let lines: Vec<String> = graph_facts
        .iter()
        .take(MAX_GRAPH_FACTS)
        .map(|fact| format!("- {}", fact))
        .collect();

    format!("{}\n{}", HEADING_GRAPH, lines.join("\n"))
}

/// Per-memory tone marker from the emotion metadata: prefer the engine's
/// label, fall back to a coarse valence reading.
fn tone_marker(memory: &RecalledMemoryItem) -> String {
    let Some(emotion) = memory.emotion() else {
        return String::new();
    };

    if let Some(label) = emotion.label {
        return format!(" [feeling: {}]", label);
    }
    match emotion.valence {
        Some(v) if v < VALENCE_NEGATIVE_THRESHOLD => " [negative mood]".to_string(),
        Some(v) if v > VALENCE_POSITIVE_THRESHOLD => " [positive mood]".to_string(),
        _ => String::new(),
    }
}

/// Average valence over every memory carrying emotion metadata, mapped to a
/// supportive or celebratory instruction when it crosses a threshold.
fn emotional_hint(memories: &[RecalledMemoryItem]) -> Option<&'static str> {
    let valences: Vec<f32> = memories
        .iter()
        .filter_map(|m| m.emotion().and_then(|e| e.valence))
        .collect();

    if valences.is_empty() {
        return None;
    }

    let average = valences.iter().sum::<f32>() / valences.len() as f32;
    if average < VALENCE_NEGATIVE_THRESHOLD {
        Some(SUPPORTIVE_HINT)
    } else if average > VALENCE_POSITIVE_THRESHOLD {
        Some(POSITIVE_HINT)
    } else {
        None
    }
}
