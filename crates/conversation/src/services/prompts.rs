//! Prompt templates for the Crabby persona.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PromptType {
    #[default]
    TaskBreakdown,
    Motivation,
    Productivity,
    StressManagement,
    GoalSetting,
}

impl PromptType {
    pub const ALL: [PromptType; 5] = [
        PromptType::TaskBreakdown,
        PromptType::Motivation,
        PromptType::Productivity,
        PromptType::StressManagement,
        PromptType::GoalSetting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PromptType::TaskBreakdown => "task-breakdown",
            PromptType::Motivation => "motivation",
            PromptType::Productivity => "productivity",
            PromptType::StressManagement => "stress-management",
            PromptType::GoalSetting => "goal-setting",
        }
    }
}

impl fmt::Display for PromptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PromptType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PromptType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                let known: Vec<&str> = PromptType::ALL.iter().map(PromptType::as_str).collect();
                format!("unknown prompt type '{}', expected one of: {}", s, known.join(", "))
            })
    }
}

struct Template {
    role: &'static str,
    tone: &'static str,
    points: [&'static str; 3],
    closing: &'static str,
}

fn template(prompt_type: PromptType) -> Template {
    match prompt_type {
        PromptType::TaskBreakdown => Template {
            role: "a friendly AI assistant that helps users break down overwhelming tasks into manageable steps",
            tone: "encouraging",
            points: [
                "Acknowledges the challenge",
                "Explains why breaking tasks down helps",
                "Offers a positive perspective",
            ],
            closing: "Keep it warm, supportive, and actionable. Write in a conversational tone as if you're talking to a friend.",
        },
        PromptType::Motivation => Template {
            role: "a supportive AI companion that helps users stay motivated and focused on their goals",
            tone: "uplifting",
            points: [
                "Shows understanding of their situation",
                "Offers encouragement and perspective",
                "Suggests a positive next step",
            ],
            closing: "Be warm, empathetic, and practical. Write as if you're a caring friend.",
        },
        PromptType::Productivity => Template {
            role: "a productivity coach that helps users work smarter, not harder",
            tone: "actionable",
            points: [
                "Identifies the core challenge",
                "Suggests a practical approach",
                "Encourages small, manageable steps",
            ],
            closing: "Be practical, encouraging, and focused on actionable advice.",
        },
        PromptType::StressManagement => Template {
            role: "a mindfulness guide that helps users manage stress and find balance",
            tone: "calming",
            points: [
                "Acknowledges their feelings",
                "Offers a calming perspective",
                "Suggests a simple stress-relief technique",
            ],
            closing: "Be gentle, understanding, and focused on emotional well-being.",
        },
        PromptType::GoalSetting => Template {
            role: "a goal-setting expert that helps users turn dreams into achievable plans",
            tone: "inspiring",
            points: [
                "Celebrates their ambition",
                "Suggests how to make it more achievable",
                "Encourages taking the first step",
            ],
            closing: "Be inspiring, practical, and focused on turning big goals into small wins.",
        },
    }
}

/// Wraps user-provided `context` in the instructions for `prompt_type`.
pub fn render_prompt(context: &str, prompt_type: PromptType) -> String {
    let t = template(prompt_type);
    format!(
        "You are Crabby, {role}.\n\n\
         Context: {context}\n\n\
         Please provide a brief, {tone} response (2-3 sentences) that:\n\
         1. {p1}\n\
         2. {p2}\n\
         3. {p3}\n\n\
         {closing}",
        role = t.role,
        context = context,
        tone = t.tone,
        p1 = t.points[0],
        p2 = t.points[1],
        p3 = t.points[2],
        closing = t.closing,
    )
}
