pub const DEFAULT_SYSTEM_PROMPT: &str = "You are DeepList, a thoughtful and concise assistant. \
Answer clearly, use Markdown when it helps readability, and say so when you are unsure.";

/// Agent prompt, then the user's custom prompt, then the built-in default.
///
/// Blank prompts count as absent.
pub fn resolve_system_prompt(agent_prompt: Option<&str>, user_prompt: Option<&str>) -> String {
    [agent_prompt, user_prompt]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|prompt| !prompt.is_empty())
        .unwrap_or(DEFAULT_SYSTEM_PROMPT)
        .to_string()
}
