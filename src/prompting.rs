use minijinja::{context, Environment};

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");

pub struct SystemPromptContext<'a> {
    pub persona: &'a str,
    pub knowledge_base: &'a str,
    pub max_response_chars: i32,
}

pub fn render_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut env = Environment::new();
    if env
        .add_template("system_prompt", SYSTEM_PROMPT_TEMPLATE)
        .is_err()
    {
        return fallback_system_prompt(ctx);
    }

    let Ok(template) = env.get_template("system_prompt") else {
        return fallback_system_prompt(ctx);
    };

    template
        .render(context! {
            persona => ctx.persona.trim(),
            knowledge_base => ctx.knowledge_base.trim(),
            max_response_chars => ctx.max_response_chars,
            has_persona => !ctx.persona.trim().is_empty(),
            has_knowledge_base => !ctx.knowledge_base.trim().is_empty(),
        })
        .unwrap_or_else(|_| fallback_system_prompt(ctx))
}

fn fallback_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut prompt = format!(
        "You are the first-response assistant for a customer support chat.\n\
         Reply in plain text with no markdown. Be concise and stay under {} characters.\n\
         Always mention that a human teammate will follow up shortly.\n\
         Never invent facts; if you do not know, say so.\n",
        ctx.max_response_chars
    );

    if !ctx.persona.trim().is_empty() {
        prompt.push_str("\nPersona:\n");
        prompt.push_str(ctx.persona.trim());
        prompt.push('\n');
    }

    if !ctx.knowledge_base.trim().is_empty() {
        prompt.push_str("\nKnowledge base:\n");
        prompt.push_str(ctx.knowledge_base.trim());
        prompt.push('\n');
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_prompt_includes_persona_and_rules() {
        let prompt = render_system_prompt(&SystemPromptContext {
            persona: "Friendly and brief.",
            knowledge_base: "We ship within 3 days.",
            max_response_chars: 400,
        });
        assert!(prompt.contains("Friendly and brief."));
        assert!(prompt.contains("We ship within 3 days."));
        assert!(prompt.contains("400"));
        assert!(prompt.contains("human"));
    }

    #[test]
    fn empty_sections_are_omitted() {
        let prompt = render_system_prompt(&SystemPromptContext {
            persona: "",
            knowledge_base: "",
            max_response_chars: 600,
        });
        assert!(!prompt.contains("Persona"));
        assert!(!prompt.contains("Knowledge base"));
    }
}
