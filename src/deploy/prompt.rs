//! Prompt text for one deployment turn.

use std::path::Path;

use super::staging::REQUIRED_FILES;

#[derive(Debug, Clone)]
pub struct PromptContext<'a> {
    pub app_id: &'a str,
    pub app_dir: &'a Path,
    pub port: u16,
    pub app_name: &'a str,
    pub app_type: &'a str,
    /// Idea history plus the previous output preview.
    pub combined_idea_text: &'a str,
    pub is_new_app: bool,
}

pub fn build_prompt(ctx: &PromptContext<'_>) -> String {
    let dir = ctx.app_dir.display();
    let mut lines = vec![
        "[Role]".to_string(),
        "You are a senior full-stack engineer and a strict code reviewer. Turn the requirements into a runnable Node.js (>=22) + Express web application and keep iterating on it.".to_string(),
        String::new(),
        "[Working directory]".to_string(),
        format!("- The only directory you may read or write: {}", dir),
        format!("- Never create or modify files outside {}", dir),
        "- Do not create a new project root; work in place".to_string(),
        "- Do not produce unrelated documents or logs (README, reports) unless asked".to_string(),
        String::new(),
        "[Fixed constraints]".to_string(),
        format!("- The server port must stay {} (do not change what server.js listens on)", ctx.port),
    ];

    lines.push(if ctx.is_new_app {
        "- First generation: the directory only holds metadata.json and an empty public/; create the complete application".to_string()
    } else {
        "- Incremental iteration: change the existing implementation in small steps, do not start over".to_string()
    });

    lines.push("- These files must exist and work:".to_string());
    for file in REQUIRED_FILES {
        let note = match file {
            "package.json" => " (with a start script: node server.js)".to_string(),
            "server.js" => format!(
                " (Express server on {}, serving public/ statically, with a health check route)",
                ctx.port
            ),
            _ => String::new(),
        };
        lines.push(format!("  - {}/{}{}", dir, file, note));
    }
    lines.extend([
        "- Keep dependencies minimal; any new dependency must be declared in package.json".to_string(),
        "- Give the application a short descriptive name in the metadata.json `name` field, and update `type` when it helps".to_string(),
        String::new(),
        "[Requirements, oldest first]".to_string(),
        ctx.combined_idea_text.to_string(),
        String::new(),
        "[Workflow]".to_string(),
        "1) Start with a 3-7 step plan down to files and features".to_string(),
        format!("2) Create or modify the necessary files inside {}", dir),
        "3) Self-check: the server starts, the main page loads, no obvious runtime errors".to_string(),
        "4) Finish with: completed plan items, changed files (one line each), how to run and verify".to_string(),
        format!("   (http://localhost:{}), and any assumptions you made", ctx.port),
        String::new(),
        "[Policy]".to_string(),
        "- When a requirement is unclear, do not stop to ask; choose a sensible default and list it as an assumption".to_string(),
        format!("- Keep tool calls few and complete; every written path must be inside {}", dir),
        String::new(),
        format!("[Application] {}/{} (appId={})", ctx.app_name, ctx.app_type, ctx.app_id),
    ]);
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(is_new_app: bool) -> PromptContext<'static> {
        PromptContext {
            app_id: "app_1",
            app_dir: Path::new("/apps/.staging/app_1"),
            port: 3007,
            app_name: "Counter",
            app_type: "tool",
            combined_idea_text: "add a counter button\nnow style it",
            is_new_app,
        }
    }

    #[test]
    fn test_prompt_embeds_boundary_port_and_history() {
        let prompt = build_prompt(&ctx(true));
        assert!(prompt.contains("The only directory you may read or write: /apps/.staging/app_1"));
        assert!(prompt.contains("must stay 3007"));
        assert!(prompt.contains("add a counter button\nnow style it"));
        assert!(prompt.contains("First generation"));
        for file in REQUIRED_FILES {
            assert!(prompt.contains(file));
        }
        assert!(prompt.ends_with("[Application] Counter/tool (appId=app_1)"));
    }

    #[test]
    fn test_prompt_iteration_wording() {
        let prompt = build_prompt(&ctx(false));
        assert!(prompt.contains("Incremental iteration"));
        assert!(!prompt.contains("First generation"));
    }
}
