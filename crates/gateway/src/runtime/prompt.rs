//! System-prompt assembly for the generation stream.
//!
//! The base prompt teaches the tag protocol; skill packs add
//! framework-specific guidance and are selected by the workflow's
//! detected framework and the request mode.

use ed_providers::LlmMessage;

const BASE_PROMPT: &str = "\
You are Edward, a web-app generation agent. You build complete, working \
projects by streaming tagged output.

Protocol:
- Wrap all project files in one <edward_sandbox> ... </edward_sandbox> block.
- Emit each file as <file path=\"relative/path\">...contents...</file>. \
File contents are written verbatim; do not wrap them in markdown fences.
- Declare dependencies before the sandbox block:
  <edward_install>
  framework: <framework>
  packages: <comma-separated npm package names>
  </edward_install>
- To inspect the existing project, emit \
<edward_command command=\"<tool>\" args='[\"<arg>\", ...]'/> using only: \
cat, ls, find, head, tail, grep, wc. Stop after the tag; the result \
arrives in the next turn.
- To research, emit <edward_web_search query=\"...\" max_results=\"3\"/>.
- Finish with <edward_done/> once the project is complete.

Paths are workspace-relative. Never use absolute paths or '..'.";

/// Framework-specific skill packs.
fn skill_pack(framework: Option<&str>) -> Option<&'static str> {
    match framework {
        Some("next") | Some("nextjs") => Some(
            "Next.js guidance: app router under src/app; server components \
by default, 'use client' only where interaction demands it; Tailwind \
for styling; shadcn-style primitives in src/components/ui.",
        ),
        Some("vite") | Some("react") => Some(
            "Vite + React guidance: entry in src/main.tsx, app shell in \
src/App.tsx; keep components small and typed; index.html at the root.",
        ),
        _ => None,
    }
}

fn mode_guidance(mode: super::session::SessionMode) -> &'static str {
    match mode {
        super::session::SessionMode::Generate => {
            "Mode: generate. Produce the full project from scratch."
        }
        super::session::SessionMode::Fix => {
            "Mode: fix. The project state precedes this message. Inspect \
before changing; rewrite only the files that are broken, completely."
        }
        super::session::SessionMode::Edit => {
            "Mode: edit. Apply the requested change; rewrite each touched \
file completely, leave the rest alone."
        }
    }
}

/// Assemble the system message for one session.
pub fn build_system_prompt(
    mode: super::session::SessionMode,
    framework: Option<&str>,
    project_context: Option<&str>,
) -> LlmMessage {
    let mut prompt = String::from(BASE_PROMPT);
    prompt.push_str("\n\n");
    prompt.push_str(mode_guidance(mode));
    if let Some(pack) = skill_pack(framework) {
        prompt.push_str("\n\n");
        prompt.push_str(pack);
    }
    if let Some(context) = project_context {
        prompt.push_str("\n\nProject context:\n");
        prompt.push_str(context);
    }
    LlmMessage::system(prompt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::session::SessionMode;

    #[test]
    fn base_prompt_teaches_every_tag() {
        let msg = build_system_prompt(SessionMode::Generate, None, None);
        for tag in [
            "<edward_sandbox>",
            "<file path=",
            "<edward_install>",
            "<edward_command",
            "<edward_web_search",
            "<edward_done/>",
        ] {
            assert!(msg.content.contains(tag), "missing {tag}");
        }
    }

    #[test]
    fn framework_selects_skill_pack() {
        let next = build_system_prompt(SessionMode::Generate, Some("next"), None);
        assert!(next.content.contains("app router"));
        let plain = build_system_prompt(SessionMode::Generate, Some("svelte"), None);
        assert!(!plain.content.contains("app router"));
    }

    #[test]
    fn fix_mode_includes_project_context() {
        let msg = build_system_prompt(SessionMode::Fix, None, Some("src/a.ts: 12 lines"));
        assert!(msg.content.contains("Mode: fix"));
        assert!(msg.content.contains("src/a.ts"));
    }
}
