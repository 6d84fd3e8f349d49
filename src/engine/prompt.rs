//! Iteration prompt assembly.

use crate::tracker::Task;

/// The literal token an agent emits to declare a task done. Matched as a
/// plain substring on the decoded output stream.
pub const COMPLETION_SENTINEL: &str = "<promise>COMPLETE</promise>";

/// Build the prompt for one task. `project_context` is caller-supplied
/// static text prepended verbatim; secrets never belong in it.
pub fn build_prompt(task: &Task, closure_instruction: &str, project_context: Option<&str>) -> String {
    let mut prompt = String::new();

    if let Some(context) = project_context {
        if !context.trim().is_empty() {
            prompt.push_str("## PROJECT CONTEXT\n");
            prompt.push_str(context.trim_end());
            prompt.push_str("\n\n");
        }
    }

    prompt.push_str(&format!(
        "## TASK {id}\n{title}\n",
        id = task.id,
        title = task.title
    ));

    if !task.description.trim().is_empty() {
        prompt.push_str(&format!("\n## DESCRIPTION\n{}\n", task.description.trim_end()));
    }
    if !task.acceptance.trim().is_empty() {
        prompt.push_str(&format!(
            "\n## ACCEPTANCE CRITERIA\n{}\n",
            task.acceptance.trim_end()
        ));
    }

    prompt.push_str(&format!("\n## TASK TRACKING\n{}\n", closure_instruction));

    prompt.push_str(&format!(
        "\n## COMPLETION\n\
         Work on this one task only.\n\
         When the task is FULLY complete and verified, output exactly:\n\
         {COMPLETION_SENTINEL}\n\
         If you cannot finish, describe what remains and do NOT output the token.",
    ));

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        let mut t = Task::new("TEST-004", "Merge A and B");
        t.description = "Combine output-a.txt and output-b.txt into merged-ab.txt".to_string();
        t.acceptance = "merged-ab.txt exists and holds both lines".to_string();
        t
    }

    #[test]
    fn prompt_contains_all_sections() {
        let prompt = build_prompt(&task(), "closure goes here", Some("repo uses tabs"));
        assert!(prompt.contains("## PROJECT CONTEXT\nrepo uses tabs"));
        assert!(prompt.contains("## TASK TEST-004\nMerge A and B"));
        assert!(prompt.contains("## DESCRIPTION\nCombine output-a.txt"));
        assert!(prompt.contains("## ACCEPTANCE CRITERIA\nmerged-ab.txt exists"));
        assert!(prompt.contains("closure goes here"));
        assert!(prompt.contains(COMPLETION_SENTINEL));
    }

    #[test]
    fn empty_sections_are_omitted() {
        let bare = Task::new("T-1", "bare task");
        let prompt = build_prompt(&bare, "closure", None);
        assert!(!prompt.contains("## PROJECT CONTEXT"));
        assert!(!prompt.contains("## DESCRIPTION"));
        assert!(!prompt.contains("## ACCEPTANCE CRITERIA"));
        assert!(prompt.contains("## TASK T-1"));
    }

    #[test]
    fn sentinel_is_the_literal_token() {
        assert_eq!(COMPLETION_SENTINEL, "<promise>COMPLETE</promise>");
    }
}
