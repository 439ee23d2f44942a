//! Prompt construction and response normalization for the triage workflow.
//!
//! The model endpoint is chat-completions compatible and receives a single
//! user message per step. Responses come back as free text; the helpers here
//! reduce them to the strict shapes the workflow needs (a TP/FP verdict, a
//! bare code patch).

use crate::types::{NormalizedFinding, Verdict};

/// Build the triage prompt: criteria rubric plus the finding's context.
///
/// The rubric leans TP under uncertainty; false negatives are costlier than
/// false positives at this stage because the sanity check gates the output.
pub fn triage_prompt(finding: &NormalizedFinding) -> String {
    let snippet = if finding.snippet.is_empty() {
        "[no code snippet found]"
    } else {
        &finding.snippet
    };
    let message = if finding.message.is_empty() {
        "No issue description"
    } else {
        &finding.message
    };

    format!(
        "You are a Senior AppSec Engineer. Analyze the code for the specific issue described.\n\n\
         CRITERIA:\n\
         - If the code uses f-strings/concatenation in SQL: ALWAYS TP.\n\
         - If the code uses shell=True with user variables: ALWAYS TP.\n\
         - If the code uses pickle.loads(): ALWAYS TP.\n\
         - If you are unsure but it looks suspicious: respond TP.\n\n\
         CONTEXT:\n\
         File: {file}\n\
         Issue: {message}\n\
         Snippet:\n{snippet}\n\n\
         Respond ONLY with 'TP' or 'FP'.",
        file = finding.file,
    )
}

/// Build the red-team prompt requesting a proof-of-concept script.
pub fn red_team_prompt(finding: &NormalizedFinding) -> String {
    format!(
        "As a security researcher, generate a Python verification script (PoC) \
         to confirm the following vulnerability in a controlled sandbox environment. \
         Respond ONLY with the Python code.\n\n\
         Code to test:\n{}",
        finding.snippet
    )
}

/// Build the remediation prompt requesting the full corrected code block.
pub fn remediation_prompt(finding: &NormalizedFinding) -> String {
    format!(
        "Fix the security vulnerability in this code.\n\
         ISSUE: {}\n\
         CODE:\n{}\n\n\
         Respond ONLY with the full corrected code block.",
        finding.message, finding.snippet
    )
}

/// Normalize a raw model response into a verdict.
///
/// Non-letters are stripped and the rest uppercased; anything containing
/// "TP" is a true positive, everything else a false positive.
pub fn parse_verdict(response: &str) -> Verdict {
    let normalized: String = response
        .chars()
        .filter(char::is_ascii_alphabetic)
        .collect::<String>()
        .to_ascii_uppercase();
    if normalized.contains("TP") {
        Verdict::Tp
    } else {
        Verdict::Fp
    }
}

/// Strip markdown code-fence markers from a model-generated patch.
pub fn strip_code_fences(response: &str) -> String {
    response
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(message: &str, snippet: &str) -> NormalizedFinding {
        NormalizedFinding {
            tool: "Semgrep".to_string(),
            rule_id: None,
            message: message.to_string(),
            file: "app.py".to_string(),
            line: 12,
            dast_endpoint: None,
            snippet: snippet.to_string(),
        }
    }

    #[test]
    fn triage_prompt_includes_context() {
        let f = finding("SQL built from user input", "query = f\"SELECT {u}\"");
        let prompt = triage_prompt(&f);
        assert!(prompt.contains("File: app.py"));
        assert!(prompt.contains("SQL built from user input"));
        assert!(prompt.contains("SELECT {u}"));
        assert!(prompt.contains("Respond ONLY with 'TP' or 'FP'."));
    }

    #[test]
    fn triage_prompt_handles_empty_snippet() {
        let f = finding("issue", "");
        assert!(triage_prompt(&f).contains("[no code snippet found]"));
    }

    #[test]
    fn parse_verdict_handles_noise() {
        assert_eq!(parse_verdict("TP"), Verdict::Tp);
        assert_eq!(parse_verdict("  t.p!\n"), Verdict::Tp);
        assert_eq!(parse_verdict("This is a true positive (TP)."), Verdict::Tp);
        assert_eq!(parse_verdict("FP"), Verdict::Fp);
        assert_eq!(parse_verdict("benign"), Verdict::Fp);
        assert_eq!(parse_verdict(""), Verdict::Fp);
    }

    #[test]
    fn strip_code_fences_removes_markers() {
        let response = "```python\nquery = \"SELECT * FROM users WHERE u = ?\"\n```\n";
        assert_eq!(
            strip_code_fences(response),
            "query = \"SELECT * FROM users WHERE u = ?\""
        );
    }

    #[test]
    fn strip_code_fences_keeps_plain_text() {
        assert_eq!(strip_code_fences("x = 1\ny = 2"), "x = 1\ny = 2");
    }

    #[test]
    fn strip_code_fences_handles_multiple_blocks() {
        let response = "```\na\n```\nmiddle\n```rust\nb\n```";
        assert_eq!(strip_code_fences(response), "a\nmiddle\nb");
    }
}
