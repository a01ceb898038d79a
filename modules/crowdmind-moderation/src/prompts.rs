// Prompt templates for the analysis service.
//
// Every template asks for bare JSON; `response` copes when the model wraps
// it in a code fence anyway.

use crowdmind_common::Thread;

const NO_SUMMARY: &str = "No summary available";
const NO_CONTEXT: &str = "No context";

pub fn batch_prompt(summary: Option<&str>, comments: &[String]) -> String {
    let listing: String = comments
        .iter()
        .enumerate()
        .map(|(i, text)| format!("{i}. \"{text}\"\n"))
        .collect();

    format!(
        r#"You are analyzing a batch of comments posted to one discussion thread.

Thread Summary: """{summary}"""

Comments to analyze, numbered from 0:
{listing}
For each comment, in the same order, produce an object with:
- relevance_score: integer 1-100, how relevant the comment is to the thread
- has_factual_claims: true or false
- factual_accuracy: "verified", "disputed" or "unverifiable"
- analysis_notes: one short sentence

Return only JSON in exactly this shape, with one entry per comment and no markdown:
{{
  "comments": [
    {{ "relevance_score": <number>, "has_factual_claims": <bool>, "factual_accuracy": "<string>", "analysis_notes": "<string>" }}
  ]
}}"#,
        summary = summary.unwrap_or(NO_SUMMARY),
    )
}

pub fn relevance_prompt(title: &str, summary: Option<&str>, comment: &str) -> String {
    format!(
        r#"You are a strict moderator scoring how relevant a comment is to its discussion thread.

Thread Title: """{title}"""
Thread Summary: """{summary}"""
Comment: """{comment}"""

Work out the core topic of the thread and what the comment actually says, then decide
whether the comment addresses that topic directly. Do not invent loose or metaphorical
connections between unrelated subjects.

Rubric:
- 1-10: off-topic, random facts or spam (anything from an unrelated domain lands here)
- 11-30: generic remarks with no specific link to the thread ("Good post")
- 31-60: tangential, misses the main point
- 61-80: relevant but minor or repetitive
- 81-100: directly on-topic and adds something

Return only a JSON object, no markdown:
{{
  "analysis": "<1-2 sentences on why the comment fits or does not>",
  "relevance_score": <number 1-100>,
  "verdict": "<Relevant or Off-topic>"
}}"#,
        summary = summary.unwrap_or(NO_SUMMARY),
    )
}

pub fn fact_check_prompt(comment: &str, context: Option<&str>) -> String {
    format!(
        r#"You are a fact-checker. Only assess claims; never supply facts of your own.

First decide whether the comment makes specific factual claims (dates, statistics,
scientific or historical facts, numbers, named sources). Then judge those claims against
widely known information. Anything you cannot confirm is "unverifiable"; do not guess.

Comment: """{comment}"""
Thread Context: """{context}"""

Rules:
- No factual claims: has_factual_claims = false and factual_accuracy = "unverifiable"
- "verified" only for claims that are widely accepted as accurate
- "disputed" only for claims that contradict widely accepted facts

Return only a JSON object, no markdown:
{{
  "has_factual_claims": <bool>,
  "factual_accuracy": "<verified | disputed | unverifiable>",
  "findings": "<1-2 short sentences on what was checked>",
  "flags": ["<misleading or false claim>"]
}}"#,
        context = context.unwrap_or(NO_CONTEXT),
    )
}

pub fn summary_prompt(thread: &Thread) -> String {
    let comments: Vec<String> = thread
        .comments
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. {}: \"{}\"", i + 1, c.username, c.text))
        .collect();

    format!(
        r#"Analyze this discussion and provide:
1. A brief context of what the discussion is about
2. A summary of the key points, arguments and conclusions

Discussion:
Title: "{title}"
Description: "{description}"
Tags: {tags}

Comments ({count} total):
{comments}

Return only JSON, no markdown:
{{
  "context": "<brief context of the topic>",
  "summary": "<summary of key points and arguments>"
}}"#,
        title = thread.title,
        description = thread.description,
        tags = thread.tags.join(", "),
        count = thread.comments.len(),
        comments = comments.join("\n"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crowdmind_common::Comment;

    #[test]
    fn batch_prompt_numbers_comments_positionally() {
        let prompt = batch_prompt(
            Some("Transit budget"),
            &["Buses first".to_string(), "Trains are cheaper".to_string()],
        );
        assert!(prompt.contains("Thread Summary: \"\"\"Transit budget\"\"\""));
        assert!(prompt.contains("0. \"Buses first\"\n1. \"Trains are cheaper\""));
    }

    #[test]
    fn missing_summary_has_placeholder() {
        assert!(batch_prompt(None, &[]).contains(NO_SUMMARY));
        assert!(relevance_prompt("T", None, "c").contains(NO_SUMMARY));
        assert!(fact_check_prompt("c", None).contains(NO_CONTEXT));
    }

    #[test]
    fn summary_prompt_lists_comments_from_one() {
        let mut thread = Thread::new("t1", "Parks");
        thread.tags = vec!["city".into(), "green".into()];
        thread.push_comment(Comment::new("ana", "More trees"));
        let prompt = summary_prompt(&thread);
        assert!(prompt.contains("1. ana: \"More trees\""));
        assert!(prompt.contains("Tags: city, green"));
        assert!(prompt.contains("Comments (1 total)"));
    }
}
