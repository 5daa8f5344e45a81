//! Prompt construction for answering and reranking

use crate::types::{Prompt, RetrievedDocument};

/// Characters of each candidate shown to the reranker
const RERANK_EXCERPT_CHARS: usize = 600;

const ANSWER_INSTRUCTIONS: &str = "You are a neutral assistant that helps voters understand party positions. \
Answer only from the numbered sources below. Cite every claim with its source number in square brackets, e.g. [2]. \
Attribute positions to the party that holds them and give each party the same tone. \
Do not recommend how to vote. If the sources do not answer the question, say so.";

const RERANK_INSTRUCTIONS: &str = "You select the passages that best answer a voter's question. \
Reply with a JSON object of the form {\"selected\": [indices]} listing at most the requested number \
of passage indices, most relevant first. Reply with the JSON object only.";

/// System prompt with numbered sources, user turn with the question
pub fn answer_prompt(question: &str, sources: &[RetrievedDocument]) -> Prompt {
    let mut system = String::from(ANSWER_INSTRUCTIONS);
    system.push_str("\n\nSources:\n");
    if sources.is_empty() {
        system.push_str("(none)\n");
    }
    for (i, doc) in sources.iter().enumerate() {
        system.push_str(&format!("[{}] ({}", i + 1, doc.namespace));
        if let Some(title) = &doc.title {
            system.push_str(&format!(", {}", title));
        }
        system.push_str(&format!(") {}\n", doc.text.trim()));
    }
    Prompt::new(system, question)
}

/// Candidates listed as `[i] (namespace) excerpt`, indices from 0
pub fn rerank_prompt(question: &str, candidates: &[RetrievedDocument], max_selected: usize) -> Prompt {
    let mut user = format!(
        "Question: {}\n\nSelect at most {} passages.\n\nPassages:\n",
        question.trim(),
        max_selected
    );
    for (i, doc) in candidates.iter().enumerate() {
        user.push_str(&format!(
            "[{}] ({}) {}\n",
            i,
            doc.namespace,
            excerpt(doc.text.trim(), RERANK_EXCERPT_CHARS)
        ));
    }
    Prompt::new(RERANK_INSTRUCTIONS, user)
}

fn excerpt(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}
