//! Turning retrieved chunks into model prompts.

use super::SearchHit;

/// System prompt for grounded question answering. `{context}` is replaced
/// with the rendered reference material.
const ANSWER_PROMPT_TEMPLATE: &str = "\
# Task
You are an online customer service assistant. Answer the user's question using \
the reference material enclosed in the <context></context> XML tags. Keep the \
answer accurate and concise.

Your answer must meet these requirements:
1. Stay strictly within the reference material. Answer as briefly as possible \
and do not add explanations beyond it.
2. Keep a friendly tone that fits the user's question and the material.
3. If the material cannot answer the question, say so and ask the user for more \
detail.
4. For confidentiality, politely decline questions about document names or \
document authors.

# Execution
Answer the user's question from the reference material, following the rules \
above. Be accurate and complete.

# Reference material
<context>
{context}
</context>";

/// Rendered reference material plus any image links to attach.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderedContext {
    pub prompt: String,
    pub image_urls: Vec<String>,
}

/// Text for one chunk inside a prompt.
///
/// FAQ chunks become a question/answer pair. When `image_number` is
/// non-zero and the chunk has an image, an `<img>` placeholder pointing at
/// that image is appended.
pub fn content_for_prompt(hit: &SearchHit, image_number: usize) -> String {
    if let Some(question) = hit.original_question.as_deref().filter(|q| !q.is_empty()) {
        return format!(
            "When asked a similar question, answer with the matching answer. \
Question: \"{question}\". Answer: \"{}\"",
            hit.content
        );
    }

    if image_number > 0 && hit.image_link.is_some() {
        return format!("{}<img>image {image_number}</img>", hit.content);
    }

    hit.content.clone()
}

/// Collect image links (only for vision models) and number them in
/// retrieval order. Returns the per-hit image number (0 for none).
pub(crate) fn number_images(hits: &[SearchHit], vision: bool) -> (Vec<usize>, Vec<String>) {
    let mut numbers = Vec::with_capacity(hits.len());
    let mut urls = Vec::new();
    for hit in hits {
        match hit.image_link.as_ref().filter(|_| vision) {
            Some(link) if !link.is_empty() => {
                urls.push(link.clone());
                numbers.push(urls.len());
            }
            _ => numbers.push(0),
        }
    }
    (numbers, urls)
}

/// Build the grounded-answer system prompt from retrieval results.
pub fn build_answer_prompt(hits: &[SearchHit], vision: bool) -> RenderedContext {
    let (numbers, image_urls) = number_images(hits, vision);

    let mut context = String::new();
    for (hit, image_number) in hits.iter().zip(numbers) {
        context.push_str(&format!("doc_name: {}\n", hit.doc_name));
        context.push_str(&format!("title: {}\n", hit.doc_title));
        context.push_str(&format!("chunk_title: {}\n", hit.chunk_title));
        context.push_str(&format!(
            "content: {}\n",
            content_for_prompt(hit, image_number)
        ));
        context.push_str("---\n");
    }

    RenderedContext {
        prompt: ANSWER_PROMPT_TEMPLATE.replace("{context}", &context),
        image_urls,
    }
}
