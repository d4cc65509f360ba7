use crate::error::EvalError;
use crate::extractor::ExtractedText;
use crate::models::{ChunkingStrategy, Configuration};
use regex::Regex;
use std::num::NonZeroUsize;
use std::sync::OnceLock;

/// BPE windows carry their own leading spaces, so token chunks concatenate
/// directly.
pub const TOKEN_SEPARATOR: &str = "";
pub const SENTENCE_SEPARATOR: &str = " ";
pub const PARAGRAPH_SEPARATOR: &str = "\n\n";
pub const PAGE_SEPARATOR: &str = "\n\n";

const SENTENCE_BOUNDARY: &str = r#"[.!?]+["')\]]*\s+"#;
const PARAGRAPH_BOUNDARY: &str = r"\n[ \t\r\f]*\n\s*";
const TOKEN_ENCODING: &str = "cl100k_base";

static SENTENCE_REGEX: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
static PARAGRAPH_REGEX: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

fn compiled(
    cell: &'static OnceLock<Result<Regex, regex::Error>>,
    pattern: &str,
) -> Result<&'static Regex, EvalError> {
    cell.get_or_init(|| Regex::new(pattern))
        .as_ref()
        .map_err(|error| EvalError::Regex(error.clone()))
}

pub fn normalize_whitespace(text: &str) -> String {
    text.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Splits a document according to the configuration's strategy. Chunk order
/// is authoritative: position `i` becomes chunk number `i + 1` downstream.
pub fn split_document(
    configuration: &Configuration,
    text: &ExtractedText,
) -> Result<Vec<String>, EvalError> {
    let size = configuration.chunk_size()?;

    match configuration.chunking_strategy {
        ChunkingStrategy::Token => chunk_by_tokens(&text.full_text, size),
        ChunkingStrategy::Sentence => chunk_by_sentences(&text.full_text, size),
        ChunkingStrategy::Paragraph => chunk_by_paragraphs(&text.full_text, size),
        ChunkingStrategy::Page => Ok(chunk_by_pages(&text.pages, size)),
    }
}

/// Fixed windows of `cl100k_base` tokens over the whitespace-normalized text.
/// The last window may be short. A window that would end inside a multi-byte
/// character is widened until it decodes.
pub fn chunk_by_tokens(text: &str, size: NonZeroUsize) -> Result<Vec<String>, EvalError> {
    let bpe = tiktoken_rs::cl100k_base()
        .map_err(|error| EvalError::Tokenizer(format!("{TOKEN_ENCODING}: {error}")))?;
    let normalized = normalize_whitespace(text);
    let tokens = bpe.encode_ordinary(&normalized);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < tokens.len() {
        let mut end = (start + size.get()).min(tokens.len());
        let chunk = loop {
            match bpe.decode(tokens[start..end].to_vec()) {
                Ok(chunk) => break chunk,
                Err(_) if end < tokens.len() => end += 1,
                Err(error) => {
                    return Err(EvalError::Tokenizer(format!("{TOKEN_ENCODING}: {error}")))
                }
            }
        };
        chunks.push(chunk);
        start = end;
    }
    Ok(chunks)
}

pub fn split_sentences(text: &str) -> Result<Vec<String>, EvalError> {
    let normalized = normalize_whitespace(text);
    let boundary = compiled(&SENTENCE_REGEX, SENTENCE_BOUNDARY)?;

    let mut sentences = Vec::new();
    let mut start = 0;
    for found in boundary.find_iter(&normalized) {
        push_trimmed(&mut sentences, &normalized[start..found.end()]);
        start = found.end();
    }
    push_trimmed(&mut sentences, &normalized[start..]);

    Ok(sentences)
}

pub fn chunk_by_sentences(text: &str, size: NonZeroUsize) -> Result<Vec<String>, EvalError> {
    let sentences = split_sentences(text)?;
    Ok(group(&sentences, size, SENTENCE_SEPARATOR))
}

pub fn split_paragraphs(text: &str) -> Result<Vec<String>, EvalError> {
    let boundary = compiled(&PARAGRAPH_REGEX, PARAGRAPH_BOUNDARY)?;
    let paragraphs = boundary
        .split(text)
        .map(|paragraph| paragraph.trim().to_string())
        .filter(|paragraph| !paragraph.is_empty())
        .collect();
    Ok(paragraphs)
}

pub fn chunk_by_paragraphs(text: &str, size: NonZeroUsize) -> Result<Vec<String>, EvalError> {
    let paragraphs = split_paragraphs(text)?;
    Ok(group(&paragraphs, size, PARAGRAPH_SEPARATOR))
}

/// Groups consecutive source pages. Blank pages carry no retrievable text
/// and are skipped before grouping.
pub fn chunk_by_pages(pages: &[String], size: NonZeroUsize) -> Vec<String> {
    let pages = pages
        .iter()
        .map(|page| page.trim().to_string())
        .filter(|page| !page.is_empty())
        .collect::<Vec<_>>();
    group(&pages, size, PAGE_SEPARATOR)
}

fn group(items: &[String], size: NonZeroUsize, separator: &str) -> Vec<String> {
    items
        .chunks(size.get())
        .map(|window| window.join(separator))
        .collect()
}

fn push_trimmed(target: &mut Vec<String>, piece: &str) {
    let trimmed = piece.trim();
    if !trimmed.is_empty() {
        target.push(trimmed.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkSizes, SimilarityMetric};

    fn size(value: usize) -> NonZeroUsize {
        NonZeroUsize::new(value).unwrap()
    }

    const SAMPLE: &str = "The budget is ten million.  It covers two years!\n\nStaffing is the largest cost. Is travel included? Yes.\n\n\n  Equipment comes last.";

    #[test]
    fn whitespace_is_normalized() {
        let input = "A  \t  lot\nof   spacing\u{a0}here";
        assert_eq!(normalize_whitespace(input), "A lot of spacing here");
    }

    fn token_count(text: &str) -> usize {
        tiktoken_rs::cl100k_base()
            .unwrap()
            .encode_ordinary(&normalize_whitespace(text))
            .len()
    }

    #[test]
    fn token_windows_are_fixed_and_last_may_be_short() {
        let total = token_count(SAMPLE);
        assert!(total > 3);

        let chunks = chunk_by_tokens(SAMPLE, size(3)).unwrap();
        assert_eq!(chunks.len(), total.div_ceil(3));
        assert!(chunks.iter().all(|chunk| !chunk.is_empty()));

        let whole = chunk_by_tokens(SAMPLE, size(total + 10)).unwrap();
        assert_eq!(whole, vec![normalize_whitespace(SAMPLE)]);
    }

    #[test]
    fn token_chunks_reconstruct_source() {
        let chunks = chunk_by_tokens(SAMPLE, size(3)).unwrap();
        assert_eq!(chunks.join(TOKEN_SEPARATOR), normalize_whitespace(SAMPLE));
    }

    #[test]
    fn token_windows_never_split_characters() {
        let text = "naïve café 日本語のテキスト 🚀🚀 done";
        let chunks = chunk_by_tokens(text, size(1)).unwrap();
        assert!(chunks.iter().all(|chunk| !chunk.is_empty()));
        assert_eq!(chunks.concat(), normalize_whitespace(text));
    }

    #[test]
    fn empty_text_has_no_token_chunks() {
        assert!(chunk_by_tokens("   ", size(4)).unwrap().is_empty());
    }

    #[test]
    fn boundary_patterns_compile_once() {
        let first = compiled(&SENTENCE_REGEX, SENTENCE_BOUNDARY).unwrap();
        let second = compiled(&SENTENCE_REGEX, SENTENCE_BOUNDARY).unwrap();
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn sentences_are_grouped() {
        let chunks = chunk_by_sentences(SAMPLE, size(2)).unwrap();
        assert_eq!(
            chunks,
            vec![
                "The budget is ten million. It covers two years!",
                "Staffing is the largest cost. Is travel included?",
                "Yes. Equipment comes last.",
            ]
        );
        assert_eq!(chunks.join(SENTENCE_SEPARATOR), normalize_whitespace(SAMPLE));
    }

    #[test]
    fn paragraphs_split_on_blank_lines() {
        let chunks = chunk_by_paragraphs(SAMPLE, size(1)).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], "Equipment comes last.");

        let paragraphs = split_paragraphs(SAMPLE).unwrap();
        let grouped = chunk_by_paragraphs(SAMPLE, size(2)).unwrap();
        assert_eq!(grouped.len(), 2);
        assert_eq!(
            grouped.join(PARAGRAPH_SEPARATOR),
            paragraphs.join(PARAGRAPH_SEPARATOR)
        );
    }

    #[test]
    fn paragraph_chunks_reconstruct_source() {
        let source = "col1\tcol2\nrow line\n\nnext paragraph\n\nlast one";
        for group_size in 1..=3 {
            let chunks = chunk_by_paragraphs(source, size(group_size)).unwrap();
            assert_eq!(chunks.join(PARAGRAPH_SEPARATOR), source);
        }
        assert_eq!(
            chunk_by_paragraphs(source, size(1)).unwrap()[0],
            "col1\tcol2\nrow line"
        );
    }

    #[test]
    fn page_chunks_reconstruct_source() {
        let pages = vec![
            "Intro\twith tab".to_string(),
            "Budget\nline two".to_string(),
            "Timeline".to_string(),
        ];
        let extracted = ExtractedText::from_pages(pages.clone());
        for group_size in 1..=3 {
            let chunks = chunk_by_pages(&pages, size(group_size));
            assert_eq!(chunks.join(PAGE_SEPARATOR), pages.join(PAGE_SEPARATOR));
            assert_eq!(
                format!("{}{PAGE_SEPARATOR}", chunks.join(PAGE_SEPARATOR)),
                extracted.full_text
            );
        }
    }

    #[test]
    fn pages_are_grouped_and_blank_pages_skipped() {
        let pages = vec![
            "Page one".to_string(),
            "  ".to_string(),
            "Page two".to_string(),
            "Page three".to_string(),
        ];
        assert_eq!(chunk_by_pages(&pages, size(1)).len(), 3);
        assert_eq!(
            chunk_by_pages(&pages, size(2)),
            vec!["Page one\n\nPage two", "Page three"]
        );
    }

    #[test]
    fn split_document_requires_the_matching_size() {
        let configuration = Configuration {
            id: "cfg".to_string(),
            chunking_strategy: ChunkingStrategy::Paragraph,
            sizes: ChunkSizes {
                sentence_size: Some(3),
                ..Default::default()
            },
            embedding_model: "local-ngram".to_string(),
            similarity_metric: SimilarityMetric::Cosine,
            top_k: 2,
        };
        let text = ExtractedText::from_pages(vec![SAMPLE.to_string()]);

        assert!(matches!(
            split_document(&configuration, &text),
            Err(EvalError::Configuration(_))
        ));
    }

    #[test]
    fn page_strategy_operates_on_page_list() {
        let configuration = Configuration {
            id: "cfg".to_string(),
            chunking_strategy: ChunkingStrategy::Page,
            sizes: ChunkSizes {
                page_size: Some(1),
                ..Default::default()
            },
            embedding_model: "local-ngram".to_string(),
            similarity_metric: SimilarityMetric::Cosine,
            top_k: 2,
        };
        let text = ExtractedText::from_pages(vec![
            "Intro".to_string(),
            "Budget".to_string(),
            "Timeline".to_string(),
        ]);

        let chunks = split_document(&configuration, &text).unwrap();
        assert_eq!(chunks, vec!["Intro", "Budget", "Timeline"]);
    }
}
