use crate::error::EvalError;
use lopdf::Document;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["pdf", "txt", "md"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedText {
    pub full_text: String,
    pub pages: Vec<String>,
}

impl ExtractedText {
    /// Full text is every page followed by a blank line, matching how page
    /// boundaries look to the paragraph splitter.
    pub fn from_pages(pages: Vec<String>) -> Self {
        let full_text = pages
            .iter()
            .map(|page| format!("{page}\n\n"))
            .collect::<String>();
        Self { full_text, pages }
    }
}

pub trait TextExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<ExtractedText, EvalError>;
}

#[derive(Debug, Default)]
pub struct LopdfExtractor;

impl TextExtractor for LopdfExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedText, EvalError> {
        let document =
            Document::load(path).map_err(|error| EvalError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| EvalError::PdfParse(error.to_string()))?;
            pages.push(text);
        }

        if pages.iter().all(|page| page.trim().is_empty()) {
            return Err(EvalError::PdfParse(format!(
                "pdf had no readable page text: {}",
                path.display()
            )));
        }

        Ok(ExtractedText::from_pages(pages))
    }
}

/// Plain text files. Form feeds mark page breaks; a file without any is a
/// single page.
#[derive(Debug, Default)]
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedText, EvalError> {
        let raw = std::fs::read_to_string(path)?;
        let pages = raw.split('\u{000c}').map(str::to_string).collect();
        Ok(ExtractedText::from_pages(pages))
    }
}

/// Dispatches on the file extension.
#[derive(Debug, Default)]
pub struct ExtensionExtractor {
    pdf: LopdfExtractor,
    text: PlainTextExtractor,
}

impl TextExtractor for ExtensionExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedText, EvalError> {
        match extension_of(path).as_deref() {
            Some("pdf") => self.pdf.extract(path),
            Some("txt") | Some("md") => self.text.extract(path),
            other => Err(EvalError::Configuration(format!(
                "unsupported document type {:?}: {}",
                other.unwrap_or(""),
                path.display()
            ))),
        }
    }
}

pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

/// Recursively finds every file with a supported extension, sorted by path.
pub fn discover_documents(folder: &Path) -> Vec<PathBuf> {
    let mut files = WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            extension_of(entry.path())
                .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
        })
        .map(|entry| entry.path().to_path_buf())
        .collect::<Vec<_>>();

    files.sort_unstable();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn plain_text_pages_split_on_form_feed() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("notes.txt");
        fs::write(&path, "First page\u{000c}Second page")?;

        let extracted = ExtensionExtractor::default().extract(&path)?;
        assert_eq!(extracted.pages, vec!["First page", "Second page"]);
        assert_eq!(extracted.full_text, "First page\n\nSecond page\n\n");
        Ok(())
    }

    #[test]
    fn unsupported_extension_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("sheet.xlsx");
        fs::write(&path, b"binary")?;

        let result = ExtensionExtractor::default().extract(&path);
        assert!(matches!(result, Err(EvalError::Configuration(_))));
        Ok(())
    }

    #[test]
    fn broken_pdf_is_a_parse_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.pdf");
        fs::write(&path, b"%PDF-1.4\n%broken")?;

        let result = LopdfExtractor.extract(&path);
        assert!(matches!(result, Err(EvalError::PdfParse(_))));
        Ok(())
    }

    #[test]
    fn discovery_is_recursive_and_filtered() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let nested = dir.path().join("nested");
        fs::create_dir(&nested)?;
        fs::write(dir.path().join("a.pdf"), b"%PDF-1.4")?;
        fs::write(nested.join("b.TXT"), b"text")?;
        fs::write(nested.join("c.png"), b"image")?;

        let files = discover_documents(dir.path());
        assert_eq!(files.len(), 2);
        Ok(())
    }
}
