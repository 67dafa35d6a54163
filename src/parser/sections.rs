use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};

use super::Section;

static BLOCKS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1, h2, h3, h4, h5, h6, p").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Heading { level: u8, text: String },
    Paragraph(String),
}

/// Concatenation of the element's text nodes, each trimmed.
pub fn element_text(element: &ElementRef<'_>) -> String {
    element.text().map(str::trim).collect()
}

/// Headings and paragraphs in document order.
pub fn collect_blocks(document: &Html) -> Vec<Block> {
    document
        .select(&BLOCKS)
        .map(|el| {
            let text = element_text(&el);
            match heading_level(el.value().name()) {
                Some(level) => Block::Heading { level, text },
                None => Block::Paragraph(text),
            }
        })
        .collect()
}

fn heading_level(tag: &str) -> Option<u8> {
    match tag {
        "h1" => Some(1),
        "h2" => Some(2),
        "h3" => Some(3),
        "h4" => Some(4),
        "h5" => Some(5),
        "h6" => Some(6),
        _ => None,
    }
}

/// Every heading opens a section; paragraphs join the open one. Paragraphs before
/// the first heading and empty paragraphs are dropped.
pub fn cluster_sections(blocks: &[Block]) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    let mut current: Option<String> = None;
    let mut paragraphs: Vec<String> = Vec::new();

    for block in blocks {
        match block {
            Block::Heading { text, .. } => {
                if let Some(header) = current.take() {
                    sections.push(Section {
                        header,
                        paragraphs: std::mem::take(&mut paragraphs),
                    });
                }
                current = Some(text.clone());
            }
            Block::Paragraph(text) if current.is_some() && !text.is_empty() => {
                paragraphs.push(text.clone());
            }
            Block::Paragraph(_) => {}
        }
    }

    if let Some(header) = current {
        sections.push(Section { header, paragraphs });
    }

    sections
}
